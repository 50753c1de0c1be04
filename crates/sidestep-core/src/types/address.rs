//! Target address type with address-space domains.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

use crate::error::{DebuggerError, Result};

/// Tag distinguishing independent address spaces.
///
/// A forked child and its parent, or a core file's static image and the live
/// process, can map different bytes at the same numeric address. Addresses
/// carry their domain so that such values are never mixed by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressDomain(u32);

impl AddressDomain
{
    const GLOBAL: u32 = 0;
    const CORE_FILE: u32 = u32::MAX;

    /// Domain used when no more specific address space applies.
    #[must_use]
    pub const fn global() -> Self
    {
        Self(Self::GLOBAL)
    }

    /// Domain of a live process, keyed by a caller-chosen process index.
    #[must_use]
    pub const fn process(index: u32) -> Self
    {
        Self(index.saturating_add(1))
    }

    /// Domain of a core file's static address space.
    #[must_use]
    pub const fn core_file() -> Self
    {
        Self(Self::CORE_FILE)
    }

    /// Raw domain tag.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }
}

impl fmt::Display for AddressDomain
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.0 {
            Self::GLOBAL => write!(f, "global"),
            Self::CORE_FILE => write!(f, "core"),
            index => write!(f, "process#{}", index - 1),
        }
    }
}

/// An address in the debuggee paired with its address domain
///
/// Immutable value type. Arithmetic with plain offsets always stays inside the
/// domain; comparing or subtracting two addresses is only meaningful within one
/// domain, so [`PartialOrd`] returns `None` across domains and
/// [`TargetAddress::offset_from`] fails with
/// [`DebuggerError::AddressDomainMismatch`].
///
/// ## Example
///
/// ```rust
/// use sidestep_core::types::TargetAddress;
///
/// let addr = TargetAddress::global(0x1000);
/// let next = addr + 0x10;
/// assert_eq!(next.value(), 0x1010);
/// assert_eq!(next.offset_from(addr).unwrap(), 0x10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetAddress
{
    domain: AddressDomain,
    address: u64,
}

impl TargetAddress
{
    /// Create an address inside `domain`.
    #[must_use]
    pub const fn new(domain: AddressDomain, address: u64) -> Self
    {
        Self { domain, address }
    }

    /// Create an address in the global domain.
    #[must_use]
    pub const fn global(address: u64) -> Self
    {
        Self::new(AddressDomain::global(), address)
    }

    /// The null address of `domain`.
    #[must_use]
    pub const fn null(domain: AddressDomain) -> Self
    {
        Self::new(domain, 0)
    }

    /// Whether this is the null address.
    #[must_use]
    pub const fn is_null(self) -> bool
    {
        self.address == 0
    }

    /// Raw numeric address.
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.address
    }

    /// Address domain tag.
    #[must_use]
    pub const fn domain(self) -> AddressDomain
    {
        self.domain
    }

    /// Another address in the same domain.
    #[must_use]
    pub const fn with_value(self, address: u64) -> Self
    {
        Self::new(self.domain, address)
    }

    /// Add a signed displacement, wrapping like the hardware does.
    #[must_use]
    pub const fn offset(self, displacement: i64) -> Self
    {
        self.with_value(self.address.wrapping_add(displacement as u64))
    }

    /// Add an offset, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.address.checked_add(offset).map(|value| self.with_value(value))
    }

    /// Signed distance `self - other`.
    ///
    /// ## Errors
    ///
    /// Fails when the two addresses live in different domains.
    pub fn offset_from(self, other: Self) -> Result<i64>
    {
        if self.domain != other.domain {
            return Err(DebuggerError::AddressDomainMismatch(self, other));
        }
        Ok(self.address.wrapping_sub(other.address) as i64)
    }

    /// Whether `self` lies in the half-open range `[start, end)` of the same domain.
    #[must_use]
    pub fn is_in_range(self, start: Self, end: Self) -> bool
    {
        self.domain == start.domain && self.domain == end.domain && start.address <= self.address && self.address < end.address
    }
}

impl PartialOrd for TargetAddress
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering>
    {
        if self.domain == other.domain {
            Some(self.address.cmp(&other.address))
        } else {
            None
        }
    }
}

impl fmt::Display for TargetAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:08x}", self.address)
    }
}

impl Add<u64> for TargetAddress
{
    type Output = TargetAddress;

    fn add(self, rhs: u64) -> Self::Output
    {
        self.with_value(self.address.wrapping_add(rhs))
    }
}

impl Sub<u64> for TargetAddress
{
    type Output = TargetAddress;

    fn sub(self, rhs: u64) -> Self::Output
    {
        self.with_value(self.address.wrapping_sub(rhs))
    }
}
