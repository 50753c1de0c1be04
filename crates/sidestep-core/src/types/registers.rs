//! CPU register snapshots.

use super::{Architecture, TargetAddress};
use crate::arch::register_layout;
use crate::error::{DebuggerError, Result};
use crate::inferior::{encode_word, Inferior};

/// Identifier for a specific CPU register
///
/// The common registers (`Pc`, `Sp`, `Fp`, `Flags`) are resolved through the
/// architecture's register table; `Index` addresses the raw slot directly.
///
/// ## Example
///
/// ```rust
/// use sidestep_core::arch::x86_64;
/// use sidestep_core::types::{Architecture, RegisterId, Registers};
///
/// let mut regs = Registers::new(Architecture::X86_64);
/// regs.set(RegisterId::Index(x86_64::RAX), 42).unwrap();
/// regs.set(RegisterId::Pc, 0x1000).unwrap();
/// assert_eq!(regs.value(RegisterId::Pc), Some(0x1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId
{
    /// Program counter (EIP / RIP / NIP)
    Pc,
    /// Stack pointer (ESP / RSP / r1)
    Sp,
    /// Frame pointer (EBP / RBP / r31)
    Fp,
    /// Status/flags register (EFLAGS / CR)
    Flags,
    /// Raw register slot in the architecture's ordering
    Index(usize),
}

/// One register value with validity and provenance
///
/// During unwinding a register may be unknown (`valid == false`). When its
/// value was recovered from a stack slot, `location` records that slot so the
/// value can be written back into the caller's frame later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register
{
    /// Slot in the architecture's register ordering.
    pub index: usize,
    /// Raw value (meaningless when `valid` is false).
    pub value: u64,
    /// Whether `value` is known.
    pub valid: bool,
    /// Memory location the value was loaded from, if any.
    pub location: Option<TargetAddress>,
}

/// Architecture-sized register file
///
/// Created fresh for every stop event and for every unwound frame; frames never
/// share a `Registers` value mutably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers
{
    architecture: Architecture,
    values: Vec<Register>,
}

impl Registers
{
    /// Create a register file where every register is invalid.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self
    {
        let count = register_layout(architecture).count();
        let values = (0..count)
            .map(|index| Register {
                index,
                value: 0,
                valid: false,
                location: None,
            })
            .collect();
        Self { architecture, values }
    }

    /// Create a register file from raw values in register-table order.
    ///
    /// Missing trailing values stay invalid; extra values are ignored.
    #[must_use]
    pub fn from_values(architecture: Architecture, raw: &[u64]) -> Self
    {
        let mut registers = Self::new(architecture);
        for (slot, value) in registers.values.iter_mut().zip(raw) {
            slot.value = *value;
            slot.valid = true;
        }
        registers
    }

    /// Architecture this register file belongs to.
    #[must_use]
    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Number of register slots.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.values.len()
    }

    /// Whether the register file has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.values.is_empty()
    }

    /// Iterate over all register slots.
    pub fn iter(&self) -> impl Iterator<Item = &Register>
    {
        self.values.iter()
    }

    /// Resolve a register id to its slot index.
    #[must_use]
    pub fn resolve(&self, id: RegisterId) -> usize
    {
        let layout = register_layout(self.architecture);
        match id {
            RegisterId::Pc => layout.pc,
            RegisterId::Sp => layout.sp,
            RegisterId::Fp => layout.fp,
            RegisterId::Flags => layout.flags,
            RegisterId::Index(index) => index,
        }
    }

    /// Full register record for `id`.
    #[must_use]
    pub fn get(&self, id: RegisterId) -> Option<&Register>
    {
        self.values.get(self.resolve(id))
    }

    /// Value of `id` if the register is valid.
    #[must_use]
    pub fn value(&self, id: RegisterId) -> Option<u64>
    {
        self.get(id).filter(|register| register.valid).map(|register| register.value)
    }

    /// Set a register value; the register becomes valid with no memory provenance.
    ///
    /// ## Errors
    ///
    /// Returns [`DebuggerError::NoSuchRegister`] for an out-of-range index.
    pub fn set(&mut self, id: RegisterId, value: u64) -> Result<()>
    {
        self.store(id, value, None)
    }

    /// Set a register value that was recovered from the stack slot `location`.
    ///
    /// ## Errors
    ///
    /// Returns [`DebuggerError::NoSuchRegister`] for an out-of-range index.
    pub fn set_from_memory(&mut self, id: RegisterId, value: u64, location: TargetAddress) -> Result<()>
    {
        self.store(id, value, Some(location))
    }

    /// Mark a register as unknown.
    pub fn invalidate(&mut self, id: RegisterId)
    {
        let index = self.resolve(id);
        if let Some(slot) = self.values.get_mut(index) {
            slot.valid = false;
            slot.location = None;
        }
    }

    /// Program counter value (0 if unknown).
    #[must_use]
    pub fn pc(&self) -> u64
    {
        self.value(RegisterId::Pc).unwrap_or(0)
    }

    /// Stack pointer value (0 if unknown).
    #[must_use]
    pub fn sp(&self) -> u64
    {
        self.value(RegisterId::Sp).unwrap_or(0)
    }

    /// Frame pointer value (0 if unknown).
    #[must_use]
    pub fn fp(&self) -> u64
    {
        self.value(RegisterId::Fp).unwrap_or(0)
    }

    /// Write every register recovered from a stack slot back to that slot.
    ///
    /// Used after modifying a caller frame's registers so the change becomes
    /// visible once the callee returns. Registers without provenance are skipped.
    ///
    /// ## Errors
    ///
    /// The first failing memory write.
    pub fn write_back(&self, memory: &mut dyn Inferior) -> Result<()>
    {
        let size = usize::from(self.architecture.pointer_size_bytes());
        let big_endian = self.architecture.is_big_endian();
        for register in self.values.iter().filter(|register| register.valid) {
            if let Some(location) = register.location {
                memory.write_buffer(location, &encode_word(register.value, size, big_endian))?;
            }
        }
        Ok(())
    }

    fn store(&mut self, id: RegisterId, value: u64, location: Option<TargetAddress>) -> Result<()>
    {
        let index = self.resolve(id);
        let slot = self.values.get_mut(index).ok_or(DebuggerError::NoSuchRegister(index))?;
        slot.value = value;
        slot.valid = true;
        slot.location = location;
        Ok(())
    }
}
