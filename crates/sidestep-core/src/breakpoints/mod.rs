//! # Breakpoint Manager
//!
//! Process-wide registry of installed breakpoints.
//!
//! Every engine of a process holds a clone of the same [`BreakpointManager`];
//! the registry behind it is a single mutex-protected table. Native patching
//! (writing the trap instruction, programming a debug register) is done by the
//! [`Inferior`] passed into each mutating call, while the table lock is held,
//! so the registry and the native breakpoint table never disagree about which
//! ids exist.
//!
//! ## Ownership
//!
//! Each entry carries a numeric owner tag. User breakpoints are owned by
//! nobody (`ThreadId(0)`); temporary breakpoints used to implement "step over
//! this call" or "run to address" are owned by the thread that installed them,
//! so another thread hitting one steps over it transparently.

pub mod builder;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use builder::{Breakpoint, BreakpointBuilder, BreakpointCondition, ThreadGroup};
use smallvec::SmallVec;

use crate::error::{poisoned, DebuggerError, Result};
use crate::inferior::Inferior;
use crate::types::{TargetAddress, ThreadId};

/// Unique identifier for an installed breakpoint.
///
/// Ids are handed out by the native backend and are always > 0;
/// [`BreakpointId::UNKNOWN`] means "no breakpoint, or one the backend could
/// not identify".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(u32);

impl BreakpointId
{
    /// The reserved "no / unknown breakpoint" id.
    pub const UNKNOWN: Self = Self(0);

    /// Create an identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self
    {
        Self(value)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u32
    {
        self.0
    }

    /// Whether this is [`BreakpointId::UNKNOWN`].
    #[must_use]
    pub const fn is_unknown(self) -> bool
    {
        self.0 == 0
    }
}

impl fmt::Display for BreakpointId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// How a breakpoint is implemented natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind
{
    /// Trap instruction patched into the code.
    Software,
    /// CPU debug register.
    Hardware
    {
        /// Debug register slot.
        index: u32
    },
}

/// Registry entry for one installed breakpoint.
#[derive(Debug, Clone)]
pub struct BreakpointInfo
{
    /// Native id.
    pub id: BreakpointId,
    /// Installed address.
    pub address: TargetAddress,
    /// Native implementation.
    pub kind: BreakpointKind,
    /// Owning thread, or `ThreadId(0)` for process-wide breakpoints.
    pub owner: ThreadId,
    /// Whether the trap is currently armed.
    pub enabled: bool,
    /// Engine-internal breakpoint that is removed as soon as it is hit.
    pub temporary: bool,
    /// The user-level breakpoint, absent for engine-internal ones.
    pub breakpoint: Option<Arc<Breakpoint>>,
}

impl BreakpointInfo
{
    /// Whether a hit by `thread` is this thread's business.
    ///
    /// Foreign hits must be stepped over without stopping.
    #[must_use]
    pub fn applies_to(&self, thread: ThreadId) -> bool
    {
        let owned = self.owner.raw() == 0 || self.owner == thread;
        owned
            && self
                .breakpoint
                .as_ref()
                .map_or(true, |breakpoint| breakpoint.applies_to(thread))
    }
}

/// Stop when the runtime throws an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionCatchpoint
{
    /// Catchpoint number.
    pub index: u32,
    /// Exception type to catch; `None` catches everything.
    pub type_name: Option<String>,
}

impl ExceptionCatchpoint
{
    /// Whether an exception of `type_name` triggers this catchpoint.
    #[must_use]
    pub fn matches(&self, type_name: Option<&str>) -> bool
    {
        match (&self.type_name, type_name) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Default)]
struct BreakpointTable
{
    by_id: HashMap<BreakpointId, BreakpointInfo>,
    by_address: HashMap<TargetAddress, SmallVec<[BreakpointId; 2]>>,
    catchpoints: Vec<ExceptionCatchpoint>,
    next_catchpoint: u32,
}

impl BreakpointTable
{
    fn remove(&mut self, id: BreakpointId) -> Option<BreakpointInfo>
    {
        let info = self.by_id.remove(&id)?;
        if let Some(ids) = self.by_address.get_mut(&info.address) {
            ids.retain(|candidate| *candidate != id);
            if ids.is_empty() {
                self.by_address.remove(&info.address);
            }
        }
        Some(info)
    }
}

/// Shared, lock-protected breakpoint registry
///
/// Cheap to clone; all clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct BreakpointManager
{
    table: Arc<Mutex<BreakpointTable>>,
}

impl BreakpointManager
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BreakpointTable>>
    {
        self.table.lock().map_err(poisoned)
    }

    /// Lookups keep working on a poisoned table; every mutation leaves it consistent.
    fn read(&self) -> MutexGuard<'_, BreakpointTable>
    {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a software breakpoint at `address` and register it.
    ///
    /// ## Errors
    ///
    /// Propagates the backend's insertion error, and returns
    /// [`DebuggerError::Internal`] if the backend hands out id 0 or an id that
    /// is already registered.
    pub fn insert_breakpoint(
        &self,
        inferior: &mut dyn Inferior,
        breakpoint: Option<Arc<Breakpoint>>,
        address: TargetAddress,
        owner: ThreadId,
    ) -> Result<BreakpointId>
    {
        self.insert(inferior, breakpoint, address, owner, BreakpointKind::Software, false)
    }

    /// Install a hardware breakpoint in debug register `index`.
    ///
    /// ## Errors
    ///
    /// Same as [`BreakpointManager::insert_breakpoint`].
    pub fn insert_hardware_breakpoint(
        &self,
        inferior: &mut dyn Inferior,
        breakpoint: Option<Arc<Breakpoint>>,
        address: TargetAddress,
        index: u32,
    ) -> Result<BreakpointId>
    {
        self.insert(
            inferior,
            breakpoint,
            address,
            ThreadId(0),
            BreakpointKind::Hardware { index },
            false,
        )
    }

    /// Install an engine-internal breakpoint owned by `owner`.
    ///
    /// ## Errors
    ///
    /// Same as [`BreakpointManager::insert_breakpoint`].
    pub fn insert_temporary(&self, inferior: &mut dyn Inferior, address: TargetAddress, owner: ThreadId) -> Result<BreakpointId>
    {
        self.insert(inferior, None, address, owner, BreakpointKind::Software, true)
    }

    fn insert(
        &self,
        inferior: &mut dyn Inferior,
        breakpoint: Option<Arc<Breakpoint>>,
        address: TargetAddress,
        owner: ThreadId,
        kind: BreakpointKind,
        temporary: bool,
    ) -> Result<BreakpointId>
    {
        let mut table = self.lock()?;
        let id = match kind {
            BreakpointKind::Software => inferior.insert_breakpoint(address)?,
            BreakpointKind::Hardware { index } => inferior.insert_hardware_breakpoint(address, index)?,
        };
        if id.is_unknown() || table.by_id.contains_key(&id) {
            // A registered id still names a live breakpoint; only an unregistered one is undone.
            if !table.by_id.contains_key(&id) {
                if let Err(error) = inferior.remove_breakpoint(id) {
                    tracing::warn!(%id, %address, "failed to undo rejected breakpoint: {error}");
                }
            }
            return Err(DebuggerError::Internal(format!("backend returned unusable breakpoint id {id}")));
        }

        table.by_address.entry(address).or_default().push(id);
        table.by_id.insert(
            id,
            BreakpointInfo {
                id,
                address,
                kind,
                owner,
                enabled: true,
                temporary,
                breakpoint,
            },
        );
        tracing::debug!(%id, %address, %owner, temporary, "inserted breakpoint");
        Ok(id)
    }

    /// Remove a breakpoint.
    ///
    /// Removing an unknown id is a no-op. The registry entry goes first; a
    /// failure to restore the original instruction is logged, not returned.
    ///
    /// ## Errors
    ///
    /// Only fails if the registry lock is poisoned.
    pub fn remove_breakpoint(&self, inferior: &mut dyn Inferior, id: BreakpointId) -> Result<()>
    {
        let mut table = self.lock()?;
        let Some(info) = table.remove(id) else {
            tracing::debug!(%id, "breakpoint already removed");
            return Ok(());
        };
        if let Err(error) = inferior.remove_breakpoint(id) {
            tracing::warn!("failed to remove breakpoint {id} at {}: {error}", info.address);
        }
        tracing::debug!(%id, address = %info.address, "removed breakpoint");
        Ok(())
    }

    /// Re-arm a disabled breakpoint.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NoSuchBreakpoint`] for an unknown id, or the backend's error.
    pub fn enable_breakpoint(&self, inferior: &mut dyn Inferior, id: BreakpointId) -> Result<()>
    {
        self.set_enabled(inferior, id, true)
    }

    /// Disarm a breakpoint without forgetting it.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NoSuchBreakpoint`] for an unknown id, or the backend's error.
    pub fn disable_breakpoint(&self, inferior: &mut dyn Inferior, id: BreakpointId) -> Result<()>
    {
        self.set_enabled(inferior, id, false)
    }

    fn set_enabled(&self, inferior: &mut dyn Inferior, id: BreakpointId, enabled: bool) -> Result<()>
    {
        let mut table = self.lock()?;
        let info = table.by_id.get_mut(&id).ok_or(DebuggerError::NoSuchBreakpoint(id))?;
        if info.enabled == enabled {
            return Ok(());
        }
        if enabled {
            inferior.enable_breakpoint(id)?;
        } else {
            inferior.disable_breakpoint(id)?;
        }
        info.enabled = enabled;
        tracing::trace!(%id, enabled, "toggled breakpoint");
        Ok(())
    }

    /// Breakpoint installed at `address` and its owner.
    ///
    /// When several are installed at the same address an enabled one wins.
    #[must_use]
    pub fn lookup_by_address(&self, address: TargetAddress) -> Option<(BreakpointId, ThreadId)>
    {
        let table = self.read();
        let ids = table.by_address.get(&address)?;
        let mut entries = ids.iter().filter_map(|id| table.by_id.get(id));
        let first = entries.clone().find(|info| info.enabled).or_else(|| entries.next())?;
        Some((first.id, first.owner))
    }

    /// The user-level breakpoint behind `id` and whether it is enabled.
    #[must_use]
    pub fn lookup(&self, id: BreakpointId) -> Option<(Option<Arc<Breakpoint>>, bool)>
    {
        let table = self.read();
        table
            .by_id
            .get(&id)
            .map(|info| (info.breakpoint.clone(), info.enabled))
    }

    /// Every id installed at `address`.
    #[must_use]
    pub fn ids_at(&self, address: TargetAddress) -> SmallVec<[BreakpointId; 2]>
    {
        self.read().by_address.get(&address).cloned().unwrap_or_default()
    }

    /// An enabled breakpoint at `address`, if any.
    #[must_use]
    pub fn enabled_at(&self, address: TargetAddress) -> Option<BreakpointId>
    {
        let table = self.read();
        table
            .by_address
            .get(&address)?
            .iter()
            .find(|id| table.by_id.get(*id).is_some_and(|info| info.enabled))
            .copied()
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: BreakpointId) -> bool
    {
        self.read().by_id.contains_key(&id)
    }

    /// Registry entry for `id`.
    #[must_use]
    pub fn info(&self, id: BreakpointId) -> Option<BreakpointInfo>
    {
        self.read().by_id.get(&id).cloned()
    }

    /// All registry entries, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<BreakpointInfo>
    {
        let mut entries: Vec<_> = self.read().by_id.values().cloned().collect();
        entries.sort_by_key(|info| info.id);
        entries
    }

    /// Number of registered breakpoints.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.read().by_id.len()
    }

    /// Whether no breakpoint is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.read().by_id.is_empty()
    }

    /// Remove every breakpoint, e.g. before detaching.
    ///
    /// ## Errors
    ///
    /// Only fails if the registry lock is poisoned.
    pub fn remove_all(&self, inferior: &mut dyn Inferior) -> Result<()>
    {
        let mut table = self.lock()?;
        table.by_address.clear();
        for (id, info) in table.by_id.drain() {
            if let Err(error) = inferior.remove_breakpoint(id) {
                tracing::warn!("failed to remove breakpoint {id} at {}: {error}", info.address);
            }
        }
        Ok(())
    }

    /// Register an exception catchpoint; returns its number.
    ///
    /// ## Errors
    ///
    /// Only fails if the registry lock is poisoned.
    pub fn add_catchpoint(&self, type_name: Option<String>) -> Result<u32>
    {
        let mut table = self.lock()?;
        table.next_catchpoint += 1;
        let index = table.next_catchpoint;
        table.catchpoints.push(ExceptionCatchpoint { index, type_name });
        Ok(index)
    }

    /// Remove an exception catchpoint; returns whether it existed.
    ///
    /// ## Errors
    ///
    /// Only fails if the registry lock is poisoned.
    pub fn remove_catchpoint(&self, index: u32) -> Result<bool>
    {
        let mut table = self.lock()?;
        let before = table.catchpoints.len();
        table.catchpoints.retain(|catchpoint| catchpoint.index != index);
        Ok(table.catchpoints.len() != before)
    }

    /// First catchpoint matching an exception of `type_name`.
    #[must_use]
    pub fn matching_catchpoint(&self, type_name: Option<&str>) -> Option<ExceptionCatchpoint>
    {
        self.read()
            .catchpoints
            .iter()
            .find(|catchpoint| catchpoint.matches(type_name))
            .cloned()
    }

    /// Whether any catchpoint is registered.
    #[must_use]
    pub fn has_catchpoints(&self) -> bool
    {
        !self.read().catchpoints.is_empty()
    }
}

/// A user breakpoint installed at one address
///
/// Remembers which registry entry it created so it can remove it again.
#[derive(Debug, Clone)]
pub struct BreakpointHandle
{
    breakpoint: Arc<Breakpoint>,
    id: BreakpointId,
    address: TargetAddress,
}

impl BreakpointHandle
{
    /// Install `breakpoint` at `address`.
    ///
    /// ## Errors
    ///
    /// Same as [`BreakpointManager::insert_breakpoint`].
    pub fn insert(
        manager: &BreakpointManager,
        inferior: &mut dyn Inferior,
        breakpoint: Arc<Breakpoint>,
        address: TargetAddress,
    ) -> Result<Self>
    {
        let id = manager.insert_breakpoint(inferior, Some(Arc::clone(&breakpoint)), address, ThreadId(0))?;
        Ok(Self { breakpoint, id, address })
    }

    /// Registry id.
    #[must_use]
    pub fn id(&self) -> BreakpointId
    {
        self.id
    }

    /// Installed address.
    #[must_use]
    pub fn address(&self) -> TargetAddress
    {
        self.address
    }

    /// The user-level breakpoint.
    #[must_use]
    pub fn breakpoint(&self) -> &Arc<Breakpoint>
    {
        &self.breakpoint
    }

    /// Remove the breakpoint from the registry and the target.
    ///
    /// ## Errors
    ///
    /// Only fails if the registry lock is poisoned.
    pub fn remove(self, manager: &BreakpointManager, inferior: &mut dyn Inferior) -> Result<()>
    {
        manager.remove_breakpoint(inferior, self.id)
    }
}
