//! # Symbols
//!
//! Symbol resolution and language-runtime hooks consumed by the engine.
//!
//! Parsing debug information is not this crate's job: a symbol provider
//! implements [`SymbolTable`] for one module (an executable, a shared library,
//! a region of JIT-compiled code) and hands it to the [`SymbolTableManager`].
//!
//! ## Publishing
//!
//! The manager keeps an immutable [`ModuleSet`] snapshot behind an `Arc`.
//! Reloading builds a complete new set (possibly on a background thread) and
//! swaps it in with a single write; readers either see the old set or the new
//! one, never a half-built table. Threads that need symbols before the first
//! load finishes block in [`SymbolTableManager::wait_until_loaded`].
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use sidestep_core::symbols::{ModuleSet, SymbolTableManager};
//!
//! let manager = SymbolTableManager::new();
//! let handle = manager.reload_in_background(|| Ok(ModuleSet::default())).unwrap();
//! assert!(manager.wait_until_loaded(Duration::from_secs(5)));
//! handle.join().unwrap();
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::inferior::TargetAccess;
use crate::types::{Method, SourceMethod, Symbol, TargetAddress};
use crate::unwind::cfi::CfiTable;

/// Address to symbol resolution for one module
pub trait SymbolTable: Send + Sync
{
    /// Method containing `address`, with its line table if known.
    fn lookup(&self, address: TargetAddress) -> Option<Arc<Method>>;

    /// Closest symbol at or below `address` (exactly at it when `exact_match`).
    fn simple_lookup(&self, address: TargetAddress, exact_match: bool) -> Option<Symbol>;

    /// Call frame information covering `address`.
    fn cfi_table(&self, address: TargetAddress) -> Option<Arc<CfiTable>>
    {
        let _ = address;
        None
    }
}

/// Hooks into the managed runtime embedded in the debuggee
///
/// Only needed for targets that JIT-compile code; native-only sessions run
/// without one.
pub trait LanguageBackend: Send + Sync
{
    /// Entry point that compiles the method handle passed as its only argument
    /// and returns the address of the compiled code.
    fn compile_method_func(&self) -> TargetAddress;

    /// Entry point that invokes a compiled method with marshaled arguments.
    ///
    /// Its callback reports `(result, exception)`; a non-zero exception word
    /// means the invoked method threw.
    fn runtime_invoke_func(&self) -> TargetAddress;

    /// The runtime's generic compile trampoline, the jump target of every
    /// specific trampoline stub.
    fn generic_trampoline_address(&self) -> TargetAddress;

    /// Recognize a call into a runtime-managed trampoline.
    ///
    /// Returns `(target, is_start)`: with `is_start` the target is a method
    /// handle that still has to be compiled, otherwise it is the code address
    /// the trampoline will end up in.
    fn get_trampoline_address(&self, memory: &dyn TargetAccess, address: TargetAddress) -> Option<(TargetAddress, bool)>;

    /// The method a trampoline at `address` leads to.
    fn get_trampoline(&self, memory: &dyn TargetAccess, address: TargetAddress) -> Option<SourceMethod>;

    /// Type name of a thrown exception object.
    fn exception_type_name(&self, memory: &dyn TargetAccess, exception: TargetAddress) -> Option<String>
    {
        let _ = (memory, exception);
        None
    }

    /// Message of a thrown exception object.
    fn exception_message(&self, memory: &dyn TargetAccess, exception: TargetAddress) -> Option<String>
    {
        let _ = (memory, exception);
        None
    }
}

/// Immutable snapshot of every loaded module
#[derive(Clone, Default)]
pub struct ModuleSet
{
    modules: Vec<Arc<dyn SymbolTable>>,
    generation: u64,
}

impl fmt::Debug for ModuleSet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ModuleSet")
            .field("modules", &self.modules.len())
            .field("generation", &self.generation)
            .finish()
    }
}

impl ModuleSet
{
    /// Snapshot over `modules`, searched in order.
    #[must_use]
    pub fn new(modules: Vec<Arc<dyn SymbolTable>>) -> Self
    {
        Self { modules, generation: 0 }
    }

    /// Copy of this set with one more module at the end.
    #[must_use]
    pub fn with_module(&self, module: Arc<dyn SymbolTable>) -> Self
    {
        let mut modules = self.modules.clone();
        modules.push(module);
        Self::new(modules)
    }

    /// Loaded modules.
    #[must_use]
    pub fn modules(&self) -> &[Arc<dyn SymbolTable>]
    {
        &self.modules
    }

    /// How many sets were published before this one.
    #[must_use]
    pub fn generation(&self) -> u64
    {
        self.generation
    }
}

impl SymbolTable for ModuleSet
{
    fn lookup(&self, address: TargetAddress) -> Option<Arc<Method>>
    {
        self.modules.iter().find_map(|module| module.lookup(address))
    }

    fn simple_lookup(&self, address: TargetAddress, exact_match: bool) -> Option<Symbol>
    {
        self.modules
            .iter()
            .find_map(|module| module.simple_lookup(address, exact_match))
    }

    fn cfi_table(&self, address: TargetAddress) -> Option<Arc<CfiTable>>
    {
        self.modules.iter().find_map(|module| module.cfi_table(address))
    }
}

#[derive(Default)]
struct Shared
{
    current: RwLock<Arc<ModuleSet>>,
    loaded: Mutex<bool>,
    changed: Condvar,
}

/// Process-wide module registry with swap-and-notify publishing
///
/// Cheap to clone; every engine of a process holds one.
#[derive(Clone, Default)]
pub struct SymbolTableManager
{
    shared: Arc<Shared>,
}

impl fmt::Debug for SymbolTableManager
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SymbolTableManager")
            .field("current", &self.snapshot())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl SymbolTableManager
{
    /// Manager with no modules; not yet loaded.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// The currently published module set.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ModuleSet>
    {
        let current = self.shared.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    /// Publish a new module set and wake everyone waiting for it.
    pub fn publish(&self, mut modules: ModuleSet)
    {
        {
            let mut current = self.shared.current.write().unwrap_or_else(PoisonError::into_inner);
            modules.generation = current.generation + 1;
            tracing::debug!(
                generation = modules.generation,
                modules = modules.modules.len(),
                "publishing symbol tables"
            );
            *current = Arc::new(modules);
        }
        self.set_loaded(true);
    }

    /// Publish the current set plus `module`.
    pub fn add_module(&self, module: Arc<dyn SymbolTable>)
    {
        let next = self.snapshot().with_module(module);
        self.publish(next);
    }

    /// Rebuild the module set on a dedicated thread.
    ///
    /// The previous set stays visible until the loader finishes. A failing
    /// loader is logged and leaves the previous set in place.
    ///
    /// ## Errors
    ///
    /// Returns [`DebuggerError::Io`](crate::DebuggerError::Io) if the thread cannot be spawned.
    pub fn reload_in_background<F>(&self, loader: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<ModuleSet> + Send + 'static,
    {
        self.set_loaded(false);
        let manager = self.clone();
        let handle = thread::Builder::new()
            .name("sidestep-symbols".to_string())
            .spawn(move || match loader() {
                Ok(modules) => manager.publish(modules),
                Err(error) => {
                    tracing::error!("symbol reload failed: {error}");
                    manager.set_loaded(true);
                }
            })?;
        Ok(handle)
    }

    /// Whether the last requested load has finished.
    #[must_use]
    pub fn is_loaded(&self) -> bool
    {
        *self.shared.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a module set is published; returns `false` on timeout.
    #[must_use]
    pub fn wait_until_loaded(&self, timeout: Duration) -> bool
    {
        let loaded = self.shared.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let (loaded, _) = self
            .shared
            .changed
            .wait_timeout_while(loaded, timeout, |loaded| !*loaded)
            .unwrap_or_else(PoisonError::into_inner);
        *loaded
    }

    fn set_loaded(&self, value: bool)
    {
        let mut loaded = self.shared.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        *loaded = value;
        if value {
            self.shared.changed.notify_all();
        }
    }
}

impl SymbolTable for SymbolTableManager
{
    fn lookup(&self, address: TargetAddress) -> Option<Arc<Method>>
    {
        self.snapshot().lookup(address)
    }

    fn simple_lookup(&self, address: TargetAddress, exact_match: bool) -> Option<Symbol>
    {
        self.snapshot().simple_lookup(address, exact_match)
    }

    fn cfi_table(&self, address: TargetAddress) -> Option<Arc<CfiTable>>
    {
        self.snapshot().cfi_table(address)
    }
}
