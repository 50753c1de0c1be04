//! # Single-Stepping Engine
//!
//! One [`SteppingEngine`] drives one OS thread of the debuggee. Every command
//! (step a line, finish, continue, call a function in the target) becomes a
//! tree of [`Operation`]s kept as a stack, innermost last. Raw stops reported
//! by the backend are fed back through [`SteppingEngine::process_event`];
//! the innermost operation decides whether it is satisfied, wants the thread
//! resumed, needs a helper operation pushed first, or does not own the event
//! at all and hands it to its parent.
//!
//! A command ends in exactly one [`TargetEventArgs`]: returned directly when
//! the command finished without resuming the target, or returned from the
//! `process_event` call that saw the completing stop.
//!
//! Engines never talk to each other directly. Anything that involves the
//! other threads (the global thread lock, new threads) goes through the
//! [`ThreadCoordinator`] passed into every call.

pub mod operation;
pub mod step_frame;

use std::fmt;
use std::sync::Arc;

pub use operation::{
    CallMethod, CompileMethod, CompileStage, EventResult, ExceptionStop, InsertBreakpoint, InvokeStage, Operation,
    OperationKind, RunOperation, RuntimeInvoke, RuntimeInvokeResult, SavedState, StepOperation, StepOverBreakpoint,
};
pub use step_frame::{StepFrame, StepMode};

use crate::arch::{ArchitectureDecoder, Decoded};
use crate::breakpoints::{Breakpoint, BreakpointId, BreakpointManager};
use crate::config::EngineConfig;
use crate::error::{DebuggerError, Result};
use crate::events::{TargetEventArgs, TargetEventType};
use crate::inferior::{ChildEvent, Inferior, RawFrame, TargetAccess};
use crate::process::Completion;
use crate::symbols::{LanguageBackend, SymbolTable, SymbolTableManager};
use crate::types::{
    AddressDomain, Architecture, Backtrace, MemoryRegion, Method, RegisterId, Registers, SimpleStackFrame, StackFrame,
    TargetAddress, ThreadId,
};
use crate::unwind::Unwinder;

/// Everything an engine needs besides its thread
///
/// Cloned into every engine of a process; the breakpoint registry and the
/// symbol tables are shared between the clones.
#[derive(Clone)]
pub struct EngineContext
{
    /// Instruction decoder and unwinder for the target architecture.
    pub decoder: ArchitectureDecoder,
    /// Process-wide breakpoint registry.
    pub breakpoints: BreakpointManager,
    /// Symbol tables.
    pub symbols: SymbolTableManager,
    /// Runtime hooks for managed code, if the target embeds a runtime.
    pub language: Option<Arc<dyn LanguageBackend>>,
    /// Tunables.
    pub config: Arc<EngineConfig>,
}

impl EngineContext
{
    /// A context for `architecture` with empty registries.
    #[must_use]
    pub fn new(architecture: Architecture, config: EngineConfig) -> Self
    {
        let decoder = ArchitectureDecoder::with_signatures(architecture, config.signatures_for(architecture));
        Self {
            decoder,
            breakpoints: BreakpointManager::new(),
            symbols: SymbolTableManager::new(),
            language: None,
            config: Arc::new(config),
        }
    }

    /// Use `symbols` instead of an empty symbol table.
    #[must_use]
    pub fn with_symbols(mut self, symbols: SymbolTableManager) -> Self
    {
        self.symbols = symbols;
        self
    }

    /// Share an existing breakpoint registry.
    #[must_use]
    pub fn with_breakpoints(mut self, breakpoints: BreakpointManager) -> Self
    {
        self.breakpoints = breakpoints;
        self
    }

    /// Enable trampolines, runtime invocation and exception catchpoints.
    #[must_use]
    pub fn with_language(mut self, language: Arc<dyn LanguageBackend>) -> Self
    {
        self.language = Some(language);
        self
    }
}

impl fmt::Debug for EngineContext
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("EngineContext")
            .field("architecture", &self.decoder.architecture())
            .field("breakpoints", &self.breakpoints.len())
            .field("language", &self.language.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// What a [`ThreadCoordinator`] did with a raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorAction
{
    /// Not the coordinator's business; the engine handles it.
    Ignored,
    /// Consumed. With `resume`, the engine repeats its last directive.
    Handled
    {
        /// Resume the reporting thread.
        resume: bool
    },
}

/// The process-level side of thread coordination, as seen by one engine
pub trait ThreadCoordinator
{
    /// Stop every other thread and take the global thread lock for `caller`.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::RecursiveThreadLock`] if `caller` already holds it.
    fn acquire_global_thread_lock(&mut self, caller: ThreadId) -> Result<()>;

    /// Resume the other threads and give the lock back.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::Internal`] if `caller` does not hold the lock.
    fn release_global_thread_lock(&mut self, caller: ThreadId) -> Result<()>;

    /// Whether `caller` currently holds the lock.
    fn holds_global_thread_lock(&self, caller: ThreadId) -> bool;

    /// Look at an event before the engine does.
    ///
    /// ## Errors
    ///
    /// Failures while registering a new thread.
    fn handle_child_event(
        &mut self,
        thread: ThreadId,
        inferior: &mut dyn Inferior,
        event: &ChildEvent,
    ) -> Result<CoordinatorAction>;
}

/// Lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState
{
    /// Stopped, accepting commands.
    Idle,
    /// An operation tree is in flight.
    Busy,
    /// The thread is gone.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive
{
    Step,
    Continue,
}

#[derive(Debug)]
struct ThreadLockStash
{
    was_running: bool,
    pending: Option<ChildEvent>,
}

#[derive(Debug, Clone, Copy)]
enum Trigger<'e>
{
    Execute,
    Event(&'e ChildEvent),
    ChildCompleted,
}

enum BreakpointAction
{
    PlainStop,
    Report(TargetEventArgs),
    StepOver(Operation),
}

/// Read-only view of an inferior for the decoder and the unwinder.
struct TargetView<'a>(&'a dyn Inferior);

impl TargetAccess for TargetView<'_>
{
    fn architecture(&self) -> Architecture
    {
        self.0.architecture()
    }

    fn address_domain(&self) -> AddressDomain
    {
        self.0.address_domain()
    }

    fn read_buffer(&self, address: TargetAddress, size: usize) -> Result<Vec<u8>>
    {
        self.0.read_buffer(address, size)
    }

    fn get_registers(&self) -> Result<Registers>
    {
        self.0.get_registers()
    }

    fn read_address(&self, address: TargetAddress) -> Result<TargetAddress>
    {
        self.0.read_address(address)
    }
}

/// Per-thread stepping state machine
///
/// All methods run on the engine thread. Commands return
/// `Ok(Some(event))` when they finished synchronously and `Ok(None)` when
/// the thread was resumed; in that case the final event comes out of a later
/// [`SteppingEngine::process_event`] call.
pub struct SteppingEngine
{
    thread: ThreadId,
    is_main: bool,
    inferior: Box<dyn Inferior>,
    context: EngineContext,
    state: EngineState,
    operations: Vec<Operation>,
    last_directive: Option<Directive>,
    temp_breakpoint: Option<(BreakpointId, TargetAddress)>,
    current_frame: Option<StackFrame>,
    current_backtrace: Option<Backtrace>,
    tree_mode: Option<StepMode>,
    stop_requested: bool,
    pending_interrupt: bool,
    thread_lock: Option<ThreadLockStash>,
    reached_main_teardown: bool,
    main_return_address: Option<TargetAddress>,
    next_callback_id: u64,
}

impl fmt::Debug for SteppingEngine
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SteppingEngine")
            .field("thread", &self.thread)
            .field("state", &self.state)
            .field("operations", &self.operation_kinds())
            .field("temp_breakpoint", &self.temp_breakpoint)
            .field("thread_locked", &self.thread_lock.is_some())
            .finish_non_exhaustive()
    }
}

impl SteppingEngine
{
    /// An idle engine for the thread behind `inferior`.
    #[must_use]
    pub fn new(inferior: Box<dyn Inferior>, context: EngineContext, is_main: bool) -> Self
    {
        Self {
            thread: inferior.thread_id(),
            is_main,
            inferior,
            context,
            state: EngineState::Idle,
            operations: Vec::new(),
            last_directive: None,
            temp_breakpoint: None,
            current_frame: None,
            current_backtrace: None,
            tree_mode: None,
            stop_requested: false,
            pending_interrupt: false,
            thread_lock: None,
            reached_main_teardown: false,
            main_return_address: None,
            next_callback_id: 1,
        }
    }

    /// The thread this engine drives.
    #[must_use]
    pub fn thread(&self) -> ThreadId
    {
        self.thread
    }

    /// Whether this is the process's initial thread.
    #[must_use]
    pub fn is_main(&self) -> bool
    {
        self.is_main
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState
    {
        self.state
    }

    /// Shared registries and tunables.
    #[must_use]
    pub fn context(&self) -> &EngineContext
    {
        &self.context
    }

    /// The backend for this thread.
    #[must_use]
    pub fn inferior(&self) -> &dyn Inferior
    {
        self.inferior.as_ref()
    }

    /// Kinds of the in-flight operations, outermost first.
    #[must_use]
    pub fn operation_kinds(&self) -> Vec<OperationKind>
    {
        self.operations.iter().map(Operation::kind).collect()
    }

    /// The engine-internal breakpoint currently installed, if any.
    #[must_use]
    pub fn temporary_breakpoint(&self) -> Option<BreakpointId>
    {
        self.temp_breakpoint.map(|(id, _)| id)
    }

    /// Whether another engine froze this one.
    #[must_use]
    pub fn is_thread_locked(&self) -> bool
    {
        self.thread_lock.is_some()
    }

    /// Outermost return address seen when the main thread started to exit.
    #[must_use]
    pub fn main_return_address(&self) -> Option<TargetAddress>
    {
        self.main_return_address
    }

    /// The frame reported by the last stop, if still valid.
    #[must_use]
    pub fn current_frame(&self) -> Option<&StackFrame>
    {
        self.current_frame.as_ref()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Step one instruction, following calls through runtime trampolines.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn step_instruction(&mut self, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        self.instruction_step(StepMode::SingleInstruction, coordinator)
    }

    /// Step exactly one machine instruction.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn step_native_instruction(
        &mut self,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        self.instruction_step(StepMode::NativeInstruction, coordinator)
    }

    /// Step one instruction, treating a call as a single instruction.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn next_instruction(&mut self, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        self.instruction_step(StepMode::NextInstruction, coordinator)
    }

    /// Step one source line, entering calls into code with source.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn step_line(&mut self, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        self.line_step(StepMode::SourceLine, coordinator)
    }

    /// Step one source line, stepping over calls.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn next_line(&mut self, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        self.line_step(StepMode::NextLine, coordinator)
    }

    /// Run until the current method returns to its caller.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle, and
    /// [`DebuggerError::InvalidArgument`] when the current address belongs to
    /// no known method.
    pub fn finish(&mut self, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        self.ensure_idle()?;
        let frame = self.frame()?;
        let method = frame.method.clone().ok_or_else(|| {
            DebuggerError::InvalidArgument(format!("no method at {}, use finish_native", frame.address()))
        })?;
        let return_address = self.return_address_of(&frame.simple);
        let step_frame = StepFrame::range(
            method.start,
            method.end,
            Some(frame.simple.clone()),
            self.context.language.clone(),
            StepMode::Finish,
        );
        let operation = StepOperation::new(step_frame).with_return_address(return_address);
        self.start_operation(Operation::Step(operation), coordinator)
    }

    /// Run until the stack pointer rises above the current native frame.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn finish_native(&mut self, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        self.ensure_idle()?;
        let frame = self.frame()?;
        let return_address = self.return_address_of(&frame.simple);
        let step_frame = StepFrame::range(
            frame.address(),
            frame.address(),
            Some(frame.simple.clone()),
            self.context.language.clone(),
            StepMode::FinishNative,
        );
        let operation = StepOperation::new(step_frame).with_return_address(return_address);
        self.start_operation(Operation::Step(operation), coordinator)
    }

    /// Resume the thread until a breakpoint, or until `until` is reached.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn continue_to(
        &mut self,
        until: Option<TargetAddress>,
        in_background: bool,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        self.start_operation(Operation::Run(RunOperation { until, in_background }), coordinator)
    }

    /// Invoke a managed method through the runtime.
    ///
    /// With `needs_compile`, `method` is a method handle that is compiled
    /// first; otherwise it is already code. The outcome is delivered through
    /// `result`; the command's own event is the stop once the call returned,
    /// with the thread's state restored.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::InvalidArgument`] without a language backend, and
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn runtime_invoke(
        &mut self,
        method: TargetAddress,
        object: TargetAddress,
        arguments: Vec<u64>,
        needs_compile: bool,
        result: Completion<RuntimeInvokeResult>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        self.language()?;
        let stage = if needs_compile {
            InvokeStage::Compiling
        } else {
            InvokeStage::Invoking
        };
        let invoke = RuntimeInvoke {
            method,
            object,
            arguments,
            stage,
            callback_id: 0,
            saved: None,
            acquired_lock: false,
            result,
        };
        self.start_operation(Operation::RuntimeInvoke(invoke), coordinator)
    }

    /// Call a native function with integer arguments.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn call_method(
        &mut self,
        method: TargetAddress,
        arguments: Vec<u64>,
        result: Completion<Option<u64>>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        let call = CallMethod {
            method,
            arguments,
            callback_id: 0,
            saved: None,
            acquired_lock: false,
            result,
        };
        self.start_operation(Operation::CallMethod(call), coordinator)
    }

    /// Compile the method behind `handle` and break at the start of its body.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::InvalidArgument`] without a language backend, and
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn insert_breakpoint_via_compile(
        &mut self,
        handle: TargetAddress,
        breakpoint: Arc<Breakpoint>,
        result: Completion<Option<BreakpointId>>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        self.language()?;
        let insert = InsertBreakpoint {
            handle,
            breakpoint,
            callback_id: 0,
            saved: None,
            result,
        };
        self.start_operation(Operation::InsertBreakpoint(insert), coordinator)
    }

    /// Install a process-wide user breakpoint.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle, and the
    /// backend's insertion error.
    pub fn insert_breakpoint(&mut self, breakpoint: Arc<Breakpoint>, address: TargetAddress) -> Result<BreakpointId>
    {
        self.ensure_idle()?;
        self.context
            .breakpoints
            .insert_breakpoint(self.inferior.as_mut(), Some(breakpoint), address, ThreadId(0))
    }

    /// Install a user breakpoint in debug register `index`.
    ///
    /// ## Errors
    ///
    /// Same as [`SteppingEngine::insert_breakpoint`].
    pub fn insert_hardware_breakpoint(
        &mut self,
        breakpoint: Arc<Breakpoint>,
        address: TargetAddress,
        index: u32,
    ) -> Result<BreakpointId>
    {
        self.ensure_idle()?;
        self.context
            .breakpoints
            .insert_hardware_breakpoint(self.inferior.as_mut(), Some(breakpoint), address, index)
    }

    /// Remove a breakpoint; removing an unknown id is a no-op.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<()>
    {
        self.ensure_idle()?;
        self.context.breakpoints.remove_breakpoint(self.inferior.as_mut(), id)
    }

    /// Interrupt the running operation.
    ///
    /// Returns `true` when an interrupt was sent. The stop itself is reported
    /// by the event that follows, which also unwinds the operation tree.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NoTarget`] once the thread is gone.
    pub fn stop(&mut self) -> Result<bool>
    {
        match self.state {
            EngineState::Dead => Err(DebuggerError::NoTarget),
            EngineState::Idle => Ok(false),
            EngineState::Busy => {
                if self.thread_lock.is_some() {
                    tracing::debug!(thread = %self.thread, "not interrupting a thread-locked engine");
                    return Ok(false);
                }
                self.stop_requested = true;
                let interrupted = self.inferior.stop()?;
                self.pending_interrupt |= interrupted;
                tracing::debug!(thread = %self.thread, interrupted, "stop requested");
                Ok(interrupted)
            }
        }
    }

    /// Set one register of the stopped thread.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NoSuchRegister`] for an invalid index and
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn set_register(&mut self, index: usize, value: u64) -> Result<()>
    {
        self.ensure_idle()?;
        let mut registers = self.inferior.get_registers()?;
        registers.set(RegisterId::Index(index), value)?;
        self.inferior.set_registers(&registers)?;
        self.invalidate_frames();
        self.compute_frame()?;
        Ok(())
    }

    /// The stopped thread's registers.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn registers(&self) -> Result<Registers>
    {
        self.ensure_idle()?;
        self.inferior.get_registers()
    }

    /// Read target memory.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle, and the
    /// backend's read error.
    pub fn read_memory(&self, address: TargetAddress, size: usize) -> Result<Vec<u8>>
    {
        self.ensure_idle()?;
        self.inferior.read_buffer(address, size)
    }

    /// Write target memory.
    ///
    /// ## Errors
    ///
    /// Same as [`SteppingEngine::read_memory`].
    pub fn write_memory(&mut self, address: TargetAddress, data: &[u8]) -> Result<()>
    {
        self.ensure_idle()?;
        self.inferior.write_buffer(address, data)?;
        self.current_backtrace = None;
        Ok(())
    }

    /// Walk the stack of the stopped thread.
    ///
    /// At most `max_frames` frames (further capped by the configuration);
    /// with `until` the walk ends at the first frame at that address.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotStopped`] unless the engine is idle.
    pub fn get_backtrace(&mut self, max_frames: usize, until: Option<TargetAddress>) -> Result<Backtrace>
    {
        self.ensure_idle()?;
        let frame = self.frame()?;
        let limit = max_frames.min(self.context.config.max_backtrace_frames);
        let backtrace = {
            let view = TargetView(self.inferior.as_ref());
            let unwinder = Unwinder::new(&self.context.decoder, &self.context.symbols, &view);
            let frames = unwinder.backtrace(frame.simple.clone(), limit, until);
            Backtrace::new(
                frames
                    .into_iter()
                    .map(|simple| unwinder.symbolize(self.thread, simple))
                    .collect(),
            )
        };
        tracing::trace!(thread = %self.thread, frames = backtrace.len(), "computed backtrace");
        self.current_backtrace = Some(backtrace.clone());
        Ok(backtrace)
    }

    /// The backend's own stack walk.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::NotImplemented`] when the backend has none.
    pub fn native_backtrace(&self, max_frames: usize, until: Option<TargetAddress>) -> Result<Vec<RawFrame>>
    {
        self.ensure_idle()?;
        self.inferior.get_backtrace(max_frames, until)
    }

    /// Mapped regions of the process.
    ///
    /// ## Errors
    ///
    /// The backend's error.
    pub fn memory_maps(&self) -> Result<Vec<MemoryRegion>>
    {
        if self.state == EngineState::Dead {
            return Err(DebuggerError::NoTarget);
        }
        self.inferior.get_memory_maps()
    }

    /// Let a freshly created thread run on its own.
    ///
    /// The thread is resumed once its initial stop has been seen; until a
    /// command is issued for it, every stop it reports is handled like a
    /// continue that hit something.
    pub fn prepare_background_run(&mut self)
    {
        self.operations.push(Operation::Run(RunOperation {
            until: None,
            in_background: true,
        }));
        self.state = EngineState::Busy;
        self.last_directive = Some(Directive::Continue);
    }

    // ------------------------------------------------------------------
    // Thread lock
    // ------------------------------------------------------------------

    /// Freeze this thread because another engine took the global lock.
    ///
    /// A running thread is stopped synchronously. If it stopped on its own
    /// first, that event is kept and handed back by
    /// [`SteppingEngine::unlock_thread`].
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::Internal`] if the thread is already locked, and the
    /// backend's stop error.
    pub fn lock_thread(&mut self) -> Result<()>
    {
        if self.thread_lock.is_some() {
            return Err(DebuggerError::Internal(format!("thread {} is already locked", self.thread)));
        }
        if self.state == EngineState::Dead {
            return Ok(());
        }
        let was_running = self.state == EngineState::Busy;
        let pending = if was_running {
            self.inferior.stop_and_wait()?
        } else {
            None
        };
        tracing::trace!(thread = %self.thread, was_running, pending = ?pending, "thread locked");
        self.thread_lock = Some(ThreadLockStash { was_running, pending });
        Ok(())
    }

    /// Mark a thread that is already stopped as locked without stopping it again.
    ///
    /// Unlocking resumes it if the engine is busy.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::Internal`] if the thread is already locked.
    pub fn lock_stopped_thread(&mut self) -> Result<()>
    {
        if self.thread_lock.is_some() {
            return Err(DebuggerError::Internal(format!("thread {} is already locked", self.thread)));
        }
        self.thread_lock = Some(ThreadLockStash {
            was_running: self.state == EngineState::Busy,
            pending: None,
        });
        Ok(())
    }

    /// Resume a busy engine's thread the way it was last resumed.
    ///
    /// Used for threads whose stop was absorbed before the engine existed.
    ///
    /// ## Errors
    ///
    /// The backend's resume error.
    pub fn resume_background(&mut self) -> Result<()>
    {
        if self.state == EngineState::Busy && self.thread_lock.is_none() {
            self.resume_last()?;
        }
        Ok(())
    }

    /// Undo [`SteppingEngine::lock_thread`].
    ///
    /// Returns the event buffered while locked; the caller replays it through
    /// [`SteppingEngine::handle_event`]. Otherwise a thread that was running
    /// is resumed the way it was last resumed.
    ///
    /// ## Errors
    ///
    /// The backend's resume error.
    pub fn unlock_thread(&mut self) -> Result<Option<ChildEvent>>
    {
        let Some(stash) = self.thread_lock.take() else {
            return Ok(None);
        };
        tracing::trace!(thread = %self.thread, "thread unlocked");
        if let Some(event) = stash.pending {
            return Ok(Some(event));
        }
        if stash.was_running && self.state == EngineState::Busy {
            self.resume_last()?;
        }
        Ok(None)
    }

    /// Drop every pending operation after a handler failed part way.
    ///
    /// Operations release what they hold, including the global thread lock,
    /// and a live engine is left idle. Returns the stop to report for the
    /// abandoned command.
    pub fn abandon(&mut self, coordinator: &mut dyn ThreadCoordinator) -> TargetEventArgs
    {
        tracing::warn!(thread = %self.thread, operations = self.operations.len(), "abandoning operations");
        self.abort_operations(coordinator);
        if self.state != EngineState::Dead {
            self.state = EngineState::Idle;
        }
        self.stop_requested = false;
        self.tree_mode = None;
        self.invalidate_frames();
        TargetEventArgs::new(TargetEventType::TargetStopped, 0)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Decode a raw wait status and handle it.
    ///
    /// ## Errors
    ///
    /// Decoding errors, and errors while the engine was idle. Errors inside a
    /// running operation tree end the tree with a `TargetStopped` event instead.
    pub fn process_event(
        &mut self,
        status: i32,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        let event = self.inferior.process_event(status)?;
        self.handle_event(event, coordinator)
    }

    /// Handle an already decoded event.
    ///
    /// ## Errors
    ///
    /// Same as [`SteppingEngine::process_event`].
    pub fn handle_event(
        &mut self,
        event: ChildEvent,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        if self.state == EngineState::Dead {
            tracing::debug!(thread = %self.thread, ?event, "event for a dead thread");
            return Ok(None);
        }
        if let Some(stash) = self.thread_lock.as_mut() {
            if stash.pending.is_some() {
                return Err(DebuggerError::Internal(format!(
                    "thread {} reported a second event while locked",
                    self.thread
                )));
            }
            tracing::trace!(thread = %self.thread, ?event, "buffering event while locked");
            stash.pending = Some(event);
            return Ok(None);
        }

        match coordinator.handle_child_event(self.thread, self.inferior.as_mut(), &event)? {
            CoordinatorAction::Handled { resume } => {
                if resume {
                    self.resume_last()?;
                }
                return Ok(None);
            }
            CoordinatorAction::Ignored => {}
        }

        tracing::trace!(thread = %self.thread, ?event, "processing event");
        match self.process_child_event(&event, coordinator) {
            Err(error) if self.state == EngineState::Busy => {
                tracing::error!(thread = %self.thread, "operation failed: {error}");
                let args = self.stop_event(TargetEventType::TargetStopped, 0);
                Ok(Some(self.end_tree(args, coordinator)))
            }
            other => other,
        }
    }

    fn process_child_event(
        &mut self,
        event: &ChildEvent,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        match event {
            ChildEvent::Exited { code } => {
                Ok(Some(self.terminate(TargetEventType::TargetExited, i64::from(*code), coordinator)))
            }
            ChildEvent::Signaled { signal } => {
                Ok(Some(self.terminate(TargetEventType::TargetSignaled, i64::from(*signal), coordinator)))
            }
            ChildEvent::CalledExit => {
                if self.is_main && !self.reached_main_teardown {
                    self.capture_main_teardown();
                }
                self.resume_last()?;
                Ok(None)
            }
            ChildEvent::Notification { kind, data1, data2 } => {
                tracing::debug!(thread = %self.thread, kind, data1, data2, "runtime notification");
                self.resume_last()?;
                Ok(None)
            }
            ChildEvent::CreatedThread { thread } => {
                tracing::warn!(thread = %self.thread, new_thread = %thread, "thread creation not claimed");
                self.resume_last()?;
                Ok(None)
            }
            ChildEvent::ThrowException { exception, .. } | ChildEvent::HandleException { exception, .. } => {
                self.handle_exception(*exception, coordinator)
            }
            ChildEvent::UnhandledException { exception, .. } => {
                self.operations.push(Operation::Exception(ExceptionStop {
                    exception: *exception,
                    catchpoint: None,
                    unhandled: true,
                }));
                self.state = EngineState::Busy;
                self.drive(Trigger::Execute, coordinator)
            }
            ChildEvent::Stopped { signal } if *signal != 0 && *signal != libc::SIGTRAP => {
                self.handle_signal(*signal, coordinator)
            }
            ChildEvent::Interrupted => {
                if self.stop_requested || self.pending_interrupt {
                    self.pending_interrupt = false;
                    if self.state == EngineState::Busy {
                        let args = self.stop_event(TargetEventType::TargetStopped, 0);
                        return Ok(Some(self.end_tree(args, coordinator)));
                    }
                    // The stop was already reported by an earlier event.
                    return Ok(None);
                }
                self.plain_stop(event, coordinator)
            }
            ChildEvent::Breakpoint { id } => match self.classify_breakpoint(*id)? {
                BreakpointAction::PlainStop => self.plain_stop(&ChildEvent::Stopped { signal: 0 }, coordinator),
                BreakpointAction::Report(args) => Ok(Some(self.end_tree(args, coordinator))),
                BreakpointAction::StepOver(child) => {
                    if self.operations.is_empty() {
                        self.prepare_background_run();
                    }
                    self.operations.push(child);
                    self.drive(Trigger::Execute, coordinator)
                }
            },
            ChildEvent::Callback { .. } => self.drive(Trigger::Event(event), coordinator),
            ChildEvent::Stopped { .. } => self.plain_stop(event, coordinator),
        }
    }

    fn plain_stop(
        &mut self,
        event: &ChildEvent,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        if self.stop_requested && self.state == EngineState::Busy {
            let args = self.stop_event(TargetEventType::TargetStopped, 0);
            return Ok(Some(self.end_tree(args, coordinator)));
        }
        self.drive(Trigger::Event(event), coordinator)
    }

    fn handle_signal(&mut self, signal: i32, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        if self.context.config.is_ignored_signal(signal) {
            tracing::trace!(thread = %self.thread, signal, "ignoring signal");
            self.resume_last()?;
            return Ok(None);
        }
        let kind = if self.context.config.is_fatal_signal(signal) {
            tracing::warn!(thread = %self.thread, signal, "thread received a fatal signal");
            TargetEventType::TargetSignaled
        } else {
            tracing::debug!(thread = %self.thread, signal, "thread stopped by signal");
            TargetEventType::TargetStopped
        };
        let args = self.stop_event(kind, i64::from(signal));
        Ok(Some(self.end_tree(args, coordinator)))
    }

    fn handle_exception(
        &mut self,
        exception: TargetAddress,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        let type_name = {
            let view = TargetView(self.inferior.as_ref());
            self.context
                .language
                .as_ref()
                .and_then(|language| language.exception_type_name(&view, exception))
        };
        let Some(catchpoint) = self.context.breakpoints.matching_catchpoint(type_name.as_deref()) else {
            tracing::trace!(thread = %self.thread, %exception, ?type_name, "exception not caught");
            self.resume_last()?;
            return Ok(None);
        };
        tracing::debug!(thread = %self.thread, %exception, catchpoint = catchpoint.index, "catchpoint hit");
        self.operations.push(Operation::Exception(ExceptionStop {
            exception,
            catchpoint: Some(catchpoint.index),
            unhandled: false,
        }));
        self.state = EngineState::Busy;
        self.drive(Trigger::Execute, coordinator)
    }

    fn classify_breakpoint(&mut self, reported: BreakpointId) -> Result<BreakpointAction>
    {
        let registers = self.inferior.get_registers()?;
        let pc = self.address(registers.pc());
        let breakpoints = &self.context.breakpoints;
        let mut id = if reported.is_unknown() {
            breakpoints.lookup_by_address(pc).map_or(reported, |(found, _)| found)
        } else {
            reported
        };

        if let Some((temp, temp_address)) = self.temp_breakpoint {
            if temp == id || temp_address == pc {
                tracing::trace!(thread = %self.thread, %pc, "reached temporary breakpoint");
                self.remove_temporary_breakpoint();
                let thread = self.thread;
                let user = self
                    .context
                    .breakpoints
                    .ids_at(pc)
                    .into_iter()
                    .filter_map(|other| self.context.breakpoints.info(other))
                    .find(|info| !info.temporary && info.enabled && info.applies_to(thread));
                match user {
                    Some(info) => id = info.id,
                    None => return Ok(BreakpointAction::PlainStop),
                }
            }
        }

        if self.stop_requested {
            return Ok(BreakpointAction::Report(self.stop_event(TargetEventType::TargetStopped, 0)));
        }
        if id.is_unknown() {
            tracing::debug!(thread = %self.thread, %pc, "unknown breakpoint");
            return Ok(BreakpointAction::Report(self.stop_event(TargetEventType::TargetHitBreakpoint, 0)));
        }
        let Some(info) = self.context.breakpoints.info(id) else {
            tracing::debug!(thread = %self.thread, %id, "breakpoint not registered");
            let data = i64::from(id.raw());
            return Ok(BreakpointAction::Report(self.stop_event(TargetEventType::TargetHitBreakpoint, data)));
        };

        let step_over = Operation::StepOverBreakpoint(StepOverBreakpoint::new(id, pc));
        if info.temporary || !info.applies_to(self.thread) {
            tracing::trace!(thread = %self.thread, %id, owner = %info.owner, "stepping over foreign breakpoint");
            return Ok(BreakpointAction::StepOver(step_over));
        }
        match info.breakpoint {
            Some(breakpoint) if !breakpoint.check_breakpoint_hit(self.thread, &registers) => {
                tracing::trace!(thread = %self.thread, %id, "breakpoint condition not met");
                Ok(BreakpointAction::StepOver(step_over))
            }
            Some(breakpoint) => {
                let data = i64::from(breakpoint.index());
                Ok(BreakpointAction::Report(self.stop_event(TargetEventType::TargetHitBreakpoint, data)))
            }
            None => {
                let data = i64::from(id.raw());
                Ok(BreakpointAction::Report(self.stop_event(TargetEventType::TargetHitBreakpoint, data)))
            }
        }
    }

    fn terminate(
        &mut self,
        kind: TargetEventType,
        data: i64,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> TargetEventArgs
    {
        if self.is_main && !self.reached_main_teardown {
            self.capture_main_teardown();
        }
        let args = self.end_tree(TargetEventArgs::new(kind, data), coordinator);
        self.state = EngineState::Dead;
        self.invalidate_frames();
        tracing::debug!(thread = %self.thread, "thread is gone: {args}");
        args
    }

    fn capture_main_teardown(&mut self)
    {
        self.reached_main_teardown = true;
        let registers = match self.inferior.get_registers() {
            Ok(registers) => registers,
            Err(error) => {
                tracing::debug!(thread = %self.thread, "cannot inspect exiting main thread: {error}");
                return;
            }
        };
        let initial = SimpleStackFrame::from_registers(self.address(0), registers);
        let view = TargetView(self.inferior.as_ref());
        let unwinder = Unwinder::new(&self.context.decoder, &self.context.symbols, &view);
        let frames = unwinder.backtrace(initial, self.context.config.max_backtrace_frames, None);
        self.main_return_address = frames.last().map(|frame| frame.address);
        tracing::debug!(thread = %self.thread, address = ?self.main_return_address, "main thread is exiting");
    }

    // ------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------

    fn start_operation(
        &mut self,
        operation: Operation,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        self.ensure_idle()?;
        tracing::debug!(thread = %self.thread, "starting {operation}");
        self.tree_mode = match &operation {
            Operation::Step(step) => Some(step.frame.mode),
            _ => None,
        };
        self.state = EngineState::Busy;
        self.stop_requested = false;
        self.operations.push(operation);
        match self.drive(Trigger::Execute, coordinator) {
            Ok(result) => Ok(result),
            Err(error) => {
                tracing::debug!(thread = %self.thread, "operation could not start: {error}");
                self.abort_operations(coordinator);
                self.state = EngineState::Idle;
                self.tree_mode = None;
                Err(error)
            }
        }
    }

    fn drive(
        &mut self,
        mut trigger: Trigger<'_>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        let mut asked: Vec<Operation> = Vec::new();
        loop {
            let Some(mut operation) = self.operations.pop() else {
                if asked.is_empty() {
                    let args = self.stop_event(TargetEventType::TargetStopped, 0);
                    return Ok(Some(self.end_tree(args, coordinator)));
                }
                tracing::warn!(thread = %self.thread, ?trigger, "no operation claimed the event");
                self.operations.extend(asked.into_iter().rev());
                self.resume_last()?;
                return Ok(None);
            };

            tracing::trace!(thread = %self.thread, ?trigger, "dispatching to {operation}");
            let result = match self.dispatch(&mut operation, trigger, coordinator) {
                Ok(result) => result,
                Err(error) => {
                    self.operations.push(operation);
                    self.operations.extend(asked.into_iter().rev());
                    return Err(error);
                }
            };

            match result {
                EventResult::Running => {
                    self.operations.push(operation);
                    self.operations.extend(asked.into_iter().rev());
                    return Ok(None);
                }
                EventResult::PushChild(child) => {
                    tracing::debug!(thread = %self.thread, "{operation} pushed {child}");
                    self.operations.push(operation);
                    self.operations.extend(asked.drain(..).rev());
                    self.operations.push(child);
                    trigger = Trigger::Execute;
                }
                EventResult::AskParent => asked.push(operation),
                done @ (EventResult::Completed | EventResult::CompletedCallback) => {
                    tracing::debug!(thread = %self.thread, "{operation} completed");
                    let callback = matches!(done, EventResult::CompletedCallback);
                    for stale in asked.drain(..) {
                        self.cleanup(stale, coordinator);
                    }
                    self.cleanup(operation, coordinator);
                    if !self.operations.is_empty() {
                        trigger = Trigger::ChildCompleted;
                        continue;
                    }
                    if callback {
                        // The saved frame was restored; nothing moved.
                        let args = TargetEventArgs::with_frame(
                            TargetEventType::TargetStopped,
                            0,
                            self.current_frame.clone(),
                        );
                        return Ok(Some(self.end_tree(args, coordinator)));
                    }
                    return self.tree_completed(coordinator);
                }
                EventResult::Stop(args) => {
                    for stale in asked.drain(..) {
                        self.cleanup(stale, coordinator);
                    }
                    self.cleanup(operation, coordinator);
                    return Ok(Some(self.end_tree(args, coordinator)));
                }
            }
        }
    }

    fn tree_completed(&mut self, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        let frame = self.compute_frame()?;
        if let Some(operation) = self.frame_changed(&frame) {
            tracing::debug!(thread = %self.thread, "continuing with {operation}");
            self.operations.push(operation);
            return self.drive(Trigger::Execute, coordinator);
        }
        let args = TargetEventArgs::with_frame(TargetEventType::TargetStopped, 0, Some(frame));
        Ok(Some(self.end_tree(args, coordinator)))
    }

    /// Automatic follow-up after a source-level step landed somewhere new.
    fn frame_changed(&self, frame: &StackFrame) -> Option<Operation>
    {
        let mode = self.tree_mode?;
        if !matches!(mode, StepMode::SourceLine | StepMode::NextLine) {
            return None;
        }
        let method = frame.method.as_ref()?;
        let pc = frame.address();
        let language = self.context.language.clone();

        if method.is_wrapper && self.context.config.step_into_wrappers {
            let step_frame = StepFrame::range(
                method.start,
                method.end,
                Some(frame.simple.clone()),
                language,
                StepMode::SourceLine,
            );
            return Some(Operation::Wrapper(StepOperation::new(step_frame)));
        }
        if !method.has_source() {
            return None;
        }
        if method.is_in_prologue(pc) {
            return Some(Operation::Run(RunOperation {
                until: Some(method.method_start),
                in_background: false,
            }));
        }
        if method.is_in_epilogue(pc) {
            let step_frame = StepFrame::range(
                method.method_end,
                method.end,
                Some(frame.simple.clone()),
                language,
                mode,
            );
            return Some(Operation::Step(StepOperation::new(step_frame)));
        }
        None
    }

    fn end_tree(&mut self, args: TargetEventArgs, coordinator: &mut dyn ThreadCoordinator) -> TargetEventArgs
    {
        self.abort_operations(coordinator);
        self.state = EngineState::Idle;
        self.stop_requested = false;
        self.tree_mode = None;
        tracing::debug!(thread = %self.thread, "operation tree finished: {args}");
        args
    }

    fn abort_operations(&mut self, coordinator: &mut dyn ThreadCoordinator)
    {
        while let Some(operation) = self.operations.pop() {
            self.cleanup(operation, coordinator);
        }
        self.remove_temporary_breakpoint();
    }

    /// Undo whatever an operation still holds; safe on completed operations.
    fn cleanup(&mut self, operation: Operation, coordinator: &mut dyn ThreadCoordinator)
    {
        match operation {
            Operation::StepOverBreakpoint(mut step_over) => self.restore_step_over(&mut step_over, coordinator),
            Operation::RuntimeInvoke(mut invoke) => {
                self.release_if_acquired(&mut invoke.acquired_lock, coordinator);
                if invoke.result.complete(RuntimeInvokeResult::aborted()) {
                    tracing::debug!(thread = %self.thread, "runtime invocation aborted");
                }
            }
            Operation::CallMethod(mut call) => {
                self.release_if_acquired(&mut call.acquired_lock, coordinator);
                if call.result.complete(None) {
                    tracing::debug!(thread = %self.thread, "native call aborted");
                }
            }
            Operation::InsertBreakpoint(insert) => {
                insert.result.complete(None);
            }
            Operation::Step(_)
            | Operation::Wrapper(_)
            | Operation::Run(_)
            | Operation::CompileMethod(_)
            | Operation::Exception(_) => {}
        }
    }

    fn dispatch(
        &mut self,
        operation: &mut Operation,
        trigger: Trigger<'_>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<EventResult>
    {
        if let Trigger::Event(ChildEvent::Callback { id, .. }) = trigger {
            if operation.callback_id() != Some(*id) {
                return Ok(EventResult::AskParent);
            }
        }
        match operation {
            Operation::Step(step) | Operation::Wrapper(step) => self.process_step(step, trigger),
            Operation::Run(run) => self.process_run(*run, trigger),
            Operation::StepOverBreakpoint(step_over) => self.process_step_over(step_over, trigger, coordinator),
            Operation::RuntimeInvoke(invoke) => self.process_runtime_invoke(invoke, trigger, coordinator),
            Operation::CallMethod(call) => self.process_call_method(call, trigger, coordinator),
            Operation::CompileMethod(compile) => self.process_compile_method(compile, trigger),
            Operation::InsertBreakpoint(insert) => self.process_insert_breakpoint(insert, trigger),
            Operation::Exception(stop) => Ok(EventResult::Stop(self.exception_event(stop))),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    fn process_step(&mut self, step: &mut StepOperation, trigger: Trigger<'_>) -> Result<EventResult>
    {
        // A helper finished while we were running to the temporary breakpoint.
        if matches!(trigger, Trigger::ChildCompleted) && self.temp_breakpoint.is_some() {
            return self.do_continue();
        }
        let registers = self.inferior.get_registers()?;
        let pc = self.address(registers.pc());
        let sp = self.address(registers.sp());
        let started = matches!(trigger, Trigger::Execute);

        match step.frame.mode {
            StepMode::NativeInstruction | StepMode::SingleInstruction | StepMode::NextInstruction => {
                if !started {
                    return Ok(EventResult::Completed);
                }
                if step.frame.mode == StepMode::NextInstruction {
                    if let Some(call) = self.call_at(pc) {
                        return self.run_to(pc + call.size as u64);
                    }
                }
                if step.frame.mode == StepMode::SingleInstruction {
                    if let Some(compile) = self.trampoline_at(pc) {
                        return Ok(EventResult::PushChild(compile));
                    }
                }
                self.do_step()
            }
            StepMode::Finish | StepMode::FinishNative => {
                if !started && step.frame.has_returned(sp) {
                    return Ok(EventResult::Completed);
                }
                match step.return_address {
                    Some(return_address) => self.run_to(return_address),
                    None => self.do_step(),
                }
            }
            StepMode::SourceLine | StepMode::NextLine => {
                if !started {
                    if let Some((return_to, call_sp)) = step.stepping_over.take() {
                        if pc == return_to && sp < call_sp {
                            // The callee reached the return address again one activation deeper.
                            tracing::trace!(thread = %self.thread, %pc, %sp, "return address hit in a nested frame");
                            step.stepping_over = Some((return_to, call_sp));
                            return self.run_to(return_to);
                        }
                    }
                    if let Some(result) = self.check_line_step(step, &registers, pc, sp)? {
                        return Ok(result);
                    }
                }
                self.step_line_once(step, pc, sp)
            }
        }
    }

    /// Decide whether a line step is done; `None` means keep stepping.
    fn check_line_step(
        &mut self,
        step: &mut StepOperation,
        registers: &Registers,
        pc: TargetAddress,
        sp: TargetAddress,
    ) -> Result<Option<EventResult>>
    {
        let entered_call = std::mem::take(&mut step.entering_call);
        if step.frame.contains(pc) {
            return Ok(None);
        }
        let method = self.context.symbols.lookup(pc);

        // Only a stepped call enters a new frame; a push merely lowers sp.
        if entered_call && step.frame.is_deeper(sp) {
            if method.as_deref().is_some_and(|method| self.is_steppable(method)) {
                return Ok(Some(EventResult::Completed));
            }
            let return_address = {
                let view = TargetView(self.inferior.as_ref());
                self.context.decoder.return_address_at_entry(&view, registers)
            };
            tracing::trace!(thread = %self.thread, %pc, "entered code without source, stepping out");
            return match return_address {
                Some(address) => self.run_to(address).map(Some),
                None => Ok(Some(EventResult::Completed)),
            };
        }

        if !step.frame.has_returned(sp) {
            return Ok(Some(EventResult::Completed));
        }
        let current = SimpleStackFrame::from_registers(pc, registers.clone());
        match method.as_deref() {
            Some(method) if method.has_source() => {
                let Some(range) = method.line_range(pc) else {
                    return Ok(Some(EventResult::Completed));
                };
                if range.start == pc {
                    return Ok(Some(EventResult::Completed));
                }
                // Returned into the middle of the caller's line; finish that line.
                tracing::trace!(thread = %self.thread, %pc, line = range.line, "returned mid-line");
                step.frame = StepFrame::range(
                    range.start,
                    range.end,
                    Some(current),
                    self.context.language.clone(),
                    step.frame.mode,
                );
                Ok(None)
            }
            _ => {
                let Some(caller) = self.unwind_caller(&current) else {
                    return Ok(Some(EventResult::Completed));
                };
                tracing::trace!(thread = %self.thread, %pc, "returned into code without source");
                step.frame = StepFrame::range(pc, pc, Some(current), self.context.language.clone(), step.frame.mode);
                self.run_to(caller.address).map(Some)
            }
        }
    }

    fn step_line_once(&mut self, step: &mut StepOperation, pc: TargetAddress, sp: TargetAddress) -> Result<EventResult>
    {
        step.entering_call = false;
        step.stepping_over = None;
        let Some(call) = self.call_at(pc) else {
            return self.do_step();
        };
        let return_to = pc + call.size as u64;
        if step.frame.mode == StepMode::NextLine {
            step.stepping_over = Some((return_to, sp));
            return self.run_to(return_to);
        }
        if let Some(compile) = self.trampoline_at(pc) {
            step.entering_call = true;
            return Ok(EventResult::PushChild(compile));
        }

        let mut target = call.target;
        if let Some(jump) = self.jump_at(target) {
            tracing::trace!(thread = %self.thread, from = %target, to = %jump.target, "following jump stub");
            target = jump.target;
        }
        if self.has_steppable_code(target) {
            tracing::trace!(thread = %self.thread, %target, "stepping into call");
            step.entering_call = true;
            self.do_step()
        } else {
            tracing::trace!(thread = %self.thread, %target, "stepping over call");
            step.stepping_over = Some((return_to, sp));
            self.run_to(return_to)
        }
    }

    fn process_run(&mut self, run: RunOperation, trigger: Trigger<'_>) -> Result<EventResult>
    {
        match trigger {
            Trigger::Execute | Trigger::ChildCompleted => match run.until {
                Some(until) if self.temp_breakpoint.is_none() || matches!(trigger, Trigger::Execute) => {
                    self.run_to(until)
                }
                _ => self.do_continue(),
            },
            Trigger::Event(_) => Ok(EventResult::Completed),
        }
    }

    fn process_step_over(
        &mut self,
        step_over: &mut StepOverBreakpoint,
        trigger: Trigger<'_>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<EventResult>
    {
        match trigger {
            Trigger::Execute => {
                if !coordinator.holds_global_thread_lock(self.thread) {
                    coordinator.acquire_global_thread_lock(self.thread)?;
                    step_over.acquired_lock = true;
                }
                self.context
                    .breakpoints
                    .disable_breakpoint(self.inferior.as_mut(), step_over.id)?;
                step_over.disabled = true;
                tracing::trace!(thread = %self.thread, id = %step_over.id, "stepping over breakpoint");
                self.resume(Directive::Step)
            }
            Trigger::Event(_) | Trigger::ChildCompleted => {
                self.restore_step_over(step_over, coordinator);
                Ok(EventResult::Completed)
            }
        }
    }

    /// Re-arm the breakpoint, then let the other threads go.
    fn restore_step_over(&mut self, step_over: &mut StepOverBreakpoint, coordinator: &mut dyn ThreadCoordinator)
    {
        if step_over.disabled {
            step_over.disabled = false;
            match self
                .context
                .breakpoints
                .enable_breakpoint(self.inferior.as_mut(), step_over.id)
            {
                Ok(()) | Err(DebuggerError::NoSuchBreakpoint(_)) => {}
                Err(error) => tracing::warn!(id = %step_over.id, "cannot re-enable breakpoint: {error}"),
            }
        }
        self.release_if_acquired(&mut step_over.acquired_lock, coordinator);
    }

    fn release_if_acquired(&self, acquired: &mut bool, coordinator: &mut dyn ThreadCoordinator)
    {
        if std::mem::take(acquired) {
            if let Err(error) = coordinator.release_global_thread_lock(self.thread) {
                tracing::warn!(thread = %self.thread, "cannot release global thread lock: {error}");
            }
        }
    }

    fn process_runtime_invoke(
        &mut self,
        invoke: &mut RuntimeInvoke,
        trigger: Trigger<'_>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<EventResult>
    {
        let language = self.language()?;
        match trigger {
            Trigger::Execute => {
                if self.context.config.lock_threads_during_invoke && !coordinator.holds_global_thread_lock(self.thread)
                {
                    coordinator.acquire_global_thread_lock(self.thread)?;
                    invoke.acquired_lock = true;
                }
                let (function, arguments) = match invoke.stage {
                    InvokeStage::Compiling => (language.compile_method_func(), vec![invoke.method.value()]),
                    InvokeStage::Invoking => (language.runtime_invoke_func(), invoke_arguments(invoke)),
                };
                let (id, saved) = self.begin_call(function, &arguments)?;
                invoke.callback_id = id;
                invoke.saved = Some(saved);
                Ok(EventResult::Running)
            }
            Trigger::Event(ChildEvent::Callback { data1, data2, .. }) => match invoke.stage {
                InvokeStage::Compiling => {
                    if let Some(saved) = &invoke.saved {
                        self.inferior.set_registers(&saved.registers)?;
                    }
                    invoke.method = self.address(*data1);
                    invoke.stage = InvokeStage::Invoking;
                    tracing::trace!(thread = %self.thread, code = %invoke.method, "method compiled, invoking");
                    let id = self.allocate_callback_id();
                    self.last_directive = Some(Directive::Continue);
                    self.inferior
                        .call_method(language.runtime_invoke_func(), &invoke_arguments(invoke), id)?;
                    invoke.callback_id = id;
                    Ok(EventResult::Running)
                }
                InvokeStage::Invoking => {
                    let exception = (*data2 != 0).then(|| self.address(*data2));
                    let exception_message = exception.and_then(|exception| {
                        let view = TargetView(self.inferior.as_ref());
                        language.exception_message(&view, exception)
                    });
                    let result = RuntimeInvokeResult {
                        return_value: (exception.is_none() && *data1 != 0).then(|| self.address(*data1)),
                        exception,
                        exception_message,
                        aborted: false,
                    };
                    self.finish_call(invoke.saved.take())?;
                    self.release_if_acquired(&mut invoke.acquired_lock, coordinator);
                    invoke.result.complete(result);
                    Ok(EventResult::CompletedCallback)
                }
            },
            Trigger::ChildCompleted => self.do_continue(),
            Trigger::Event(_) => Ok(EventResult::Stop(self.stop_event(TargetEventType::TargetStopped, 0))),
        }
    }

    fn process_call_method(
        &mut self,
        call: &mut CallMethod,
        trigger: Trigger<'_>,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<EventResult>
    {
        match trigger {
            Trigger::Execute => {
                if self.context.config.lock_threads_during_invoke && !coordinator.holds_global_thread_lock(self.thread)
                {
                    coordinator.acquire_global_thread_lock(self.thread)?;
                    call.acquired_lock = true;
                }
                let (id, saved) = self.begin_call(call.method, &call.arguments)?;
                call.callback_id = id;
                call.saved = Some(saved);
                Ok(EventResult::Running)
            }
            Trigger::Event(ChildEvent::Callback { data1, .. }) => {
                self.finish_call(call.saved.take())?;
                self.release_if_acquired(&mut call.acquired_lock, coordinator);
                call.result.complete(Some(*data1));
                Ok(EventResult::CompletedCallback)
            }
            Trigger::ChildCompleted => self.do_continue(),
            Trigger::Event(_) => Ok(EventResult::Stop(self.stop_event(TargetEventType::TargetStopped, 0))),
        }
    }

    fn process_compile_method(&mut self, compile: &mut CompileMethod, trigger: Trigger<'_>) -> Result<EventResult>
    {
        let language = self.language()?;
        match (trigger, compile.stage) {
            (Trigger::Execute, _) => {
                compile.saved_registers = Some(self.inferior.get_registers()?);
                let id = self.allocate_callback_id();
                self.invalidate_frames();
                self.last_directive = Some(Directive::Continue);
                self.inferior
                    .call_method(language.compile_method_func(), &[compile.handle.value()], id)?;
                compile.callback_id = id;
                Ok(EventResult::Running)
            }
            (Trigger::Event(ChildEvent::Callback { data1, .. }), CompileStage::Compiling) => {
                if let Some(registers) = compile.saved_registers.take() {
                    self.inferior.set_registers(&registers)?;
                }
                let code = self.address(*data1);
                let destination = if code.is_null() {
                    None
                } else {
                    match self.context.symbols.lookup(code) {
                        Some(method) if self.is_steppable(&method) => Some(method.method_start),
                        Some(_) => None,
                        None => {
                            let view = TargetView(self.inferior.as_ref());
                            language
                                .get_trampoline(&view, code)
                                .filter(|method| method.has_source)
                                .map(|_| code)
                        }
                    }
                };
                let target = destination.unwrap_or(compile.call_site + compile.call_size as u64);
                tracing::debug!(
                    thread = %self.thread,
                    handle = %compile.handle,
                    %code,
                    %target,
                    entering = destination.is_some(),
                    "trampoline resolved"
                );
                compile.stage = CompileStage::RunningTo(target);
                self.run_to(target)
            }
            (Trigger::ChildCompleted, CompileStage::RunningTo(target)) => {
                if self.temp_breakpoint.is_some() {
                    self.do_continue()
                } else {
                    self.run_to(target)
                }
            }
            (Trigger::Event(_), CompileStage::RunningTo(_)) => Ok(EventResult::Completed),
            (Trigger::ChildCompleted | Trigger::Event(_), CompileStage::Compiling) => {
                Ok(EventResult::Stop(self.stop_event(TargetEventType::TargetStopped, 0)))
            }
        }
    }

    fn process_insert_breakpoint(&mut self, insert: &mut InsertBreakpoint, trigger: Trigger<'_>) -> Result<EventResult>
    {
        let language = self.language()?;
        match trigger {
            Trigger::Execute => {
                let (id, saved) = self.begin_call(language.compile_method_func(), &[insert.handle.value()])?;
                insert.callback_id = id;
                insert.saved = Some(saved);
                Ok(EventResult::Running)
            }
            Trigger::Event(ChildEvent::Callback { data1, .. }) => {
                self.finish_call(insert.saved.take())?;
                let code = self.address(*data1);
                if code.is_null() {
                    tracing::warn!(handle = %insert.handle, "method could not be compiled");
                    insert.result.complete(None);
                    return Ok(EventResult::CompletedCallback);
                }
                let address = self
                    .context
                    .symbols
                    .lookup(code)
                    .map_or(code, |method| method.method_start);
                let inserted = self.context.breakpoints.insert_breakpoint(
                    self.inferior.as_mut(),
                    Some(Arc::clone(&insert.breakpoint)),
                    address,
                    ThreadId(0),
                );
                match inserted {
                    Ok(id) => {
                        tracing::debug!(%id, %address, "inserted breakpoint in compiled method");
                        insert.result.complete(Some(id));
                    }
                    Err(error) => {
                        tracing::warn!(%address, "cannot insert breakpoint: {error}");
                        insert.result.complete(None);
                    }
                }
                Ok(EventResult::CompletedCallback)
            }
            Trigger::ChildCompleted => self.do_continue(),
            Trigger::Event(_) => Ok(EventResult::Stop(self.stop_event(TargetEventType::TargetStopped, 0))),
        }
    }

    fn exception_event(&mut self, stop: &ExceptionStop) -> TargetEventArgs
    {
        let kind = if stop.unhandled {
            TargetEventType::UnhandledException
        } else {
            TargetEventType::Exception
        };
        let mut args = self.stop_event(kind, stop.catchpoint.map_or(0, i64::from));
        args.exception = Some(stop.exception);
        args
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn instruction_step(
        &mut self,
        mode: StepMode,
        coordinator: &mut dyn ThreadCoordinator,
    ) -> Result<Option<TargetEventArgs>>
    {
        let step_frame = StepFrame::instruction(mode, self.context.language.clone());
        self.start_operation(Operation::Step(StepOperation::new(step_frame)), coordinator)
    }

    fn line_step(&mut self, mode: StepMode, coordinator: &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>
    {
        self.ensure_idle()?;
        let frame = self.frame()?;
        let pc = frame.address();
        let language = self.context.language.clone();
        let (start, end) = match frame.method.as_deref() {
            Some(method) => match method.line_range(pc).filter(|_| method.has_source()) {
                Some(range) => (range.start, range.end),
                None => (method.start, method.end),
            },
            None => (pc, pc),
        };
        let step_frame = StepFrame::range(start, end, Some(frame.simple.clone()), language, mode);
        self.start_operation(Operation::Step(StepOperation::new(step_frame)), coordinator)
    }

    fn ensure_idle(&self) -> Result<()>
    {
        match self.state {
            EngineState::Dead => Err(DebuggerError::NoTarget),
            EngineState::Busy => Err(DebuggerError::NotStopped),
            EngineState::Idle if self.thread_lock.is_some() => Err(DebuggerError::NotStopped),
            EngineState::Idle => Ok(()),
        }
    }

    fn language(&self) -> Result<Arc<dyn LanguageBackend>>
    {
        self.context
            .language
            .clone()
            .ok_or_else(|| DebuggerError::InvalidArgument("no language backend registered".to_owned()))
    }

    fn address(&self, value: u64) -> TargetAddress
    {
        TargetAddress::new(self.inferior.address_domain(), value)
    }

    fn allocate_callback_id(&mut self) -> u64
    {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        id
    }

    fn is_steppable(&self, method: &Method) -> bool
    {
        method.has_source() || (method.is_wrapper && self.context.config.step_into_wrappers)
    }

    fn has_steppable_code(&self, target: TargetAddress) -> bool
    {
        if let Some(method) = self.context.symbols.lookup(target) {
            return self.is_steppable(&method);
        }
        let view = TargetView(self.inferior.as_ref());
        self.context
            .language
            .as_ref()
            .and_then(|language| language.get_trampoline(&view, target))
            .is_some_and(|method| method.has_source)
    }

    fn call_at(&self, pc: TargetAddress) -> Option<Decoded>
    {
        let view = TargetView(self.inferior.as_ref());
        self.context.decoder.get_call_target(&view, pc)
    }

    fn jump_at(&self, address: TargetAddress) -> Option<Decoded>
    {
        let view = TargetView(self.inferior.as_ref());
        self.context.decoder.get_jump_target(&view, address)
    }

    /// A compile operation when the call at `pc` goes through a runtime trampoline.
    fn trampoline_at(&self, pc: TargetAddress) -> Option<Operation>
    {
        let language = self.context.language.as_ref()?;
        let view = TargetView(self.inferior.as_ref());
        let call = self.context.decoder.get_call_target(&view, pc)?;
        let handle = self
            .context
            .decoder
            .get_trampoline(&view, pc, language.generic_trampoline_address())
            .or_else(|| {
                language
                    .get_trampoline_address(&view, call.target)
                    .and_then(|(address, is_start)| is_start.then_some(address))
            })?;
        tracing::trace!(thread = %self.thread, %pc, %handle, "call goes through a trampoline");
        Some(Operation::CompileMethod(CompileMethod {
            handle,
            call_site: pc,
            call_size: call.size,
            callback_id: 0,
            saved_registers: None,
            stage: CompileStage::Compiling,
        }))
    }

    fn unwind_caller(&self, frame: &SimpleStackFrame) -> Option<SimpleStackFrame>
    {
        let view = TargetView(self.inferior.as_ref());
        Unwinder::new(&self.context.decoder, &self.context.symbols, &view).unwind_once(frame)
    }

    fn return_address_of(&self, frame: &SimpleStackFrame) -> Option<TargetAddress>
    {
        self.unwind_caller(frame).map(|caller| caller.address).or_else(|| {
            let view = TargetView(self.inferior.as_ref());
            self.context.decoder.return_address_at_entry(&view, &frame.registers)
        })
    }

    fn do_step(&mut self) -> Result<EventResult>
    {
        if let Some(step_over) = self.step_over_at_pc()? {
            return Ok(EventResult::PushChild(step_over));
        }
        self.resume(Directive::Step)
    }

    fn do_continue(&mut self) -> Result<EventResult>
    {
        if let Some(step_over) = self.step_over_at_pc()? {
            return Ok(EventResult::PushChild(step_over));
        }
        self.resume(Directive::Continue)
    }

    fn step_over_at_pc(&self) -> Result<Option<Operation>>
    {
        let pc = self.inferior.current_frame()?;
        Ok(self
            .context
            .breakpoints
            .enabled_at(pc)
            .map(|id| Operation::StepOverBreakpoint(StepOverBreakpoint::new(id, pc))))
    }

    fn run_to(&mut self, address: TargetAddress) -> Result<EventResult>
    {
        match self.temp_breakpoint {
            Some((_, current)) if current == address => {}
            _ => {
                self.remove_temporary_breakpoint();
                let id = self
                    .context
                    .breakpoints
                    .insert_temporary(self.inferior.as_mut(), address, self.thread)?;
                tracing::trace!(thread = %self.thread, %id, %address, "inserted temporary breakpoint");
                self.temp_breakpoint = Some((id, address));
            }
        }
        self.do_continue()
    }

    fn remove_temporary_breakpoint(&mut self)
    {
        if let Some((id, address)) = self.temp_breakpoint.take() {
            if let Err(error) = self.context.breakpoints.remove_breakpoint(self.inferior.as_mut(), id) {
                tracing::warn!(thread = %self.thread, %id, %address, "cannot remove temporary breakpoint: {error}");
            }
        }
    }

    fn resume(&mut self, directive: Directive) -> Result<EventResult>
    {
        self.invalidate_frames();
        self.last_directive = Some(directive);
        match directive {
            Directive::Step => self.inferior.step()?,
            Directive::Continue => self.inferior.continue_execution()?,
        }
        Ok(EventResult::Running)
    }

    fn resume_last(&mut self) -> Result<()>
    {
        let directive = self.last_directive.unwrap_or(Directive::Continue);
        tracing::trace!(thread = %self.thread, ?directive, "resuming");
        self.resume(directive).map(|_| ())
    }

    /// Save the thread's state and start a synthetic call.
    fn begin_call(&mut self, function: TargetAddress, arguments: &[u64]) -> Result<(u64, SavedState)>
    {
        let registers = self.inferior.get_registers()?;
        let frame = self.frame()?;
        let saved = SavedState {
            registers,
            frame: Some(frame),
            backtrace: self.current_backtrace.clone(),
        };
        let id = self.allocate_callback_id();
        self.invalidate_frames();
        self.last_directive = Some(Directive::Continue);
        self.inferior.call_method(function, arguments, id)?;
        tracing::debug!(thread = %self.thread, %function, id, "started synthetic call");
        Ok((id, saved))
    }

    fn finish_call(&mut self, saved: Option<SavedState>) -> Result<()>
    {
        let Some(saved) = saved else {
            return Ok(());
        };
        self.inferior.set_registers(&saved.registers)?;
        self.current_frame = saved.frame;
        self.current_backtrace = saved.backtrace;
        Ok(())
    }

    fn invalidate_frames(&mut self)
    {
        self.current_frame = None;
        self.current_backtrace = None;
    }

    fn frame(&mut self) -> Result<StackFrame>
    {
        match &self.current_frame {
            Some(frame) => Ok(frame.clone()),
            None => self.compute_frame(),
        }
    }

    fn compute_frame(&mut self) -> Result<StackFrame>
    {
        let registers = self.inferior.get_registers()?;
        let simple = SimpleStackFrame::from_registers(self.address(0), registers);
        let frame = {
            let view = TargetView(self.inferior.as_ref());
            Unwinder::new(&self.context.decoder, &self.context.symbols, &view).symbolize(self.thread, simple)
        };
        self.current_frame = Some(frame.clone());
        Ok(frame)
    }

    fn stop_event(&mut self, kind: TargetEventType, data: i64) -> TargetEventArgs
    {
        let frame = match self.compute_frame() {
            Ok(frame) => Some(frame),
            Err(error) => {
                tracing::debug!(thread = %self.thread, "no frame for stop event: {error}");
                None
            }
        };
        TargetEventArgs::with_frame(kind, data, frame)
    }
}

fn invoke_arguments(invoke: &RuntimeInvoke) -> Vec<u64>
{
    let mut arguments = Vec::with_capacity(invoke.arguments.len() + 2);
    arguments.push(invoke.method.value());
    arguments.push(invoke.object.value());
    arguments.extend_from_slice(&invoke.arguments);
    arguments
}
