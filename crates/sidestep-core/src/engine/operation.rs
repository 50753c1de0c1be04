//! Stepping operations.
//!
//! An [`Operation`] is one in-flight stepping intent. Operations form a stack
//! per engine, innermost last: a line step may push a breakpoint step-over,
//! which finishes and hands control back to the line step. The engine owns the
//! dispatch; this module only holds the per-kind state.

use std::fmt;
use std::sync::Arc;

use super::step_frame::{StepFrame, StepMode};
use crate::breakpoints::{Breakpoint, BreakpointId};
use crate::process::Completion;
use crate::types::{Backtrace, Registers, StackFrame, TargetAddress};

/// Discriminant of an [`Operation`], used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind
{
    /// One instruction, following trampolines.
    SingleInstructionStep,
    /// One instruction, nothing else.
    NativeInstructionStep,
    /// One instruction, stepping over calls.
    NextInstructionStep,
    /// One source line.
    SourceLineStep,
    /// One source line, stepping over calls.
    NextLineStep,
    /// Until the method returns.
    Finish,
    /// Until the native frame returns.
    FinishNative,
    /// Continue, optionally until an address.
    Run,
    /// Disable, step over and re-enable one breakpoint.
    StepOverBreakpoint,
    /// Invoke a managed method through the runtime.
    RuntimeInvoke,
    /// Call a native function.
    CallMethod,
    /// Compile a trampoline's method, then decide whether to enter it.
    CompileMethod,
    /// Compile a method, then set a breakpoint in it.
    InsertBreakpoint,
    /// Stop for a thrown exception.
    Exception,
    /// Stop for an exception nobody catches.
    UnhandledException,
    /// Step through a runtime wrapper.
    WrapperStep,
}

/// What the innermost operation decided about an event
#[derive(Debug)]
pub enum EventResult
{
    /// A native directive was issued; wait for the next event.
    Running,
    /// The operation is satisfied.
    Completed,
    /// A synthetic call finished and the saved state was restored.
    CompletedCallback,
    /// The event belongs to an outer operation.
    AskParent,
    /// Run `Operation` first, then come back.
    PushChild(Operation),
    /// End the whole operation tree with this event.
    Stop(crate::events::TargetEventArgs),
}

/// A stepping operation driven by a [`StepFrame`]
#[derive(Debug)]
pub struct StepOperation
{
    /// Range and mode.
    pub frame: StepFrame,
    /// Where the caller resumes, for the finish modes.
    pub return_address: Option<TargetAddress>,
    /// The last resume was a single step into a call.
    pub entering_call: bool,
    /// Return address and stack pointer of the call being run over.
    pub stepping_over: Option<(TargetAddress, TargetAddress)>,
}

impl StepOperation
{
    /// Step within `frame`.
    #[must_use]
    pub fn new(frame: StepFrame) -> Self
    {
        Self {
            frame,
            return_address: None,
            entering_call: false,
            stepping_over: None,
        }
    }

    /// Run to `return_address` instead of single-stepping out of the frame.
    #[must_use]
    pub fn with_return_address(mut self, return_address: Option<TargetAddress>) -> Self
    {
        self.return_address = return_address;
        self
    }
}

/// Continue until a breakpoint, optionally stopping at `until`.
#[derive(Debug, Clone, Copy)]
pub struct RunOperation
{
    /// Address to stop at.
    pub until: Option<TargetAddress>,
    /// Nobody waits for this run to finish.
    pub in_background: bool,
}

/// Step over one breakpoint while the other threads are frozen.
#[derive(Debug, Clone, Copy)]
pub struct StepOverBreakpoint
{
    /// The breakpoint under the program counter.
    pub id: BreakpointId,
    /// Its address.
    pub address: TargetAddress,
    /// This operation took the global thread lock and must release it.
    pub acquired_lock: bool,
    /// The breakpoint is currently disabled by this operation.
    pub disabled: bool,
}

impl StepOverBreakpoint
{
    /// Step over `id` at `address`.
    #[must_use]
    pub fn new(id: BreakpointId, address: TargetAddress) -> Self
    {
        Self {
            id,
            address,
            acquired_lock: false,
            disabled: false,
        }
    }
}

/// Everything a synthetic call has to put back once it returns.
#[derive(Debug, Clone)]
pub struct SavedState
{
    /// Registers at the time of the call.
    pub registers: Registers,
    /// Current frame at the time of the call.
    pub frame: Option<StackFrame>,
    /// Cached backtrace at the time of the call.
    pub backtrace: Option<Backtrace>,
}

/// Outcome of a runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeInvokeResult
{
    /// Returned object, when the method returned normally.
    pub return_value: Option<TargetAddress>,
    /// Thrown exception object.
    pub exception: Option<TargetAddress>,
    /// Message of the thrown exception, when the runtime can tell.
    pub exception_message: Option<String>,
    /// The call never returned (the thread stopped inside it or died).
    pub aborted: bool,
}

impl RuntimeInvokeResult
{
    /// Result for an invocation that did not return.
    #[must_use]
    pub fn aborted() -> Self
    {
        Self {
            aborted: true,
            ..Self::default()
        }
    }
}

/// Stage of a [`RuntimeInvoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeStage
{
    /// Waiting for the runtime to compile the method.
    Compiling,
    /// Waiting for the invocation itself.
    Invoking,
}

/// Invoke a managed method through the runtime's invoke entry point.
#[derive(Debug)]
pub struct RuntimeInvoke
{
    /// Method handle (before compilation) or code address.
    pub method: TargetAddress,
    /// `this` object, null for static methods.
    pub object: TargetAddress,
    /// Marshaled argument words.
    pub arguments: Vec<u64>,
    /// Current stage.
    pub stage: InvokeStage,
    /// Id of the outstanding synthetic call.
    pub callback_id: u64,
    /// State to restore afterwards.
    pub saved: Option<SavedState>,
    /// This operation took the global thread lock.
    pub acquired_lock: bool,
    /// Signalled with the outcome.
    pub result: Completion<RuntimeInvokeResult>,
}

/// Call a native function with integer arguments.
#[derive(Debug)]
pub struct CallMethod
{
    /// Function address.
    pub method: TargetAddress,
    /// Argument words.
    pub arguments: Vec<u64>,
    /// Id of the outstanding synthetic call.
    pub callback_id: u64,
    /// State to restore afterwards.
    pub saved: Option<SavedState>,
    /// This operation took the global thread lock.
    pub acquired_lock: bool,
    /// Signalled with the return value, or `None` if the call did not return.
    pub result: Completion<Option<u64>>,
}

/// Stage of a [`CompileMethod`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStage
{
    /// Waiting for the runtime to compile the method.
    Compiling,
    /// Running to the compiled code (or past the call).
    RunningTo(TargetAddress),
}

/// Compile the method behind a trampoline call, then enter or skip it.
#[derive(Debug)]
pub struct CompileMethod
{
    /// Method handle recovered from the trampoline.
    pub handle: TargetAddress,
    /// The call instruction.
    pub call_site: TargetAddress,
    /// Encoded length of the call instruction.
    pub call_size: usize,
    /// Id of the outstanding synthetic call.
    pub callback_id: u64,
    /// Registers at the call site.
    pub saved_registers: Option<Registers>,
    /// Current stage.
    pub stage: CompileStage,
}

/// Compile a method and put a breakpoint at the start of its body.
pub struct InsertBreakpoint
{
    /// Method handle.
    pub handle: TargetAddress,
    /// User-level breakpoint to install.
    pub breakpoint: Arc<Breakpoint>,
    /// Id of the outstanding synthetic call.
    pub callback_id: u64,
    /// State to restore afterwards.
    pub saved: Option<SavedState>,
    /// Signalled with the new id, or `None` if compilation never finished.
    pub result: Completion<Option<BreakpointId>>,
}

impl fmt::Debug for InsertBreakpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("InsertBreakpoint")
            .field("handle", &self.handle)
            .field("breakpoint", &self.breakpoint.index())
            .field("callback_id", &self.callback_id)
            .finish_non_exhaustive()
    }
}

/// Report a thrown exception.
#[derive(Debug, Clone)]
pub struct ExceptionStop
{
    /// The exception object.
    pub exception: TargetAddress,
    /// The catchpoint that matched; `None` for unhandled exceptions.
    pub catchpoint: Option<u32>,
    /// Nobody handles the exception.
    pub unhandled: bool,
}

/// One in-flight stepping intent
#[derive(Debug)]
pub enum Operation
{
    /// Instruction, line and finish steps.
    Step(StepOperation),
    /// Continue.
    Run(RunOperation),
    /// Breakpoint step-over.
    StepOverBreakpoint(StepOverBreakpoint),
    /// Managed invocation.
    RuntimeInvoke(RuntimeInvoke),
    /// Native call.
    CallMethod(CallMethod),
    /// Trampoline compilation.
    CompileMethod(CompileMethod),
    /// Breakpoint in a not yet compiled method.
    InsertBreakpoint(InsertBreakpoint),
    /// Exception stop.
    Exception(ExceptionStop),
    /// Step through a runtime wrapper; behaves like a line step over the
    /// wrapper's whole body.
    Wrapper(StepOperation),
}

impl Operation
{
    /// Discriminant for logs.
    #[must_use]
    pub fn kind(&self) -> OperationKind
    {
        match self {
            Operation::Step(step) => match step.frame.mode {
                StepMode::SingleInstruction => OperationKind::SingleInstructionStep,
                StepMode::NativeInstruction => OperationKind::NativeInstructionStep,
                StepMode::NextInstruction => OperationKind::NextInstructionStep,
                StepMode::SourceLine => OperationKind::SourceLineStep,
                StepMode::NextLine => OperationKind::NextLineStep,
                StepMode::Finish => OperationKind::Finish,
                StepMode::FinishNative => OperationKind::FinishNative,
            },
            Operation::Run(_) => OperationKind::Run,
            Operation::StepOverBreakpoint(_) => OperationKind::StepOverBreakpoint,
            Operation::RuntimeInvoke(_) => OperationKind::RuntimeInvoke,
            Operation::CallMethod(_) => OperationKind::CallMethod,
            Operation::CompileMethod(_) => OperationKind::CompileMethod,
            Operation::InsertBreakpoint(_) => OperationKind::InsertBreakpoint,
            Operation::Exception(stop) if stop.unhandled => OperationKind::UnhandledException,
            Operation::Exception(_) => OperationKind::Exception,
            Operation::Wrapper(_) => OperationKind::WrapperStep,
        }
    }

    /// Whether the operation waits for a synthetic call's callback.
    #[must_use]
    pub fn is_callback(&self) -> bool
    {
        matches!(
            self,
            Operation::RuntimeInvoke(_)
                | Operation::CallMethod(_)
                | Operation::CompileMethod(_)
                | Operation::InsertBreakpoint(_)
        )
    }

    /// Id of the synthetic call this operation is waiting for.
    #[must_use]
    pub fn callback_id(&self) -> Option<u64>
    {
        match self {
            Operation::RuntimeInvoke(invoke) => Some(invoke.callback_id),
            Operation::CallMethod(call) => Some(call.callback_id),
            Operation::CompileMethod(compile) if compile.stage == CompileStage::Compiling => Some(compile.callback_id),
            Operation::InsertBreakpoint(insert) => Some(insert.callback_id),
            _ => None,
        }
    }

    /// Whether the operation is the background run of a thread nobody stepped.
    #[must_use]
    pub fn is_background(&self) -> bool
    {
        matches!(self, Operation::Run(run) if run.in_background)
    }
}

impl fmt::Display for Operation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Operation::Step(step) | Operation::Wrapper(step) => write!(f, "{:?} {}", self.kind(), step.frame),
            Operation::Run(RunOperation { until: Some(until), .. }) => write!(f, "Run until {until}"),
            Operation::StepOverBreakpoint(step_over) => {
                write!(f, "StepOverBreakpoint {} at {}", step_over.id, step_over.address)
            }
            _ => write!(f, "{:?}", self.kind()),
        }
    }
}
