//! # Error Types
//!
//! General error handling for the stepping engine and its collaborators.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

use crate::breakpoints::BreakpointId;
use crate::types::TargetAddress;

/// Main error type for debugger operations
///
/// This enum represents all the ways an engine, breakpoint or unwinding
/// operation can fail.
///
/// ## Error Categories
///
/// 1. **State errors**: NotStopped, NoTarget, AlreadyHaveTarget, CannotStartTarget
/// 2. **Breakpoint errors**: NoSuchBreakpoint
/// 3. **Native errors**: NoSuchRegister, MemoryAccess (translated from [`TargetErrorCode`])
/// 4. **Consistency errors**: Internal, RecursiveThreadLock, ChannelClosed
/// 5. **I/O errors**: Io (for loading object files, etc.)
///
/// Decode and unwind ambiguity is never an error; those paths return `None`.
#[derive(Error, Debug)]
pub enum DebuggerError
{
    /// Operation requires the target thread to be stopped
    ///
    /// Stepping commands, register writes and synthetic calls are only
    /// valid while the engine is idle. Issue `stop()` first or wait for
    /// the pending operation to complete.
    #[error("Target is not stopped")]
    NotStopped,

    /// There is no live target behind this engine
    ///
    /// The thread exited, the process was killed, or the engine was never
    /// attached.
    #[error("No target")]
    NoTarget,

    /// A target is already attached to this thread manager
    #[error("Already have a target")]
    AlreadyHaveTarget,

    /// The target could not be started or attached
    #[error("Cannot start target: {0}")]
    CannotStartTarget(String),

    /// No breakpoint with the given id is registered
    #[error("No such breakpoint: {0}")]
    NoSuchBreakpoint(BreakpointId),

    /// The register index is not valid for the target architecture
    #[error("No such register: {0}")]
    NoSuchRegister(usize),

    /// Reading or writing target memory failed
    #[error("Cannot access memory at address {0}")]
    MemoryAccess(TargetAddress),

    /// Two addresses from different address domains were combined
    #[error("Address domain mismatch: {0} and {1}")]
    AddressDomainMismatch(TargetAddress, TargetAddress),

    /// An engine asked for the global thread lock while already holding it
    #[error("Recursive global thread lock request from thread {0}")]
    RecursiveThreadLock(u64),

    /// Invalid argument passed to an engine or manager function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The collaborator does not implement this primitive
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// The engine thread is gone and can no longer accept commands
    #[error("Engine thread is no longer running")]
    ChannelClosed,

    /// An internal invariant was broken
    ///
    /// This indicates a programming error in the engine or in a collaborator
    /// (e.g. a second event buffered for a thread-locked engine).
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error from the standard library
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, DebuggerError>;

/// Low-level error codes reported by an inferior control surface.
///
/// Native backends usually speak in integer status codes. [`TargetErrorCode::into_error`]
/// translates them into [`DebuggerError`] at the boundary so that the rest of
/// the engine only ever sees typed errors.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetErrorCode
{
    /// Success, not an error.
    None = 0,
    /// Unclassified native failure.
    Unknown = 1,
    /// No target is attached.
    NoTarget = 2,
    /// A target is already attached.
    AlreadyHaveTarget = 3,
    /// The target could not be started.
    CannotStartTarget = 4,
    /// The thread is running.
    NotStopped = 5,
    /// The referenced breakpoint does not exist.
    NoSuchBreakpoint = 6,
    /// The referenced register does not exist.
    NoSuchRegister = 7,
    /// A memory access faulted.
    MemoryAccess = 8,
    /// The primitive is not supported.
    NotImplemented = 9,
    /// All hardware debug registers are in use.
    DebugRegisterOccupied = 10,
}

impl TargetErrorCode
{
    /// Decode a raw status code. Unknown values map to [`TargetErrorCode::Unknown`].
    #[must_use]
    pub const fn from_raw(code: i32) -> Self
    {
        match code {
            0 => Self::None,
            2 => Self::NoTarget,
            3 => Self::AlreadyHaveTarget,
            4 => Self::CannotStartTarget,
            5 => Self::NotStopped,
            6 => Self::NoSuchBreakpoint,
            7 => Self::NoSuchRegister,
            8 => Self::MemoryAccess,
            9 => Self::NotImplemented,
            10 => Self::DebugRegisterOccupied,
            _ => Self::Unknown,
        }
    }

    /// Translate the code into a typed error.
    ///
    /// `argument` carries the code-specific payload: the breakpoint id for
    /// `NoSuchBreakpoint`, the register index for `NoSuchRegister` and the
    /// faulting address for `MemoryAccess`. Returns `None` for [`TargetErrorCode::None`].
    #[must_use]
    pub fn into_error(self, argument: u64) -> Option<DebuggerError>
    {
        let error = match self {
            Self::None => return None,
            Self::NoTarget => DebuggerError::NoTarget,
            Self::AlreadyHaveTarget => DebuggerError::AlreadyHaveTarget,
            Self::CannotStartTarget => DebuggerError::CannotStartTarget("native start failed".to_string()),
            Self::NotStopped => DebuggerError::NotStopped,
            Self::NoSuchBreakpoint => DebuggerError::NoSuchBreakpoint(BreakpointId::from_raw(argument as u32)),
            Self::NoSuchRegister => DebuggerError::NoSuchRegister(argument as usize),
            Self::MemoryAccess => DebuggerError::MemoryAccess(TargetAddress::global(argument)),
            Self::NotImplemented => DebuggerError::NotImplemented("native primitive"),
            Self::DebugRegisterOccupied => {
                DebuggerError::InvalidArgument("all hardware debug registers are in use".to_string())
            }
            Self::Unknown => DebuggerError::Internal(format!("unknown native error (argument {argument:#x})")),
        };
        Some(error)
    }
}

/// Map a poisoned lock into an internal error.
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> DebuggerError
{
    DebuggerError::Internal("shared state lock poisoned".to_string())
}
