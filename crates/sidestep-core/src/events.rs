//! Target event types and helpers.
//!
//! Every stepping command ends in exactly one [`TargetEventArgs`] per engine:
//! either returned synchronously (the command finished without resuming the
//! target) or published on the event channel once the engine thread has seen
//! the stop that completes it. Callers consume these without polling.

use std::fmt;
use std::sync::mpsc;

use crate::types::{StackFrame, TargetAddress, ThreadId};

/// Kind of a user-visible target event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetEventType
{
    /// The target resumed.
    TargetRunning,
    /// The target stopped; `data` is the signal number, 0 for a plain step.
    TargetStopped,
    /// The target hit a breakpoint; `data` is the breakpoint index.
    TargetHitBreakpoint,
    /// The thread exited; `data` is the exit code.
    TargetExited,
    /// The thread was killed by a signal; `data` is the signal number.
    TargetSignaled,
    /// The current frame changed without the target running (e.g. after a
    /// synthetic call returned).
    FrameChanged,
    /// A caught exception was thrown; `data` is the catchpoint number.
    Exception,
    /// An exception without a handler was thrown.
    UnhandledException,
}

/// Payload of a target event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEventArgs
{
    /// Event kind.
    pub kind: TargetEventType,
    /// Kind-specific number (signal, exit code, breakpoint index).
    pub data: i64,
    /// The frame the thread stopped in, when it is still alive.
    pub frame: Option<StackFrame>,
    /// The exception object for exception events.
    pub exception: Option<TargetAddress>,
}

impl TargetEventArgs
{
    /// Event without a frame.
    #[must_use]
    pub fn new(kind: TargetEventType, data: i64) -> Self
    {
        Self {
            kind,
            data,
            frame: None,
            exception: None,
        }
    }

    /// Event carrying the stop frame.
    #[must_use]
    pub fn with_frame(kind: TargetEventType, data: i64, frame: Option<StackFrame>) -> Self
    {
        Self {
            kind,
            data,
            frame,
            exception: None,
        }
    }

    /// Whether the thread is gone after this event.
    #[must_use]
    pub fn is_terminal(&self) -> bool
    {
        matches!(self.kind, TargetEventType::TargetExited | TargetEventType::TargetSignaled)
    }

    /// Whether this event means the thread stopped (or died) rather than resumed.
    #[must_use]
    pub fn is_stop(&self) -> bool
    {
        self.kind != TargetEventType::TargetRunning
    }
}

impl fmt::Display for TargetEventArgs
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.kind {
            TargetEventType::TargetRunning => write!(f, "Target running")?,
            TargetEventType::TargetStopped if self.data == 0 => write!(f, "Target stopped")?,
            TargetEventType::TargetStopped => write!(f, "Stopped by signal {}", self.data)?,
            TargetEventType::TargetHitBreakpoint => write!(f, "Hit breakpoint {}", self.data)?,
            TargetEventType::TargetExited => write!(f, "Exited with code {}", self.data)?,
            TargetEventType::TargetSignaled => write!(f, "Killed by signal {}", self.data)?,
            TargetEventType::FrameChanged => write!(f, "Frame changed")?,
            TargetEventType::Exception => write!(f, "Caught exception (catchpoint {})", self.data)?,
            TargetEventType::UnhandledException => write!(f, "Unhandled exception")?,
        }
        if let Some(frame) = &self.frame {
            write!(f, " at {frame}")?;
        }
        Ok(())
    }
}

/// A target event for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEvent
{
    /// Thread the event belongs to.
    pub thread: ThreadId,
    /// Event payload.
    pub args: TargetEventArgs,
}

/// Sender side of the target event channel.
pub type TargetEventSender = mpsc::Sender<TargetEvent>;
/// Receiver side of the target event channel.
pub type TargetEventReceiver = mpsc::Receiver<TargetEvent>;

/// Create a new target event channel.
#[must_use]
pub fn event_channel() -> (TargetEventSender, TargetEventReceiver)
{
    mpsc::channel()
}
