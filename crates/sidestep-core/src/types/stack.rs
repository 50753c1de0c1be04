//! Stack frame types.

use std::fmt;
use std::sync::Arc;

use super::symbols::{Method, SourceLocation};
use super::{Registers, TargetAddress, ThreadId};

/// Indicates how a frame was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus
{
    /// Innermost frame, read straight from the thread's registers.
    Live,
    /// Recovered by simulating the method's prologue.
    Prologue,
    /// Recovered from DWARF call frame information.
    Cfi,
    /// Recovered by following the saved frame-pointer chain.
    FramePointer,
    /// Recovered by a named byte-signature heuristic.
    Heuristic,
}

/// Register-level description of one frame
///
/// Produced by the stack unwinder; immutable once built. `level` is 0 for the
/// innermost frame and grows by exactly one per unwinding step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleStackFrame
{
    /// Program counter of the frame.
    pub address: TargetAddress,
    /// Stack pointer of the frame.
    pub stack_pointer: TargetAddress,
    /// Frame pointer of the frame.
    pub frame_address: TargetAddress,
    /// Register snapshot of the frame.
    pub registers: Registers,
    /// Nesting level (0 = innermost).
    pub level: u32,
    /// How the frame was recovered.
    pub status: FrameStatus,
}

impl SimpleStackFrame
{
    /// Build the innermost frame from a live register snapshot.
    #[must_use]
    pub fn from_registers(template: TargetAddress, registers: Registers) -> Self
    {
        Self {
            address: template.with_value(registers.pc()),
            stack_pointer: template.with_value(registers.sp()),
            frame_address: template.with_value(registers.fp()),
            registers,
            level: 0,
            status: FrameStatus::Live,
        }
    }

    /// Build the caller frame of `self` from recovered registers.
    #[must_use]
    pub fn caller(&self, registers: Registers, status: FrameStatus) -> Self
    {
        Self {
            address: self.address.with_value(registers.pc()),
            stack_pointer: self.address.with_value(registers.sp()),
            frame_address: self.address.with_value(registers.fp()),
            registers,
            level: self.level + 1,
            status,
        }
    }
}

impl fmt::Display for SimpleStackFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "#{} {} (sp {}, fp {})",
            self.level, self.address, self.stack_pointer, self.frame_address
        )
    }
}

/// A frame with its symbolic information
///
/// Owned by the engine for the current stop and dropped on every resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame
{
    /// Thread the frame belongs to.
    pub thread: ThreadId,
    /// Register-level frame.
    pub simple: SimpleStackFrame,
    /// Method containing the frame's address, if known.
    pub method: Option<Arc<Method>>,
    /// Source position, if the method has line information.
    pub location: Option<SourceLocation>,
    /// Fallback symbol name for frames without a method.
    pub symbol: Option<String>,
}

impl StackFrame
{
    /// Program counter of the frame.
    #[must_use]
    pub fn address(&self) -> TargetAddress
    {
        self.simple.address
    }

    /// Stack pointer of the frame.
    #[must_use]
    pub fn stack_pointer(&self) -> TargetAddress
    {
        self.simple.stack_pointer
    }

    /// Nesting level.
    #[must_use]
    pub fn level(&self) -> u32
    {
        self.simple.level
    }

    /// Register snapshot.
    #[must_use]
    pub fn registers(&self) -> &Registers
    {
        &self.simple.registers
    }
}

impl fmt::Display for StackFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{} {}", self.simple.level, self.simple.address)?;
        if let Some(method) = &self.method {
            write!(f, " in {method}")?;
        } else if let Some(symbol) = &self.symbol {
            write!(f, " in {symbol}")?;
        }
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        Ok(())
    }
}

/// A full call stack, innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace
{
    frames: Vec<StackFrame>,
}

impl Backtrace
{
    /// Wrap already unwound frames.
    #[must_use]
    pub fn new(frames: Vec<StackFrame>) -> Self
    {
        Self { frames }
    }

    /// All frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[StackFrame]
    {
        &self.frames
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.frames.len()
    }

    /// Whether the backtrace is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.frames.is_empty()
    }
}
