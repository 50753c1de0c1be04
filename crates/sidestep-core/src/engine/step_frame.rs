//! Step modes and the bounds of one stepping operation.

use std::fmt;
use std::sync::Arc;

use crate::symbols::LanguageBackend;
use crate::types::{SimpleStackFrame, TargetAddress};

/// Granularity of a stepping operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepMode
{
    /// One machine instruction, never entering trampolines.
    NativeInstruction,
    /// One machine instruction; calls through runtime trampolines are followed
    /// into the compiled method.
    SingleInstruction,
    /// One machine instruction, treating calls as atomic.
    NextInstruction,
    /// One source line, entering calls that have source.
    SourceLine,
    /// One source line, stepping over calls.
    NextLine,
    /// Until the current method returns.
    Finish,
    /// Until the stack pointer rises above the captured frame.
    FinishNative,
}

impl StepMode
{
    /// Whether the mode works in source lines.
    #[must_use]
    pub fn is_source_level(self) -> bool
    {
        matches!(self, StepMode::SourceLine | StepMode::NextLine | StepMode::Finish)
    }

    /// Whether calls are stepped over instead of entered.
    #[must_use]
    pub fn steps_over_calls(self) -> bool
    {
        matches!(self, StepMode::NextInstruction | StepMode::NextLine)
    }
}

/// The range (or stack depth) a stepping operation has to leave
///
/// `start..end` is half-open. When `stack_frame` is captured, leaving the
/// range by calling deeper does not count for the finish modes: the live
/// stack pointer has to rise strictly above the captured one.
#[derive(Clone)]
pub struct StepFrame
{
    /// First address of the range.
    pub start: TargetAddress,
    /// First address after the range.
    pub end: TargetAddress,
    /// Frame the operation started in.
    pub stack_frame: Option<SimpleStackFrame>,
    /// Runtime hooks used to recognize trampolines.
    pub language: Option<Arc<dyn LanguageBackend>>,
    /// Granularity.
    pub mode: StepMode,
}

impl StepFrame
{
    /// A frame that is left after any single instruction.
    #[must_use]
    pub fn instruction(mode: StepMode, language: Option<Arc<dyn LanguageBackend>>) -> Self
    {
        Self {
            start: TargetAddress::global(0),
            end: TargetAddress::global(0),
            stack_frame: None,
            language,
            mode,
        }
    }

    /// A frame bounding `[start, end)`.
    #[must_use]
    pub fn range(
        start: TargetAddress,
        end: TargetAddress,
        stack_frame: Option<SimpleStackFrame>,
        language: Option<Arc<dyn LanguageBackend>>,
        mode: StepMode,
    ) -> Self
    {
        Self {
            start,
            end,
            stack_frame,
            language,
            mode,
        }
    }

    /// Whether `address` is still inside the range.
    #[must_use]
    pub fn contains(&self, address: TargetAddress) -> bool
    {
        address.is_in_range(self.start, self.end)
    }

    /// Whether `stack_pointer` belongs to a frame called from the captured one.
    #[must_use]
    pub fn is_deeper(&self, stack_pointer: TargetAddress) -> bool
    {
        self.stack_frame
            .as_ref()
            .is_some_and(|frame| stack_pointer < frame.stack_pointer)
    }

    /// Whether `stack_pointer` is strictly above the captured frame.
    #[must_use]
    pub fn has_returned(&self, stack_pointer: TargetAddress) -> bool
    {
        self.stack_frame
            .as_ref()
            .is_some_and(|frame| stack_pointer > frame.stack_pointer)
    }
}

impl fmt::Debug for StepFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("StepFrame")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("stack_pointer", &self.stack_frame.as_ref().map(|frame| frame.stack_pointer))
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StepFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{:?} [{}, {})", self.mode, self.start, self.end)
    }
}
