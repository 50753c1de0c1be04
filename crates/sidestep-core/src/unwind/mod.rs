//! # Stack Unwinding
//!
//! Build call stacks one frame at a time.
//!
//! For each frame the unwinder tries, in order:
//!
//! 1. **Prologue simulation**, when the symbol tables know the method that
//!    contains the frame's address: the method's first bytes are read from the
//!    target and the architecture decoder replays the standard prologue.
//! 2. **DWARF CFI**, when the module covering the address carries a
//!    [`CfiTable`](cfi::CfiTable).
//! 3. **Heuristics**: the named libc signatures, then the saved frame-pointer
//!    chain (x86) or ABI back chain (PowerPC).
//!
//! A strategy that does not apply yields `None` and the next one is tried.
//! Unwinding stops when every strategy gives up, when the return address is
//! null, when the stack pointer stops growing, or at the frame limit.

pub mod cfi;

use std::cmp::Ordering;

use crate::arch::ArchitectureDecoder;
use crate::inferior::TargetAccess;
use crate::symbols::SymbolTable;
use crate::types::{SimpleStackFrame, StackFrame, TargetAddress, ThreadId};

/// Enough bytes to cover the longest prologue the decoders recognize.
const PROLOGUE_BYTES: u64 = 64;

/// Stack unwinder over one target's memory
pub struct Unwinder<'a>
{
    decoder: &'a ArchitectureDecoder,
    symbols: &'a dyn SymbolTable,
    memory: &'a dyn TargetAccess,
}

impl<'a> Unwinder<'a>
{
    /// Create an unwinder.
    #[must_use]
    pub fn new(decoder: &'a ArchitectureDecoder, symbols: &'a dyn SymbolTable, memory: &'a dyn TargetAccess) -> Self
    {
        Self {
            decoder,
            symbols,
            memory,
        }
    }

    /// Compute the caller of `frame`, or `None` if it is the outermost frame
    /// that can be determined.
    #[must_use]
    pub fn unwind_once(&self, frame: &SimpleStackFrame) -> Option<SimpleStackFrame>
    {
        if let Some(caller) = self.unwind_prologue(frame) {
            return Some(caller);
        }

        if let Some(table) = self.symbols.cfi_table(cfi::lookup_address(frame)) {
            match table.unwind(frame, self.memory) {
                Ok(Some(caller)) => return Some(caller),
                Ok(None) => {}
                Err(error) => tracing::debug!("CFI unwinding failed at {}: {error}", frame.address),
            }
        }

        self.decoder.unwind_heuristic(frame, self.memory)
    }

    fn unwind_prologue(&self, frame: &SimpleStackFrame) -> Option<SimpleStackFrame>
    {
        let method = self.symbols.lookup(frame.address)?;
        let offset = usize::try_from(frame.address.offset_from(method.start).ok()?).ok()?;
        let length = method.code_size().min(PROLOGUE_BYTES);
        let code = self.memory.read_buffer(method.start, usize::try_from(length).ok()?).ok()?;
        self.decoder.unwind_prologue(frame, self.memory, &code, offset)
    }

    /// Unwind from `initial` until no caller can be found.
    ///
    /// At most `max_frames` frames are returned, innermost first, so a limit
    /// of zero yields an empty backtrace. With `until`, the walk stops after
    /// the first frame at that address.
    #[must_use]
    pub fn backtrace(
        &self,
        initial: SimpleStackFrame,
        max_frames: usize,
        until: Option<TargetAddress>,
    ) -> Vec<SimpleStackFrame>
    {
        if max_frames == 0 {
            return Vec::new();
        }
        let mut frames = vec![initial];
        while frames.len() < max_frames {
            let Some(frame) = frames.last() else {
                break;
            };
            if until == Some(frame.address) {
                break;
            }
            let Some(caller) = self.unwind_once(frame) else {
                break;
            };
            if caller.address.is_null() {
                break;
            }
            // Each caller lives further up the stack; anything else is a loop.
            if caller.stack_pointer.partial_cmp(&frame.stack_pointer) != Some(Ordering::Greater) {
                tracing::debug!(
                    level = caller.level,
                    "stack pointer did not grow ({} -> {}), stopping",
                    frame.stack_pointer,
                    caller.stack_pointer
                );
                break;
            }
            tracing::trace!(status = ?caller.status, "unwound {caller}");
            frames.push(caller);
        }
        frames
    }

    /// Attach symbolic information to a frame.
    #[must_use]
    pub fn symbolize(&self, thread: ThreadId, simple: SimpleStackFrame) -> StackFrame
    {
        let method = self.symbols.lookup(simple.address);
        let location = method.as_ref().and_then(|method| method.source_location(simple.address));
        let symbol = if method.is_some() {
            None
        } else {
            self.symbols.simple_lookup(simple.address, false).map(|symbol| {
                if symbol.offset == 0 {
                    symbol.name
                } else {
                    format!("{}+{:#x}", symbol.name, symbol.offset)
                }
            })
        };
        StackFrame {
            thread,
            simple,
            method,
            location,
            symbol,
        }
    }
}
