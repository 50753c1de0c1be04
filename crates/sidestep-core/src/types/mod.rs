//! # Types
//!
//! Value types shared by the decoder, unwinder and stepping engine.
//!
//! Addresses, register files and frames are plain values: they are freely
//! cloned and never mutated by more than one engine.

pub mod address;
pub mod process;
pub mod registers;
pub mod stack;
pub mod symbols;

// Re-export all public types
pub use address::{AddressDomain, TargetAddress};
pub use process::{Architecture, MemoryRegion, ProcessId, ThreadId};
pub use registers::{Register, RegisterId, Registers};
pub use stack::{Backtrace, FrameStatus, SimpleStackFrame, StackFrame};
pub use symbols::{LineEntry, LineRange, Method, SourceLocation, SourceMethod, Symbol};
