//! # sidestep-core
//!
//! The stepping core of a native debugger backend.
//!
//! This crate sits between a low-level process backend (anything that can
//! read memory, set registers, single-step and report wait statuses, see
//! [`Inferior`]) and a debugger front end. It provides:
//! - A per-thread stepping engine: instruction, line, finish and continue
//!   steps, synthetic calls into the target, trampoline resolution
//! - A process-wide breakpoint registry with per-thread ownership
//! - Instruction decoding for x86, x86_64 and PowerPC
//! - Stack unwinding by prologue simulation, DWARF CFI and heuristics
//! - Thread coordination with a global thread lock for breakpoint step-over
//!
//! ## Architecture
//!
//! ```text
//!  wait thread ──statuses──┐
//!                          ▼
//!  commands ──────────▶ engine thread ──▶ SteppingEngine (one per thread)
//!                          │                  │
//!                          ▼                  ▼
//!                    TargetEvent        Inferior / BreakpointManager /
//!                     channel           ArchitectureDecoder / Unwinder
//! ```
//!
//! Symbol information comes from outside through [`SymbolTable`] and, for
//! targets that embed a managed runtime, [`LanguageBackend`].

pub mod arch;
pub mod breakpoints;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod inferior;
pub mod process;
pub mod symbols;
pub mod types;
pub mod unwind;

pub use arch::ArchitectureDecoder;
pub use breakpoints::{Breakpoint, BreakpointBuilder, BreakpointId, BreakpointManager, ThreadGroup};
pub use config::EngineConfig;
pub use engine::{EngineContext, EngineState, SteppingEngine, StepMode, ThreadCoordinator};
pub use error::{DebuggerError, Result};
pub use events::{event_channel, TargetEvent, TargetEventArgs, TargetEventType};
pub use inferior::{ChildEvent, Inferior, TargetAccess};
pub use process::{Completion, ThreadManager, WaitSource};
pub use symbols::{LanguageBackend, SymbolTable, SymbolTableManager};
pub use types::{Architecture, Registers, TargetAddress, ThreadId};
pub use unwind::Unwinder;
