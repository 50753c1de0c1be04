//! Process-level thread coordination.
//!
//! A debuggee process has one [`SteppingEngine`](crate::engine::SteppingEngine)
//! per OS thread. The [`ThreadManager`] owns them all on a single engine
//! thread, feeds them raw wait statuses from a dedicated wait thread, and
//! implements the [`ThreadCoordinator`](crate::engine::ThreadCoordinator) side
//! of the global thread lock.

pub mod completion;
pub mod lock;
pub mod manager;

pub use completion::Completion;
pub use lock::GlobalThreadLock;
pub use manager::{ProcessState, ThreadManager, WaitSource};
