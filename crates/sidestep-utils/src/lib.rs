//! # Sidestep Utilities
//!
//! Shared helpers for the sidestep workspace.
//!
//! Currently this is the logging setup used by front ends and by the core
//! crate's tests; the core itself only emits `tracing` events.

pub mod logging;

pub use logging::{
    init_logging, init_logging_to_file, init_logging_with_level, init_test_logging, LogFormat, LogLevel,
    LoggingError, LoggingGuard,
};
pub use tracing::{debug, error, info, trace, warn};
