//! Engine and thread manager configuration.
//!
//! Defaults suit a Linux debuggee. Environment variables override them when
//! loaded with [`EngineConfig::from_env`]:
//!
//! - `SIDESTEP_MAX_FRAMES`: backtrace depth limit
//! - `SIDESTEP_EVENT_CAPACITY`: bound of the wait-thread channel
//! - `SIDESTEP_LOCK_DURING_INVOKE`: `1`/`true` to freeze other threads around synthetic calls

use std::env;

use crate::arch::{default_signatures, UnwindSignature};
use crate::types::Architecture;

/// Tunables shared by every engine of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig
{
    /// Maximum number of frames in a backtrace.
    pub max_backtrace_frames: usize,
    /// Capacity of the wait-thread to engine-thread channel.
    pub event_channel_capacity: usize,
    /// Take the global thread lock around `RuntimeInvoke` and `CallMethod`.
    pub lock_threads_during_invoke: bool,
    /// Signals that are passed to the target without stopping.
    pub ignored_signals: Vec<i32>,
    /// Signals that end the current operation with `TargetSignaled`.
    pub fatal_signals: Vec<i32>,
    /// libc unwind signatures; `None` selects the architecture defaults.
    pub unwind_signatures: Option<Vec<UnwindSignature>>,
    /// Step into runtime wrapper methods instead of stopping in them.
    pub step_into_wrappers: bool,
}

impl Default for EngineConfig
{
    fn default() -> Self
    {
        Self {
            max_backtrace_frames: 256,
            event_channel_capacity: 64,
            lock_threads_during_invoke: false,
            ignored_signals: vec![libc::SIGCHLD, libc::SIGWINCH, libc::SIGPROF, libc::SIGALRM, libc::SIGURG],
            fatal_signals: vec![libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE, libc::SIGABRT],
            unwind_signatures: None,
            step_into_wrappers: true,
        }
    }
}

impl EngineConfig
{
    /// Defaults overlaid with the `SIDESTEP_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self
    {
        let mut config = Self::default();
        if let Some(frames) = parse_var("SIDESTEP_MAX_FRAMES") {
            config.max_backtrace_frames = frames;
        }
        if let Some(capacity) = parse_var("SIDESTEP_EVENT_CAPACITY") {
            config.event_channel_capacity = capacity;
        }
        if let Ok(value) = env::var("SIDESTEP_LOCK_DURING_INVOKE") {
            config.lock_threads_during_invoke = matches!(value.trim(), "1" | "true" | "yes");
        }
        config
    }

    /// Set the backtrace depth limit.
    #[must_use]
    pub fn with_max_backtrace_frames(mut self, frames: usize) -> Self
    {
        self.max_backtrace_frames = frames.max(1);
        self
    }

    /// Set the wait-thread channel capacity.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self
    {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Freeze other threads during synthetic calls.
    #[must_use]
    pub fn with_lock_threads_during_invoke(mut self, lock: bool) -> Self
    {
        self.lock_threads_during_invoke = lock;
        self
    }

    /// Replace the ignored signal set.
    #[must_use]
    pub fn with_ignored_signals(mut self, signals: Vec<i32>) -> Self
    {
        self.ignored_signals = signals;
        self
    }

    /// Replace the fatal signal set.
    #[must_use]
    pub fn with_fatal_signals(mut self, signals: Vec<i32>) -> Self
    {
        self.fatal_signals = signals;
        self
    }

    /// Replace the libc unwind signatures.
    #[must_use]
    pub fn with_unwind_signatures(mut self, signatures: Vec<UnwindSignature>) -> Self
    {
        self.unwind_signatures = Some(signatures);
        self
    }

    /// Enter or skip runtime wrapper methods.
    #[must_use]
    pub fn with_step_into_wrappers(mut self, step_into: bool) -> Self
    {
        self.step_into_wrappers = step_into;
        self
    }

    /// Signatures to install for `architecture`.
    #[must_use]
    pub fn signatures_for(&self, architecture: Architecture) -> Vec<UnwindSignature>
    {
        self.unwind_signatures
            .clone()
            .unwrap_or_else(|| default_signatures(architecture))
    }

    /// Whether `signal` is passed through without stopping.
    #[must_use]
    pub fn is_ignored_signal(&self, signal: i32) -> bool
    {
        self.ignored_signals.contains(&signal)
    }

    /// Whether `signal` ends the current operation.
    #[must_use]
    pub fn is_fatal_signal(&self, signal: i32) -> bool
    {
        self.fatal_signals.contains(&signal)
    }
}

fn parse_var(name: &str) -> Option<usize>
{
    let value = env::var(name).ok()?;
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            tracing::warn!("ignoring invalid {name}={value:?}");
            None
        }
    }
}
