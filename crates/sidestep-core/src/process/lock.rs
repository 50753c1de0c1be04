//! The process-wide thread lock.
//!
//! Only the bookkeeping lives here: who holds the lock. Freezing and
//! resuming the other threads is done by the thread manager, which owns the
//! engines.

use std::sync::{Mutex, PoisonError};

use crate::error::{DebuggerError, Result};
use crate::types::ThreadId;

/// Mutual exclusion between engines that need the world stopped
///
/// At most one thread holds the lock. A holder asking again is a
/// programming error and fails with [`DebuggerError::RecursiveThreadLock`]
/// instead of deadlocking.
#[derive(Debug, Default)]
pub struct GlobalThreadLock
{
    holder: Mutex<Option<ThreadId>>,
}

impl GlobalThreadLock
{
    /// An unheld lock.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Take the lock if it is free.
    ///
    /// Returns `false` when another thread holds it.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::RecursiveThreadLock`] if `thread` already holds it.
    pub fn try_acquire(&self, thread: ThreadId) -> Result<bool>
    {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        match *holder {
            None => {
                *holder = Some(thread);
                tracing::debug!(%thread, "acquired global thread lock");
                Ok(true)
            }
            Some(current) if current == thread => Err(DebuggerError::RecursiveThreadLock(thread.raw())),
            Some(_) => Ok(false),
        }
    }

    /// Give the lock back.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::Internal`] if `thread` does not hold it.
    pub fn release(&self, thread: ThreadId) -> Result<()>
    {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if *holder != Some(thread) {
            return Err(DebuggerError::Internal(format!(
                "thread {thread} released a global thread lock held by {:?}",
                *holder
            )));
        }
        *holder = None;
        tracing::debug!(%thread, "released global thread lock");
        Ok(())
    }

    /// Current holder.
    #[must_use]
    pub fn holder(&self) -> Option<ThreadId>
    {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `thread` holds the lock.
    #[must_use]
    pub fn is_held_by(&self, thread: ThreadId) -> bool
    {
        self.holder() == Some(thread)
    }
}
