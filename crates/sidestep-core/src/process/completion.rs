//! One-shot completion signals for asynchronous commands.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

struct Slot<T>
{
    value: Mutex<Option<T>>,
    ready: Condvar,
}

/// A value that becomes available exactly once
///
/// The engine thread completes it; any number of clones can wait for it.
/// Completing twice keeps the first value.
///
/// ## Example
///
/// ```rust
/// use std::thread;
///
/// use sidestep_core::process::Completion;
///
/// let completion = Completion::new();
/// let producer = completion.clone();
/// thread::spawn(move || producer.complete(42));
/// assert_eq!(completion.wait(), 42);
/// ```
pub struct Completion<T>
{
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Completion<T>
{
    fn clone(&self) -> Self
    {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Completion<T>
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Completion")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl<T> Completion<T>
{
    /// An empty completion.
    #[must_use]
    pub fn new() -> Self
    {
        Self {
            slot: Arc::new(Slot {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Store `value` and wake every waiter; returns `false` if already complete.
    pub fn complete(&self, value: T) -> bool
    {
        let mut slot = self.slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.slot.ready.notify_all();
        true
    }

    /// Whether a value has been stored.
    #[must_use]
    pub fn is_complete(&self) -> bool
    {
        self.slot.value.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl<T: Clone> Completion<T>
{
    /// Block until the value is available.
    #[must_use]
    pub fn wait(&self) -> T
    {
        let mut slot = self.slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = self.slot.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`; `None` if the value did not arrive.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T>
    {
        let slot = self.slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .slot
            .ready
            .wait_timeout_while(slot, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    /// The value, if already available.
    #[must_use]
    pub fn try_get(&self) -> Option<T>
    {
        self.slot.value.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
