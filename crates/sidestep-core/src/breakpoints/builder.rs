//! # Breakpoint Builder
//!
//! User-level breakpoint objects and a fluent builder for them.
//!
//! A [`Breakpoint`] is the "stop here" intent: it decides whether a hit on a
//! given thread should actually stop that thread. The registry entry in the
//! [`BreakpointManager`](super::BreakpointManager) only knows about the
//! installed address.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{Registers, ThreadId};

/// Type alias for breakpoint condition functions.
///
/// A condition function takes a reference to the register state of the
/// stopped thread and returns `true` if the breakpoint should trigger.
pub type BreakpointCondition = Box<dyn Fn(&Registers) -> bool + Send + Sync>;

/// The set of threads a breakpoint applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadGroup
{
    /// Every thread of the process.
    Global,
    /// A named set of threads.
    Named
    {
        /// Group name shown to the user.
        name: String,
        /// Member threads.
        threads: HashSet<ThreadId>,
    },
}

impl ThreadGroup
{
    /// The process-wide group.
    #[must_use]
    pub fn global() -> Self
    {
        Self::Global
    }

    /// A named group of threads.
    #[must_use]
    pub fn named(name: impl Into<String>, threads: impl IntoIterator<Item = ThreadId>) -> Self
    {
        Self::Named {
            name: name.into(),
            threads: threads.into_iter().collect(),
        }
    }

    /// A group containing only `thread`.
    #[must_use]
    pub fn thread(thread: ThreadId) -> Self
    {
        Self::named(thread.to_string(), [thread])
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str
    {
        match self {
            Self::Global => "global",
            Self::Named { name, .. } => name,
        }
    }

    /// Whether `thread` belongs to this group.
    #[must_use]
    pub fn contains(&self, thread: ThreadId) -> bool
    {
        match self {
            Self::Global => true,
            Self::Named { threads, .. } => threads.contains(&thread),
        }
    }

    /// Add a thread to a named group; the global group already has every thread.
    pub fn add(&mut self, thread: ThreadId)
    {
        if let Self::Named { threads, .. } = self {
            threads.insert(thread);
        }
    }
}

/// A user-level breakpoint
///
/// Shared between the registry and the caller through an `Arc`; the hit
/// counter is atomic so it can be bumped from the engine thread while the
/// caller reads it.
pub struct Breakpoint
{
    index: u32,
    name: String,
    group: ThreadGroup,
    hit_count: AtomicU64,
    ignore_count: u64,
    condition: Option<BreakpointCondition>,
}

impl fmt::Debug for Breakpoint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Breakpoint")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("hit_count", &self.hit_count())
            .field("ignore_count", &self.ignore_count)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

impl Breakpoint
{
    /// User-visible breakpoint number.
    #[must_use]
    pub fn index(&self) -> u32
    {
        self.index
    }

    /// Breakpoint name (usually the location it was set on).
    #[must_use]
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Threads the breakpoint applies to.
    #[must_use]
    pub fn group(&self) -> &ThreadGroup
    {
        &self.group
    }

    /// Number of qualifying hits so far, including ignored ones.
    #[must_use]
    pub fn hit_count(&self) -> u64
    {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Whether a hit by `thread` concerns this breakpoint at all.
    #[must_use]
    pub fn applies_to(&self, thread: ThreadId) -> bool
    {
        self.group.contains(thread)
    }

    /// Decide whether a hit by `thread` should stop it.
    ///
    /// A hit from a thread outside the group, or one whose condition is false,
    /// does not count. Counted hits stop once the ignore count is used up.
    #[must_use]
    pub fn check_breakpoint_hit(&self, thread: ThreadId, registers: &Registers) -> bool
    {
        if !self.applies_to(thread) {
            return false;
        }
        if self.condition.as_ref().is_some_and(|condition| !condition(registers)) {
            return false;
        }
        let hits = self.hit_count.fetch_add(1, Ordering::Relaxed) + 1;
        hits > self.ignore_count
    }
}

/// Builder for [`Breakpoint`].
///
/// ## Example
///
/// ```rust
/// use sidestep_core::breakpoints::builder::{BreakpointBuilder, ThreadGroup};
/// use sidestep_core::types::ThreadId;
///
/// let breakpoint = BreakpointBuilder::new(1)
///     .named("main.c:42")
///     .for_group(ThreadGroup::thread(ThreadId(7)))
///     .with_ignore_count(2)
///     .build();
/// assert!(breakpoint.applies_to(ThreadId(7)));
/// assert!(!breakpoint.applies_to(ThreadId(8)));
/// ```
pub struct BreakpointBuilder
{
    index: u32,
    name: Option<String>,
    group: ThreadGroup,
    ignore_count: u64,
    condition: Option<BreakpointCondition>,
}

impl fmt::Debug for BreakpointBuilder
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("BreakpointBuilder")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("ignore_count", &self.ignore_count)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

impl BreakpointBuilder
{
    /// Start a global, unconditional breakpoint with user number `index`.
    #[must_use]
    pub fn new(index: u32) -> Self
    {
        Self {
            index,
            name: None,
            group: ThreadGroup::Global,
            ignore_count: 0,
            condition: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self
    {
        self.name = Some(name.into());
        self
    }

    /// Restrict the breakpoint to a thread group.
    #[must_use]
    pub fn for_group(mut self, group: ThreadGroup) -> Self
    {
        self.group = group;
        self
    }

    /// Restrict the breakpoint to a single thread.
    #[must_use]
    pub fn for_thread(self, thread: ThreadId) -> Self
    {
        self.for_group(ThreadGroup::thread(thread))
    }

    /// Skip the first `count` qualifying hits.
    #[must_use]
    pub fn with_ignore_count(mut self, count: u64) -> Self
    {
        self.ignore_count = count;
        self
    }

    /// Only stop when `condition` holds for the thread's registers.
    #[must_use]
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Registers) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Box::new(condition));
        self
    }

    /// Finish the breakpoint.
    #[must_use]
    pub fn build(self) -> Arc<Breakpoint>
    {
        Arc::new(Breakpoint {
            index: self.index,
            name: self.name.unwrap_or_else(|| format!("breakpoint {}", self.index)),
            group: self.group,
            hit_count: AtomicU64::new(0),
            ignore_count: self.ignore_count,
            condition: self.condition,
        })
    }
}
