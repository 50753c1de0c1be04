//! The engine thread and the wait thread.
//!
//! All engine state lives on one thread. Raw wait statuses (from the wait
//! thread) and user commands (from any thread) arrive there as messages on a
//! bounded channel and are handled strictly one at a time, so engines never
//! need locks of their own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use super::{Completion, GlobalThreadLock};
use crate::breakpoints::{Breakpoint, BreakpointId};
use crate::engine::{CoordinatorAction, EngineContext, RuntimeInvokeResult, SteppingEngine, ThreadCoordinator};
use crate::error::{DebuggerError, Result};
use crate::events::{TargetEvent, TargetEventArgs, TargetEventSender, TargetEventType};
use crate::inferior::{ChildEvent, Inferior};
use crate::types::{Backtrace, Registers, TargetAddress, ThreadId};

/// Source of raw wait statuses (typically a `waitpid(-1, __WALL)` loop)
pub trait WaitSource: Send
{
    /// Block until some thread changes state.
    ///
    /// Returns `None` once there is nothing left to wait for.
    ///
    /// ## Errors
    ///
    /// The underlying wait error; the wait thread stops on the first one.
    fn wait(&mut self) -> Result<Option<(ThreadId, i32)>>;
}

type Command = Box<dyn FnOnce(&mut ProcessState) + Send>;

enum Message
{
    ChildStatus
    {
        thread: ThreadId,
        status: i32,
    },
    Command(Command),
    Shutdown,
}

/// Every engine of one process, as seen from the engine thread
pub struct ProcessState
{
    context: EngineContext,
    main_thread: ThreadId,
    engines: HashMap<ThreadId, SteppingEngine>,
    lock: Arc<GlobalThreadLock>,
    replay: VecDeque<(ThreadId, ChildEvent)>,
    waiters: HashMap<ThreadId, Completion<TargetEventArgs>>,
    awaiting_initial_stop: HashSet<ThreadId>,
    early_stops: HashSet<ThreadId>,
    events: TargetEventSender,
}

impl ProcessState
{
    /// State for a process whose initial thread is behind `inferior`.
    #[must_use]
    pub fn new(inferior: Box<dyn Inferior>, context: EngineContext, events: TargetEventSender) -> Self
    {
        let main_thread = inferior.thread_id();
        let engine = SteppingEngine::new(inferior, context.clone(), true);
        Self {
            context,
            main_thread,
            engines: HashMap::from([(main_thread, engine)]),
            lock: Arc::new(GlobalThreadLock::new()),
            replay: VecDeque::new(),
            waiters: HashMap::new(),
            awaiting_initial_stop: HashSet::new(),
            early_stops: HashSet::new(),
            events,
        }
    }

    /// The process's initial thread.
    #[must_use]
    pub fn main_thread(&self) -> ThreadId
    {
        self.main_thread
    }

    /// Known threads, sorted.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId>
    {
        let mut threads: Vec<_> = self.engines.keys().copied().collect();
        threads.sort_unstable();
        threads
    }

    /// The engine of `thread`.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::InvalidArgument`] for an unknown thread.
    pub fn engine(&self, thread: ThreadId) -> Result<&SteppingEngine>
    {
        self.engines
            .get(&thread)
            .ok_or_else(|| DebuggerError::InvalidArgument(format!("unknown thread {thread}")))
    }

    /// Mutable access to the engine of `thread`.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::InvalidArgument`] for an unknown thread.
    pub fn engine_mut(&mut self, thread: ThreadId) -> Result<&mut SteppingEngine>
    {
        self.engines
            .get_mut(&thread)
            .ok_or_else(|| DebuggerError::InvalidArgument(format!("unknown thread {thread}")))
    }

    /// The global thread lock shared by all engines.
    #[must_use]
    pub fn global_lock(&self) -> &Arc<GlobalThreadLock>
    {
        &self.lock
    }

    /// Hand a raw wait status to the engine of `thread`.
    pub fn on_child_status(&mut self, thread: ThreadId, status: i32)
    {
        if !self.engines.contains_key(&thread) {
            // A new thread can report its first stop before its creator
            // reports the creation.
            tracing::debug!(%thread, status, "status for a thread not registered yet");
            self.early_stops.insert(thread);
            return;
        }
        let result = self.run_engine(thread, |engine, state| engine.process_event(status, state));
        self.settle(thread, result);
    }

    /// Run `f` on the engine of `thread` with `self` as its coordinator.
    ///
    /// The engine is out of the map while `f` runs and always goes back in. A
    /// panic abandons the engine's operations and completes its waiter.
    fn run_engine<R, F>(&mut self, thread: ThreadId, f: F) -> Result<R>
    where
        F: FnOnce(&mut SteppingEngine, &mut Self) -> Result<R>,
    {
        let mut engine = self
            .engines
            .remove(&thread)
            .ok_or_else(|| DebuggerError::InvalidArgument(format!("unknown thread {thread}")))?;
        if let Ok(result) = panic::catch_unwind(AssertUnwindSafe(|| f(&mut engine, self))) {
            self.engines.insert(thread, engine);
            return result;
        }

        tracing::error!(%thread, "engine panicked, abandoning its operations");
        let recovered = panic::catch_unwind(AssertUnwindSafe(|| engine.abandon(self)));
        self.engines.insert(thread, engine);
        if self.lock.is_held_by(thread) {
            if let Err(error) = self.release_global_thread_lock(thread) {
                tracing::warn!(%thread, "cannot release global thread lock: {error}");
            }
        }
        let args = recovered.unwrap_or_else(|_| TargetEventArgs::new(TargetEventType::TargetStopped, 0));
        self.publish(thread, args);
        Err(DebuggerError::Internal(format!("engine of thread {thread} panicked")))
    }

    /// Start a command on the engine of `thread`.
    ///
    /// The returned completion carries the command's final event. It is
    /// already complete when the command finished without resuming the thread.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::InvalidArgument`] for an unknown thread, and whatever
    /// the command itself rejects synchronously.
    pub fn start_command<F>(&mut self, thread: ThreadId, command: F) -> Result<Completion<TargetEventArgs>>
    where
        F: FnOnce(&mut SteppingEngine, &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>>,
    {
        let result = self.run_engine(thread, |engine, state| command(engine, state));

        let completion = Completion::new();
        match result? {
            Some(args) => {
                self.waiters.insert(thread, completion.clone());
                self.publish(thread, args);
            }
            None => {
                self.waiters.insert(thread, completion.clone());
                self.send(thread, TargetEventArgs::new(TargetEventType::TargetRunning, 0));
            }
        }
        Ok(completion)
    }

    /// Replay events that were buffered while their threads were locked.
    pub fn drain_replay(&mut self)
    {
        while let Some((thread, event)) = self.replay.pop_front() {
            if !self.engines.contains_key(&thread) {
                continue;
            }
            tracing::trace!(%thread, ?event, "replaying buffered event");
            let result = self.run_engine(thread, |engine, state| engine.handle_event(event, state));
            self.settle(thread, result);
        }
    }

    fn settle(&mut self, thread: ThreadId, result: Result<Option<TargetEventArgs>>)
    {
        match result {
            Ok(Some(args)) => self.publish(thread, args),
            Ok(None) => {}
            Err(error) => tracing::error!(%thread, "event handling failed: {error}"),
        }
    }

    fn publish(&mut self, thread: ThreadId, args: TargetEventArgs)
    {
        if let Some(waiter) = self.waiters.remove(&thread) {
            waiter.complete(args.clone());
        }
        self.send(thread, args);
    }

    fn send(&self, thread: ThreadId, args: TargetEventArgs)
    {
        if self.events.send(TargetEvent { thread, args }).is_err() {
            tracing::trace!(%thread, "no event listener");
        }
    }

    fn register_thread(&mut self, parent: &dyn Inferior, thread: ThreadId) -> Result<()>
    {
        let inferior = parent.new_thread(thread)?;
        let mut engine = SteppingEngine::new(inferior, self.context.clone(), false);
        engine.prepare_background_run();

        let stopped_already = self.early_stops.remove(&thread);
        if self.lock.holder().is_some() {
            // New threads start out stopped; unlocking resumes them.
            engine.lock_stopped_thread()?;
        } else if stopped_already {
            engine.resume_background()?;
        }
        if !stopped_already {
            self.awaiting_initial_stop.insert(thread);
        }
        self.engines.insert(thread, engine);
        tracing::debug!(%thread, stopped_already, "registered new thread");
        Ok(())
    }
}

impl ThreadCoordinator for ProcessState
{
    fn acquire_global_thread_lock(&mut self, caller: ThreadId) -> Result<()>
    {
        if !self.lock.try_acquire(caller)? {
            return Err(DebuggerError::Internal(format!(
                "thread {caller} wants the global thread lock held by {:?}",
                self.lock.holder()
            )));
        }
        for (thread, engine) in &mut self.engines {
            if *thread == caller {
                continue;
            }
            if let Err(error) = engine.lock_thread() {
                tracing::warn!(%thread, "cannot lock thread: {error}");
            }
        }
        Ok(())
    }

    fn release_global_thread_lock(&mut self, caller: ThreadId) -> Result<()>
    {
        self.lock.release(caller)?;
        for (thread, engine) in &mut self.engines {
            if *thread == caller {
                continue;
            }
            match engine.unlock_thread() {
                Ok(Some(event)) => self.replay.push_back((*thread, event)),
                Ok(None) => {}
                Err(error) => tracing::warn!(%thread, "cannot unlock thread: {error}"),
            }
        }
        Ok(())
    }

    fn holds_global_thread_lock(&self, caller: ThreadId) -> bool
    {
        self.lock.is_held_by(caller)
    }

    fn handle_child_event(
        &mut self,
        thread: ThreadId,
        inferior: &mut dyn Inferior,
        event: &ChildEvent,
    ) -> Result<CoordinatorAction>
    {
        match event {
            ChildEvent::CreatedThread { thread: created } => {
                self.register_thread(inferior, *created)?;
                Ok(CoordinatorAction::Handled { resume: true })
            }
            ChildEvent::Stopped { .. } | ChildEvent::Interrupted if self.awaiting_initial_stop.contains(&thread) => {
                self.awaiting_initial_stop.remove(&thread);
                tracing::trace!(%thread, "initial stop of new thread");
                Ok(CoordinatorAction::Handled { resume: true })
            }
            _ => Ok(CoordinatorAction::Ignored),
        }
    }
}

/// Owner of the engine thread and the wait thread
///
/// Every method may be called from any thread. Stepping commands return a
/// [`Completion`] for their final event; the same event is also published on
/// the event channel, preceded by a `TargetRunning` event when the thread
/// was resumed.
pub struct ThreadManager
{
    sender: mpsc::SyncSender<Message>,
    main_thread: ThreadId,
    lock: Arc<GlobalThreadLock>,
    engine_thread: Option<JoinHandle<()>>,
    wait_thread: Option<JoinHandle<()>>,
}

impl ThreadManager
{
    /// Start managing the process whose initial thread is behind `inferior`.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::Io`] if a thread cannot be spawned.
    pub fn start(
        inferior: Box<dyn Inferior>,
        context: EngineContext,
        mut wait_source: Box<dyn WaitSource>,
        events: TargetEventSender,
    ) -> Result<Self>
    {
        let capacity = context.config.event_channel_capacity;
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let mut state = ProcessState::new(inferior, context, events);
        let main_thread = state.main_thread();
        let lock = Arc::clone(state.global_lock());

        let engine_thread = thread::Builder::new()
            .name("sidestep-engine".to_string())
            .spawn(move || run_engine_loop(&mut state, &receiver))?;

        let status_sender = sender.clone();
        let wait_thread = thread::Builder::new().name("sidestep-wait".to_string()).spawn(move || loop {
            match wait_source.wait() {
                Ok(Some((thread, status))) => {
                    if status_sender.send(Message::ChildStatus { thread, status }).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("nothing left to wait for");
                    break;
                }
                Err(error) => {
                    tracing::error!("wait failed: {error}");
                    break;
                }
            }
        })?;

        Ok(Self {
            sender,
            main_thread,
            lock,
            engine_thread: Some(engine_thread),
            wait_thread: Some(wait_thread),
        })
    }

    /// The process's initial thread.
    #[must_use]
    pub fn main_thread(&self) -> ThreadId
    {
        self.main_thread
    }

    /// Thread currently holding the global thread lock.
    #[must_use]
    pub fn lock_holder(&self) -> Option<ThreadId>
    {
        self.lock.holder()
    }

    /// Run `command` on the engine thread and wait for its result.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::ChannelClosed`] once the engine thread is gone.
    pub fn submit<R, F>(&self, command: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ProcessState) -> R + Send + 'static,
    {
        let (reply, result) = mpsc::channel();
        let message = Message::Command(Box::new(move |state| {
            // The caller may have given up waiting.
            let _ = reply.send(command(state));
        }));
        self.sender.send(message).map_err(|_| DebuggerError::ChannelClosed)?;
        result.recv().map_err(|_| DebuggerError::ChannelClosed)
    }

    /// Run a stepping command on the engine of `thread`.
    ///
    /// ## Errors
    ///
    /// The command's synchronous rejection, or
    /// [`DebuggerError::ChannelClosed`] once the engine thread is gone.
    pub fn command<F>(&self, thread: ThreadId, command: F) -> Result<Completion<TargetEventArgs>>
    where
        F: FnOnce(&mut SteppingEngine, &mut dyn ThreadCoordinator) -> Result<Option<TargetEventArgs>> + Send + 'static,
    {
        self.submit(move |state| state.start_command(thread, command))?
    }

    /// Run a query on the engine of `thread`.
    ///
    /// ## Errors
    ///
    /// The query's error, or [`DebuggerError::ChannelClosed`].
    pub fn with_engine<R, F>(&self, thread: ThreadId, query: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SteppingEngine) -> Result<R> + Send + 'static,
    {
        self.submit(move |state| state.engine_mut(thread).and_then(query))?
    }

    /// Known threads.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::ChannelClosed`].
    pub fn threads(&self) -> Result<Vec<ThreadId>>
    {
        self.submit(|state| state.threads())
    }

    /// Step one source line.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn step_line(&self, thread: ThreadId) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, |engine, coordinator| engine.step_line(coordinator))
    }

    /// Step one source line over calls.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn next_line(&self, thread: ThreadId) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, |engine, coordinator| engine.next_line(coordinator))
    }

    /// Step one instruction.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn step_instruction(&self, thread: ThreadId) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, |engine, coordinator| engine.step_instruction(coordinator))
    }

    /// Step one instruction over calls.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn next_instruction(&self, thread: ThreadId) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, |engine, coordinator| engine.next_instruction(coordinator))
    }

    /// Run to the end of the current method.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn finish(&self, thread: ThreadId) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, |engine, coordinator| engine.finish(coordinator))
    }

    /// Continue `thread`, optionally until `until`.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn continue_thread(&self, thread: ThreadId, until: Option<TargetAddress>) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, move |engine, coordinator| {
            engine.continue_to(until, false, coordinator)
        })
    }

    /// Invoke a managed method; `result` receives its outcome.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn runtime_invoke(
        &self,
        thread: ThreadId,
        method: TargetAddress,
        object: TargetAddress,
        arguments: Vec<u64>,
        result: Completion<RuntimeInvokeResult>,
    ) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, move |engine, coordinator| {
            engine.runtime_invoke(method, object, arguments, true, result, coordinator)
        })
    }

    /// Call a native function; `result` receives the return value.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::command`].
    pub fn call_method(
        &self,
        thread: ThreadId,
        method: TargetAddress,
        arguments: Vec<u64>,
        result: Completion<Option<u64>>,
    ) -> Result<Completion<TargetEventArgs>>
    {
        self.command(thread, move |engine, coordinator| {
            engine.call_method(method, arguments, result, coordinator)
        })
    }

    /// Interrupt `thread`.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::with_engine`].
    pub fn stop(&self, thread: ThreadId) -> Result<bool>
    {
        self.with_engine(thread, SteppingEngine::stop)
    }

    /// Interrupt every busy thread; returns how many were interrupted.
    ///
    /// ## Errors
    ///
    /// [`DebuggerError::ChannelClosed`].
    pub fn stop_all(&self) -> Result<usize>
    {
        self.submit(|state| {
            let mut interrupted = 0;
            for thread in state.threads() {
                match state.engine_mut(thread).and_then(SteppingEngine::stop) {
                    Ok(true) => interrupted += 1,
                    Ok(false) | Err(DebuggerError::NoTarget) => {}
                    Err(error) => tracing::warn!(%thread, "cannot stop thread: {error}"),
                }
            }
            interrupted
        })
    }

    /// Install a process-wide breakpoint through the engine of `thread`.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::with_engine`].
    pub fn insert_breakpoint(
        &self,
        thread: ThreadId,
        breakpoint: Arc<Breakpoint>,
        address: TargetAddress,
    ) -> Result<BreakpointId>
    {
        self.with_engine(thread, move |engine| engine.insert_breakpoint(breakpoint, address))
    }

    /// Remove a breakpoint through the engine of `thread`.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::with_engine`].
    pub fn remove_breakpoint(&self, thread: ThreadId, id: BreakpointId) -> Result<()>
    {
        self.with_engine(thread, move |engine| engine.remove_breakpoint(id))
    }

    /// Registers of a stopped thread.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::with_engine`].
    pub fn registers(&self, thread: ThreadId) -> Result<Registers>
    {
        self.with_engine(thread, |engine| engine.registers())
    }

    /// Backtrace of a stopped thread.
    ///
    /// ## Errors
    ///
    /// See [`ThreadManager::with_engine`].
    pub fn backtrace(&self, thread: ThreadId, max_frames: usize) -> Result<Backtrace>
    {
        self.with_engine(thread, move |engine| engine.get_backtrace(max_frames, None))
    }

    /// Stop the engine thread; engines and their inferiors are dropped.
    ///
    /// The wait thread exits on its own once the wait source runs dry.
    pub fn shutdown(mut self)
    {
        self.stop_threads();
    }

    fn stop_threads(&mut self)
    {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.engine_thread.take() {
            if handle.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
        if let Some(handle) = self.wait_thread.take() {
            if handle.is_finished() && handle.join().is_err() {
                tracing::error!("wait thread panicked");
            }
        }
    }
}

impl Drop for ThreadManager
{
    fn drop(&mut self)
    {
        self.stop_threads();
    }
}

fn run_engine_loop(state: &mut ProcessState, receiver: &mpsc::Receiver<Message>)
{
    while let Ok(message) = receiver.recv() {
        let outcome = match message {
            Message::Shutdown => break,
            Message::ChildStatus { thread, status } => {
                panic::catch_unwind(AssertUnwindSafe(|| state.on_child_status(thread, status)))
            }
            Message::Command(command) => panic::catch_unwind(AssertUnwindSafe(|| command(state))),
        };
        if outcome.is_err() {
            tracing::error!("engine thread recovered from a panic while handling a message");
        }
        if panic::catch_unwind(AssertUnwindSafe(|| state.drain_replay())).is_err() {
            tracing::error!("engine thread recovered from a panic while replaying events");
        }
    }
    tracing::debug!("engine thread exiting");
}
