//! Bounded-concurrency task queue with pause and drain control.
//!
//! [`TaskQueue`] holds a FIFO backlog of [`Task`]s and dispatches them while
//! it is enabled, never letting more than [`Limit`] of them run at once. A
//! second FIFO of *pause actions* runs only once every running task has
//! completed, which is how callers sequence maintenance work behind
//! in-flight tasks.
//!
//! The queue never creates threads of its own. Tasks run on whichever thread
//! triggers the dispatch: the caller of [`TaskQueue::add`] or
//! [`TaskQueue::start`], or the thread that completes a previous task.
//! Re-entrant triggers (a task adding more work or completing itself from
//! inside its own body) are folded into the dispatch loop already on the
//! stack rather than recursing.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace};

use crate::config::{AddOptions, Limit, QueueConfig};

pub mod task;

pub use task::{Done, StartSignal, Task, TaskError};
use task::{Control, panic_message, report};

type PauseAction = Box<dyn FnOnce() + Send + 'static>;

// A backlog entry: a task waiting to be dispatched.
struct Entry<C> {
    id: String,
    task: Task<C>,
}

struct State<C> {
    enabled: bool,
    backlog: VecDeque<Entry<C>>,
    pause_actions: VecDeque<PauseAction>,
    running: usize,
    limit: Limit,
    context: Option<Arc<C>>,
    // Set while a dispatch loop is on some stack; other triggers defer to it.
    dispatching: bool,
    // Same for the pause-action loop.
    pausing: bool,
    sequence: u64,
    counters: Counters,
}

#[derive(Default, Clone, Copy)]
struct Counters {
    added: u64,
    deduplicated: u64,
    dispatched: u64,
    completed: u64,
    failed: u64,
}

struct Shared<C> {
    state: Mutex<State<C>>,
    // Woken whenever the queue becomes idle.
    idle: Notify,
}

/// A point-in-time view of a queue, as returned by [`TaskQueue::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enabled: bool,
    pub running: usize,
    pub pending: usize,
    pub pending_pause_actions: usize,
    pub limit: Limit,
    /// Entries accepted into the backlog.
    pub added: u64,
    /// `add` calls ignored because their id was already waiting.
    pub deduplicated: u64,
    pub dispatched: u64,
    /// Tasks whose slot was released, including failed ones.
    pub completed: u64,
    /// Isolated failures: panicking tasks, pause actions or setup functions.
    pub failed: u64,
}

/// A bounded-concurrency task queue.
///
/// `TaskQueue` is a cheap handle: clones share the same backlog, running
/// count and flags. Separately constructed queues are fully independent.
///
/// A new queue is disabled; tasks added before [`start`](Self::start) wait
/// in the backlog.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use boundq::{Task, TaskQueue};
///
/// let queue: TaskQueue = TaskQueue::with_limit(1);
/// let order = Arc::new(Mutex::new(Vec::new()));
///
/// for n in 0..3 {
///     let order = Arc::clone(&order);
///     queue.add(Task::sync(move |_| order.lock().unwrap().push(n)));
/// }
/// assert_eq!(queue.pending(), 3);
///
/// queue.start();
/// assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
/// assert!(queue.is_idle());
/// ```
pub struct TaskQueue<C = ()> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for TaskQueue<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Send + Sync + 'static> Default for TaskQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send + Sync + 'static> TaskQueue<C> {
    /// Creates an empty, disabled, unbounded queue.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Creates an empty, disabled queue with the given concurrency limit.
    pub fn with_limit(limit: impl Into<Limit>) -> Self {
        Self::with_config(QueueConfig {
            limit: limit.into(),
        })
    }

    /// Creates an empty, disabled queue from a [`QueueConfig`].
    pub fn with_config(config: QueueConfig) -> Self {
        let state = State {
            enabled: false,
            backlog: VecDeque::new(),
            pause_actions: VecDeque::new(),
            running: 0,
            limit: config.limit,
            context: None,
            dispatching: false,
            pausing: false,
            sequence: 0,
            counters: Counters::default(),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                idle: Notify::new(),
            }),
        }
    }

    /// Sets the execution context handed to every task dispatched from now on.
    pub fn set_context(&self, context: C) {
        let previous = self.shared.state.lock().context.replace(Arc::new(context));
        // The old context may run arbitrary drop code; release the lock first.
        drop(previous);
    }

    /// Changes the concurrency limit and runs a dispatch attempt, so raising
    /// the limit fills the new slots right away.
    pub fn set_limit(&self, limit: impl Into<Limit>) {
        let limit = limit.into();
        self.shared.state.lock().limit = limit;
        debug!(%limit, "queue limit changed");
        self.shared.check();
    }

    /// Enables the queue and dispatches as much of the backlog as the limit
    /// allows, synchronously.
    ///
    /// Pause actions that are eligible (nothing running) run first. Calling
    /// `start` on an enabled queue just re-triggers dispatch.
    pub fn start(&self) {
        self.shared.check_pause();
        Arc::clone(&self.shared).enable();
    }

    /// Runs `setup` and enables the queue only once `setup` fires the
    /// [`StartSignal`] it receives, which may happen later and on another
    /// thread.
    ///
    /// Pause actions that are eligible run before `setup`. A panic in `setup`
    /// is reported as [`TaskError::Setup`] and leaves the queue as it was.
    pub fn start_with<F>(&self, setup: F)
    where
        F: FnOnce(StartSignal) + Send + 'static,
    {
        self.shared.check_pause();
        let control: Arc<dyn Control> = Arc::clone(&self.shared) as Arc<dyn Control>;
        let signal = StartSignal::new(control);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| setup(signal))) {
            let err = TaskError::Setup {
                message: panic_message(payload.as_ref()),
            };
            self.shared.record_failure(&err);
        }
    }

    /// Adds a task to the back of the backlog under a generated id and runs a
    /// dispatch attempt. Returns the id.
    pub fn add(&self, task: Task<C>) -> String {
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.generate_id();
            state.enqueue(id.clone(), task);
            id
        };
        self.shared.check();
        id
    }

    /// Adds a task with [`AddOptions`] and runs a dispatch attempt.
    ///
    /// Returns the entry id, or `None` if an entry with the same explicit id
    /// is still waiting in the backlog; the new task is then discarded. Ids of
    /// running or finished tasks are not considered.
    pub fn add_with(&self, task: Task<C>, options: impl Into<AddOptions>) -> Option<String> {
        let Some(id) = options.into().id.filter(|id| !id.is_empty()) else {
            return Some(self.add(task));
        };
        let rejected = {
            let mut state = self.shared.state.lock();
            if state.backlog.iter().any(|entry| entry.id == id) {
                state.counters.deduplicated += 1;
                trace!(id = %id, "duplicate id already queued; ignoring");
                Some(task)
            } else {
                state.enqueue(id.clone(), task);
                None
            }
        };
        self.shared.check();
        // A rejected task is dropped here, outside the lock.
        match rejected {
            Some(_) => None,
            None => Some(id),
        }
    }

    /// Disables the queue. Running tasks carry on; nothing new is dispatched
    /// until [`start`](Self::start) is called again.
    pub fn pause(&self) {
        self.shared.state.lock().enabled = false;
        debug!("queue paused");
        self.shared.check_pause();
    }

    /// Disables the queue and schedules `follow_up` to run once no task is
    /// running.
    ///
    /// The action runs on whichever thread's pause loop picks it up. When
    /// nothing is running and no pause loop is active, that is this call,
    /// before it returns; when called from inside a pause action, or while
    /// another thread is running pause actions, it runs after this call
    /// returns, from that loop. Pause actions run one at a time in the order
    /// they were scheduled.
    pub fn pause_then<F>(&self, follow_up: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            state.enabled = false;
            state.pause_actions.push_back(Box::new(follow_up));
        }
        debug!("queue paused with follow-up");
        self.shared.check_pause();
    }

    /// Pauses the queue and waits until every running task has completed.
    ///
    /// The backlog is left intact; call [`start`](Self::start) to resume.
    pub async fn drained(&self) {
        let (tx, rx) = oneshot::channel();
        self.pause_then(move || {
            let _ = tx.send(());
        });
        // An error only means the queue was dropped with the action pending.
        let _ = rx.await;
    }

    /// Waits until the backlog is empty and no task is running.
    ///
    /// Unlike [`drained`](Self::drained) this does not pause the queue, so a
    /// queue that is never started (or stays paused with work in its backlog)
    /// never becomes idle.
    pub async fn idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.shared.idle.notified());
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Removes every entry still waiting in the backlog and returns how many
    /// were removed. Running tasks and pause actions are unaffected.
    pub fn clear(&self) -> usize {
        let removed = std::mem::take(&mut self.shared.state.lock().backlog);
        debug!(removed = removed.len(), "backlog cleared");
        self.shared.notify_if_idle();
        removed.len()
    }

    /// Returns `true` if the queue may dispatch from its backlog.
    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    /// Number of dispatched tasks that have not completed.
    pub fn running(&self) -> usize {
        self.shared.state.lock().running
    }

    /// Number of entries waiting in the backlog.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().backlog.len()
    }

    /// Ids of the waiting entries, in dispatch order.
    pub fn pending_ids(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        state.backlog.iter().map(|entry| entry.id.clone()).collect()
    }

    /// Number of pause actions not yet run.
    pub fn pending_pause_actions(&self) -> usize {
        self.shared.state.lock().pause_actions.len()
    }

    pub fn limit(&self) -> Limit {
        self.shared.state.lock().limit
    }

    /// `true` when nothing is running and the backlog is empty.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.running == 0 && state.backlog.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        let c = state.counters;
        QueueStats {
            enabled: state.enabled,
            running: state.running,
            pending: state.backlog.len(),
            pending_pause_actions: state.pause_actions.len(),
            limit: state.limit,
            added: c.added,
            deduplicated: c.deduplicated,
            dispatched: c.dispatched,
            completed: c.completed,
            failed: c.failed,
        }
    }
}

impl<C: Send + Sync + 'static> fmt::Debug for TaskQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("TaskQueue")
            .field("enabled", &stats.enabled)
            .field("running", &stats.running)
            .field("pending", &stats.pending)
            .field("limit", &stats.limit)
            .finish_non_exhaustive()
    }
}

impl<C> State<C> {
    // "<unix-millis>-<sequence>"; the sequence makes collisions impossible
    // within one queue.
    fn generate_id(&mut self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        self.sequence += 1;
        format!("{millis}-{}", self.sequence)
    }

    fn enqueue(&mut self, id: String, task: Task<C>) {
        trace!(id = %id, pending = self.backlog.len() + 1, "task queued");
        self.backlog.push_back(Entry { id, task });
        self.counters.added += 1;
    }

    // Admission check: pops the next entry if one may start now.
    fn admit(&mut self) -> Option<Entry<C>> {
        if !self.limit.admits(self.running) {
            return None;
        }
        let entry = self.backlog.pop_front()?;
        self.running += 1;
        self.counters.dispatched += 1;
        Some(entry)
    }

    fn complete(&mut self, failed: bool) {
        debug_assert!(self.running > 0, "completion without a running task");
        self.running = self.running.saturating_sub(1);
        self.counters.completed += 1;
        if failed {
            self.counters.failed += 1;
        }
    }
}

impl<C: Send + Sync + 'static> Shared<C> {
    /// Dispatch attempt. Fills free slots from the backlog until the limit is
    /// reached, the backlog is empty, or the queue is disabled.
    fn check(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        loop {
            let (entry, context, running) = {
                let mut state = self.state.lock();
                if !state.enabled {
                    state.dispatching = false;
                    drop(state);
                    self.check_pause();
                    return;
                }
                match state.admit() {
                    Some(entry) => (entry, state.context.clone(), state.running),
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            debug!(id = %entry.id, running, "dispatching task");
            self.invoke(entry, context);
        }
    }

    fn invoke(self: &Arc<Self>, entry: Entry<C>, context: Option<Arc<C>>) {
        let Entry { id, task } = entry;
        match task {
            Task::Sync(body) => {
                let failure = catch_unwind(AssertUnwindSafe(|| body(context)))
                    .err()
                    .map(|payload| TaskError::Panicked {
                        id: id.clone(),
                        message: panic_message(payload.as_ref()),
                    });
                if let Some(err) = &failure {
                    report(err);
                }
                self.state.lock().complete(failure.is_some());
                debug!(id = %id, "task completed");
                self.notify_if_idle();
            }
            Task::Async(body) => {
                let control: Arc<dyn Control> = Arc::clone(self) as Arc<dyn Control>;
                let done = Done::new(id.clone(), control);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| body(context, done))) {
                    // The handle, unless the body stashed it elsewhere, was
                    // dropped while unwinding and has released the slot.
                    let err = TaskError::Panicked {
                        id,
                        message: panic_message(payload.as_ref()),
                    };
                    self.record_failure(&err);
                }
            }
        }
    }

    /// Pause-action check. Runs queued actions one after another while
    /// nothing is running.
    fn check_pause(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.pausing {
                return;
            }
            state.pausing = true;
        }

        loop {
            let action = {
                let mut state = self.state.lock();
                let next = if state.running == 0 {
                    state.pause_actions.pop_front()
                } else {
                    None
                };
                match next {
                    Some(action) => action,
                    None => {
                        state.pausing = false;
                        return;
                    }
                }
            };
            debug!("running pause action");
            if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
                let err = TaskError::PauseAction {
                    message: panic_message(payload.as_ref()),
                };
                self.record_failure(&err);
            }
        }
    }

    fn notify_if_idle(&self) {
        let idle = {
            let state = self.state.lock();
            state.running == 0 && state.backlog.is_empty()
        };
        if idle {
            trace!("queue idle");
            self.idle.notify_waiters();
        }
    }

    fn record_failure(&self, err: &TaskError) {
        report(err);
        self.state.lock().counters.failed += 1;
    }
}

impl<C: Send + Sync + 'static> Control for Shared<C> {
    fn release(self: Arc<Self>, id: &str, failure: Option<TaskError>) {
        if let Some(err) = &failure {
            report(err);
        }
        let running = {
            let mut state = self.state.lock();
            state.complete(failure.is_some());
            state.running
        };
        debug!(id = %id, running, "task completed");
        self.check();
        self.notify_if_idle();
    }

    fn enable(self: Arc<Self>) {
        self.state.lock().enabled = true;
        debug!("queue enabled");
        self.check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Stores completion handles so a test can finish tasks on demand.
    #[derive(Clone, Default)]
    struct Pending(Arc<Mutex<VecDeque<Done>>>);

    impl Pending {
        fn task(&self) -> Task {
            let slots = self.clone();
            Task::asynchronous(move |_, done| slots.0.lock().push_back(done))
        }

        fn finish_next(&self) {
            let done = self.0.lock().pop_front();
            if let Some(done) = done {
                done.done();
            }
        }

        fn len(&self) -> usize {
            self.0.lock().len()
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let for_tasks = Arc::clone(&log);
        let make = move |name: &'static str| {
            let log = Arc::clone(&for_tasks);
            Task::sync(move |_| log.lock().push(name))
        };
        (log, make)
    }

    #[test]
    fn new_queue_is_disabled_and_empty() {
        let queue: TaskQueue = TaskQueue::new();
        assert!(!queue.is_enabled());
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.limit(), Limit::Unbounded);
        assert!(queue.is_idle());
    }

    #[test]
    fn disabled_queue_holds_tasks_until_start() {
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::new();
        queue.add(task("a"));
        queue.add(task("b"));
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.running(), 0);
        assert!(log.lock().is_empty());

        queue.start();
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn duplicate_ids_are_ignored_while_waiting() {
        let queue: TaskQueue = TaskQueue::new();
        assert_eq!(queue.add_with(Task::sync(|_| {}), "x"), Some("x".to_owned()));
        assert_eq!(queue.add_with(Task::sync(|_| {}), "x"), None);
        assert_eq!(queue.pending_ids(), vec!["x".to_owned()]);
        assert_eq!(queue.stats().deduplicated, 1);
    }

    #[test]
    fn empty_ids_are_never_deduplicated() {
        let queue: TaskQueue = TaskQueue::new();
        assert!(queue.add_with(Task::sync(|_| {}), "").is_some());
        assert!(queue.add_with(Task::sync(|_| {}), "").is_some());
        let raw = AddOptions {
            id: Some(String::new()),
        };
        assert!(queue.add_with(Task::sync(|_| {}), raw).is_some());
        assert_eq!(queue.pending(), 3);
        assert_eq!(queue.stats().deduplicated, 0);
    }

    #[test]
    fn dedup_ignores_running_tasks() {
        let pending = Pending::default();
        let queue: TaskQueue = TaskQueue::new();
        queue.start();
        queue.add_with(pending.task(), "x");
        assert_eq!(queue.running(), 1);
        assert!(queue.add_with(pending.task(), "x").is_some());
        assert_eq!(queue.running(), 2);
    }

    #[test]
    fn generated_ids_are_unique() {
        let queue: TaskQueue = TaskQueue::new();
        let a = queue.add(Task::sync(|_| {}));
        let b = queue.add(Task::sync(|_| {}));
        assert_ne!(a, b);
        assert_eq!(queue.pending_ids(), vec![a, b]);
    }

    #[test]
    fn limit_one_runs_in_order() {
        let pending = Pending::default();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        queue.start();
        for _ in 0..3 {
            queue.add(pending.task());
        }
        assert_eq!(queue.running(), 1);
        assert_eq!(queue.pending(), 2);

        pending.finish_next();
        assert_eq!(queue.running(), 1);
        assert_eq!(queue.pending(), 1);

        pending.finish_next();
        pending.finish_next();
        assert!(queue.is_idle());
        assert_eq!(queue.stats().completed, 3);
    }

    #[test]
    fn limit_is_never_exceeded() {
        let pending = Pending::default();
        let queue: TaskQueue = TaskQueue::with_limit(3);
        queue.start();
        for _ in 0..10 {
            queue.add(pending.task());
            assert!(queue.running() <= 3);
        }
        while pending.len() > 0 {
            assert!(queue.running() <= 3);
            pending.finish_next();
        }
        assert!(queue.is_idle());
    }

    #[test]
    fn raising_limit_fills_new_slots() {
        let pending = Pending::default();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        for _ in 0..4 {
            queue.add(pending.task());
        }
        queue.start();
        assert_eq!(queue.running(), 1);
        queue.set_limit(3);
        assert_eq!(queue.running(), 3);
        queue.set_limit(0);
        assert_eq!(queue.running(), 4);
    }

    #[test]
    fn sync_task_frees_slot_without_done() {
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        queue.start();
        queue.add(task("a"));
        assert_eq!(queue.running(), 0);
        queue.add(task("b"));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn scenario_async_then_two_sync() {
        let pending = Pending::default();
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        queue.add(pending.task());
        queue.add(task("b"));
        queue.add(task("c"));
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 3);

        queue.start();
        assert_eq!(queue.running(), 1);
        assert_eq!(queue.pending(), 2);
        assert!(log.lock().is_empty());

        pending.finish_next();
        assert_eq!(*log.lock(), vec!["b", "c"]);
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn pause_action_waits_for_running_tasks() {
        let pending = Pending::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let queue: TaskQueue = TaskQueue::with_limit(2);
        queue.start();
        queue.add(pending.task());
        queue.add(pending.task());
        assert_eq!(queue.running(), 2);

        let probe = queue.clone();
        let counter = Arc::clone(&fired);
        queue.pause_then(move || {
            assert_eq!(probe.running(), 0);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!queue.is_enabled());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        pending.finish_next();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        pending.finish_next();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_pause_actions(), 0);
    }

    #[test]
    fn pause_action_runs_immediately_when_idle() {
        let fired = Arc::new(AtomicUsize::new(0));
        let queue: TaskQueue = TaskQueue::new();
        let counter = Arc::clone(&fired);
        queue.pause_then(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pause_actions_run_in_order() {
        let pending = Pending::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue: TaskQueue = TaskQueue::new();
        queue.start();
        queue.add(pending.task());
        for n in 0..3 {
            let log = Arc::clone(&log);
            queue.pause_then(move || log.lock().push(n));
        }
        assert_eq!(queue.pending_pause_actions(), 3);
        pending.finish_next();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn long_pause_chains_do_not_recurse() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pending = Pending::default();
        let queue: TaskQueue = TaskQueue::new();
        queue.start();
        queue.add(pending.task());
        for _ in 0..100_000 {
            let counter = Arc::clone(&counter);
            queue.pause_then(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pending.finish_next();
        assert_eq!(counter.load(Ordering::Relaxed), 100_000);
    }

    #[test]
    fn long_sync_backlogs_do_not_recurse() {
        let counter = Arc::new(AtomicUsize::new(0));
        let queue: TaskQueue = TaskQueue::with_limit(1);
        for _ in 0..100_000 {
            let counter = Arc::clone(&counter);
            queue.add(Task::asynchronous(move |_, done| {
                counter.fetch_add(1, Ordering::Relaxed);
                done.done();
            }));
        }
        queue.start();
        assert_eq!(counter.load(Ordering::Relaxed), 100_000);
        assert!(queue.is_idle());
    }

    #[test]
    fn pause_then_start_resumes_in_order() {
        let pending = Pending::default();
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        queue.start();
        queue.add(pending.task());
        queue.add(task("b"));
        queue.add(task("c"));
        queue.pause();
        pending.finish_next();
        assert!(log.lock().is_empty());
        assert_eq!(queue.pending(), 2);

        queue.start();
        assert_eq!(*log.lock(), vec!["b", "c"]);
    }

    #[test]
    fn pause_action_can_restart_queue() {
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::new();
        queue.add(task("a"));
        let restart = queue.clone();
        queue.pause_then(move || restart.start());
        assert!(queue.is_enabled());
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn start_with_defers_dispatch_until_signal() {
        let (log, task) = recorder();
        let signal = Arc::new(Mutex::new(None));
        let queue: TaskQueue = TaskQueue::new();
        queue.add(task("a"));

        let slot = Arc::clone(&signal);
        queue.start_with(move |start| *slot.lock() = Some(start));
        assert!(!queue.is_enabled());
        assert!(log.lock().is_empty());

        let start = signal.lock().take();
        if let Some(start) = start {
            start.fire();
        }
        assert!(queue.is_enabled());
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn start_twice_is_harmless() {
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::new();
        queue.start();
        queue.start();
        queue.add(task("a"));
        queue.start();
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(queue.stats().dispatched, 1);
    }

    #[test]
    fn context_is_forwarded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue: TaskQueue<String> = TaskQueue::new();
        let log = Arc::clone(&seen);
        queue.add(Task::sync(move |ctx: Option<&String>| {
            log.lock().push(ctx.cloned());
        }));
        queue.start();
        queue.set_context("tenant-7".to_owned());
        let log = Arc::clone(&seen);
        queue.add(Task::asynchronous(move |ctx: Option<&String>, done| {
            log.lock().push(ctx.cloned());
            done.done();
        }));
        assert_eq!(*seen.lock(), vec![None, Some("tenant-7".to_owned())]);
    }

    // A context whose drop code reads the queue it belongs to.
    struct Reentrant {
        queue: Arc<Mutex<Option<TaskQueue<Reentrant>>>>,
        seen: Arc<AtomicUsize>,
    }

    impl Drop for Reentrant {
        fn drop(&mut self) {
            let queue = self.queue.lock().take();
            if let Some(queue) = queue {
                self.seen.store(queue.pending() + 1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn replacing_context_drops_old_value_outside_lock() {
        let queue: TaskQueue<Reentrant> = TaskQueue::new();
        let slot = Arc::new(Mutex::new(Some(queue.clone())));
        let seen = Arc::new(AtomicUsize::new(0));
        queue.set_context(Reentrant {
            queue: Arc::clone(&slot),
            seen: Arc::clone(&seen),
        });
        queue.set_context(Reentrant {
            queue: Arc::new(Mutex::new(None)),
            seen: Arc::new(AtomicUsize::new(0)),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arguments_follow_done() {
        let seen = Arc::new(Mutex::new(None));
        let queue: TaskQueue = TaskQueue::new();
        let slot = Arc::clone(&seen);
        queue.add(Task::asynchronous_with((1u8, "two"), move |_, done, args| {
            *slot.lock() = Some(args);
            done.done();
        }));
        queue.start();
        assert_eq!(*seen.lock(), Some((1u8, "two")));
    }

    #[test]
    fn panicking_task_does_not_stop_dispatch() {
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        queue.add(Task::sync(|_| panic!("boom")));
        queue.add(Task::asynchronous(|_, _done| panic!("async boom")));
        queue.add(task("after"));
        queue.start();
        assert_eq!(*log.lock(), vec!["after"]);
        let stats = queue.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.completed, 3);
    }

    #[test]
    fn dropped_done_releases_slot() {
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        queue.add(Task::asynchronous(|_, done| drop(done)));
        queue.add(task("next"));
        queue.start();
        assert_eq!(*log.lock(), vec!["next"]);
        assert_eq!(queue.running(), 0);
    }

    #[test]
    fn task_adding_work_from_its_body() {
        let (log, task) = recorder();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        let inner = queue.clone();
        let follow = task("child");
        let log_parent = Arc::clone(&log);
        queue.add(Task::sync(move |_| {
            inner.add(follow);
            log_parent.lock().push("parent");
        }));
        queue.start();
        assert_eq!(*log.lock(), vec!["parent", "child"]);
    }

    #[test]
    fn clear_drops_waiting_entries() {
        let pending = Pending::default();
        let queue: TaskQueue = TaskQueue::with_limit(1);
        queue.start();
        for _ in 0..3 {
            queue.add(pending.task());
        }
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.running(), 1);
        pending.finish_next();
        assert!(queue.is_idle());
    }

    #[test]
    fn stats_serialize() {
        let queue: TaskQueue = TaskQueue::with_limit(2);
        queue.add(Task::sync(|_| {}));
        let json = serde_json::to_value(queue.stats()).unwrap();
        assert_eq!(json["limit"], 2);
        assert_eq!(json["pending"], 1);
        assert_eq!(json["enabled"], false);
    }

    #[test]
    fn separate_queues_are_isolated() {
        let a: TaskQueue = TaskQueue::new();
        let b: TaskQueue = TaskQueue::new();
        a.add(Task::sync(|_| {}));
        assert_eq!(a.pending(), 1);
        assert_eq!(b.pending(), 0);
        a.start();
        assert!(!b.is_enabled());
    }
}
