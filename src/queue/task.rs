//! Units of work and the handles a queue hands to them.
//!
//! A [`Task`] is either synchronous (its slot is freed as soon as the body
//! returns) or asynchronous (its slot is freed when the [`Done`] handle it
//! receives is consumed). [`StartSignal`] is the continuation passed to the
//! setup function of [`TaskQueue::start_with`](super::TaskQueue::start_with).

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};

/// Failures isolated by the queue instead of being propagated to the caller
/// that happened to trigger the dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task {id} panicked: {message}")]
    Panicked { id: String, message: String },

    #[error("task {id} needs a Tokio runtime but none is running")]
    NoRuntime { id: String },

    #[error("pause action panicked: {message}")]
    PauseAction { message: String },

    #[error("start setup function panicked: {message}")]
    Setup { message: String },
}

// The queue-side operations a handle needs; erases the context type so
// `Done` and `StartSignal` stay non-generic.
pub(crate) trait Control: Send + Sync {
    fn release(self: Arc<Self>, id: &str, failure: Option<TaskError>);
    fn enable(self: Arc<Self>);
}

type SyncFn<C> = Box<dyn FnOnce(Option<Arc<C>>) + Send + 'static>;
type AsyncFn<C> = Box<dyn FnOnce(Option<Arc<C>>, Done) + Send + 'static>;

/// A unit of work accepted by [`TaskQueue::add`](super::TaskQueue::add).
///
/// Both variants receive the queue's execution context (set with
/// [`TaskQueue::set_context`](super::TaskQueue::set_context)), or `None` if
/// no context was set.
///
/// # Examples
///
/// ```
/// use boundq::{Task, TaskQueue};
///
/// let queue: TaskQueue = TaskQueue::new();
/// queue.add(Task::sync(|_| println!("runs and finishes")));
/// queue.add(Task::asynchronous(|_, done| {
///     // hand `done` to whatever signals completion later
///     done.done();
/// }));
/// queue.start();
/// assert_eq!(queue.running(), 0);
/// ```
pub enum Task<C = ()> {
    /// Completes when its body returns.
    Sync(SyncFn<C>),

    /// Completes when the [`Done`] handle is consumed (or dropped).
    Async(AsyncFn<C>),
}

impl<C: Send + Sync + 'static> Task<C> {
    /// A task whose completion is implicit once `f` returns.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce(Option<&C>) + Send + 'static,
    {
        Self::Sync(Box::new(move |ctx: Option<Arc<C>>| f(ctx.as_deref())))
    }

    /// A task that signals its own completion through [`Done`].
    pub fn asynchronous<F>(f: F) -> Self
    where
        F: FnOnce(Option<&C>, Done) + Send + 'static,
    {
        Self::Async(Box::new(move |ctx: Option<Arc<C>>, done| {
            f(ctx.as_deref(), done)
        }))
    }

    /// Like [`Task::asynchronous`], with `args` forwarded after the
    /// completion handle.
    ///
    /// ```
    /// use boundq::{Task, TaskQueue};
    ///
    /// let queue: TaskQueue = TaskQueue::new();
    /// queue.add(Task::asynchronous_with(("resize", 640u32), |_, done, (op, width)| {
    ///     assert_eq!(op, "resize");
    ///     assert_eq!(width, 640);
    ///     done.done();
    /// }));
    /// queue.start();
    /// ```
    pub fn asynchronous_with<A, F>(args: A, f: F) -> Self
    where
        A: Send + 'static,
        F: FnOnce(Option<&C>, Done, A) + Send + 'static,
    {
        Self::Async(Box::new(move |ctx: Option<Arc<C>>, done| {
            f(ctx.as_deref(), done, args)
        }))
    }

    /// An asynchronous task backed by a future spawned on the Tokio runtime
    /// that is current when the task is built. The slot is released when the
    /// future finishes.
    ///
    /// The runtime is captured here, not at dispatch, so the future still
    /// runs when the dispatch is triggered from a thread outside the runtime.
    /// If no runtime was current at construction, the task is reported as
    /// [`TaskError::NoRuntime`] when dispatched and its slot released. A
    /// panic inside the future is reported as [`TaskError::Panicked`].
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Option<Arc<C>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current();
        Self::Async(Box::new(move |ctx: Option<Arc<C>>, done: Done| {
            let runtime = match runtime {
                Ok(runtime) => runtime,
                Err(_) => {
                    let id = done.id().to_owned();
                    done.fail(TaskError::NoRuntime { id });
                    return;
                }
            };

            let work = runtime.spawn(f(ctx));
            runtime.spawn(async move {
                match work.await {
                    Ok(()) => done.done(),
                    Err(e) => {
                        let id = done.id().to_owned();
                        let message = if e.is_panic() {
                            panic_message(e.into_panic().as_ref())
                        } else {
                            e.to_string()
                        };
                        done.fail(TaskError::Panicked { id, message });
                    }
                }
            });
        }))
    }

    /// Returns `true` for [`Task::Async`].
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl<C> fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Task::Sync"),
            Self::Async(_) => f.write_str("Task::Async"),
        }
    }
}

/// Completion handle for one dispatched [`Task::Async`].
///
/// Consuming the handle with [`done`](Self::done) or [`fail`](Self::fail)
/// frees the task's concurrency slot and triggers the next dispatch. The
/// handle is consumed by value, so a task cannot complete twice.
///
/// Dropping the handle without consuming it also frees the slot and logs a
/// warning. A handle that is leaked or kept alive forever holds its slot
/// forever.
pub struct Done {
    id: String,
    control: Option<Arc<dyn Control>>,
}

impl Done {
    pub(crate) fn new(id: String, control: Arc<dyn Control>) -> Self {
        Self {
            id,
            control: Some(control),
        }
    }

    /// The id of the queue entry this handle completes.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signals successful completion.
    pub fn done(mut self) {
        self.finish(None);
    }

    /// Signals completion with a failure; the slot is freed all the same.
    pub fn fail(mut self, err: TaskError) {
        self.finish(Some(err));
    }

    fn finish(&mut self, failure: Option<TaskError>) {
        if let Some(control) = self.control.take() {
            control.release(&self.id, failure);
        }
    }
}

impl Drop for Done {
    fn drop(&mut self) {
        if self.control.is_none() {
            return;
        }
        if !std::thread::panicking() {
            warn!(id = %self.id, "completion handle dropped without signalling; releasing slot");
        }
        self.finish(None);
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("id", &self.id)
            .field("pending", &self.control.is_some())
            .finish()
    }
}

/// Continuation handed to the setup function of
/// [`TaskQueue::start_with`](super::TaskQueue::start_with).
///
/// The queue is enabled, and dispatch begins, when [`fire`](Self::fire) is
/// called. Dropping the signal leaves the queue disabled.
pub struct StartSignal {
    control: Arc<dyn Control>,
}

impl StartSignal {
    pub(crate) fn new(control: Arc<dyn Control>) -> Self {
        Self { control }
    }

    /// Enables the queue and starts dispatching.
    pub fn fire(self) {
        self.control.enable();
    }
}

impl fmt::Debug for StartSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartSignal").finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

// Reports an isolated failure.
pub(crate) fn report(err: &TaskError) {
    error!(error = %err, "task failure isolated from dispatch");
}
