//! # boundq
//!
//! A bounded-concurrency task queue: submit units of work, cap how many run
//! at once, pause and resume dispatch, and run follow-up actions once every
//! in-flight task has finished.
//!
//! ## Quick Start
//!
//! ```rust
//! use boundq::{Task, TaskQueue};
//!
//! let queue: TaskQueue = TaskQueue::with_limit(2);
//!
//! queue.add(Task::sync(|_| println!("synchronous work")));
//! queue.add(Task::asynchronous(|_, done| {
//!     // keep `done` until the work finishes elsewhere
//!     done.done();
//! }));
//!
//! queue.start();
//! queue.pause_then(|| println!("everything in flight has finished"));
//! ```

// ── Core ──────────────────────────────────────────────────────────────────────
pub mod config;
pub mod queue;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{AddOptions, ConfigError, Limit, QueueConfig};
pub use queue::{Done, QueueStats, StartSignal, Task, TaskError, TaskQueue};
