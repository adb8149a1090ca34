//! Runs a burst of jobs through a queue limited to three at a time, then
//! waits for it to go idle before a maintenance step.
//!
//! ```text
//! RUST_LOG=boundq=debug cargo run --example drain
//! ```

use std::time::Duration;

use boundq::{Task, TaskQueue};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let queue: TaskQueue<&'static str> = TaskQueue::with_limit(3);
    queue.set_context("demo");

    for n in 0..10u64 {
        queue.add(Task::future(move |ctx| async move {
            tokio::time::sleep(Duration::from_millis(20 * (n % 4 + 1))).await;
            println!("[{}] job {n} finished", ctx.as_deref().copied().unwrap_or("?"));
        }));
    }

    queue.start();
    queue.idle().await;
    println!("idle: {:?}", queue.stats());

    queue.pause_then(|| println!("maintenance window"));
    queue.start();
}
