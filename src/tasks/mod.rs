//! Periodic workers.
//!
//! Every periodic function in the control plane (heartbeats, reconcile
//! loops, scheduler passes, queue polls) runs on its own [`RepeatingTask`]:
//! a named worker that invokes a [`Tick`], measures the elapsed time and
//! sleeps for the remainder of its interval. A tick that overruns its
//! interval is never queued; the worker logs a warning and starts the next
//! tick immediately. Panics are isolated to the worker's task, and a stop
//! signal ends the worker after its current iteration.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One periodic callback. Implementations log-and-continue internally;
/// anything that escapes is caught and logged by the worker.
#[async_trait]
pub trait Tick: Send + Sync {
    async fn tick(&self);
}

/// Blanket impl so closures returning futures can be ticks in tests.
pub struct FnTick<F>(pub F);

#[async_trait]
impl<F, Fut> Tick for FnTick<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn tick(&self) {
        (self.0)().await;
    }
}

/// Handle to a spawned periodic worker.
pub struct RepeatingTask {
    name: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    /// Spawn a worker invoking `tick` every `interval`.
    ///
    /// An interval of zero re-runs the tick continuously; long-poll loops
    /// use that with their own wait built into the tick.
    pub fn spawn(name: impl Into<String>, interval: Duration, tick: Arc<dyn Tick>) -> Self {
        let name = name.into();
        let (stop, mut stopped) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let start = tokio::time::Instant::now();

                // Isolate panics so one bad tick does not end the worker.
                let guarded = tokio::spawn({
                    let tick = tick.clone();
                    async move { tick.tick().await }
                });
                if let Err(e) = guarded.await {
                    error!(task = %task_name, error = %e, "Periodic function panicked");
                }

                let elapsed = start.elapsed();
                if *stopped.borrow() {
                    break;
                }

                if elapsed > interval && !interval.is_zero() {
                    warn!(
                        task = %task_name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        interval_ms = interval.as_millis() as u64,
                        "Tick overran its interval, skipping sleep"
                    );
                    continue;
                }

                let sleep = interval.saturating_sub(elapsed);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = %task_name, "Worker done");
        });

        Self { name, stop, handle }
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker to stop after its current iteration.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait for the worker to finish.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.handle.await;
    }
}

/// Stop a set of workers and wait for all of them.
pub async fn shutdown_all(tasks: Vec<RepeatingTask>) {
    for task in &tasks {
        task.stop();
    }
    for task in tasks {
        let _ = task.handle.await;
    }
}
