//! Interval tasks with explicit cancellation.
//!
//! Components that need a timer get a named ticker task driven by a shared
//! shutdown signal, instead of self-rescheduling callbacks. Failover
//! restarts a component by cancelling its handle and spawning a fresh one.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Process-wide shutdown signal. Cloneable sender side; every task holds a
/// receiver and exits when the flag flips.
#[derive(Clone)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// A running component task. Dropping the handle does not stop the task;
/// call `abort` (failover restart path) or flip the shutdown signal.
pub struct TaskHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn abort(&self) {
        debug!(task = self.name, "aborting task");
        self.handle.abort();
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Spawn a named task.
pub fn spawn_named<Fut>(name: &'static str, fut: Fut) -> TaskHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    debug!(task = name, "spawning task");
    TaskHandle {
        name,
        handle: tokio::spawn(fut),
    }
}

/// Spawn a ticker that runs `work` every `period` until shutdown.
pub fn spawn_interval<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut work: F,
) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    spawn_named(name, async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => work().await,
                _ = shutdown.changed() => {
                    debug!(task = name, "task shut down");
                    break;
                }
            }
        }
    })
}
