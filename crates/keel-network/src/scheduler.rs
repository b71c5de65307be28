//! Background task scheduling with cooperative shutdown.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Owns every background task of a node. Tasks watch a shared shutdown
/// signal; [`Scheduler::shutdown`] raises it and waits for all of them.
#[derive(Debug)]
pub struct Scheduler {
    tasks: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(JoinSet::new()),
            shutdown,
        }
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run `task` every `period` until shutdown. A tick that is still running
    /// when shutdown is raised finishes first. Must be called inside a runtime.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => task().await,
                    _ = shutdown.changed() => {}
                }
            }
            debug!(task = name, "scheduler: periodic task stopped");
        });
    }

    /// Spawn a long-running task. It is expected to watch
    /// [`Scheduler::shutdown_signal`] and return when it fires.
    pub fn spawn<Fut>(&self, name: &'static str, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().spawn(async move {
            fut.await;
            debug!(task = name, "scheduler: task finished");
        });
    }

    /// Number of tasks not yet reaped.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Raise the shutdown signal and wait for every task to return.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "scheduler: task failed");
            }
        }
        debug!("scheduler: all tasks drained");
    }
}
