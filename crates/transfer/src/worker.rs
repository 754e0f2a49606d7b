//! Durable background job that keeps a batch observed after the caller
//! stops listening.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::TransferError;

/// Kind of durable worker; one exists per kind at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Uploads,
    ChatUploads,
    Downloads,
}

/// Host job scheduler.
pub trait DurableJobs: Send + Sync {
    /// Enqueues the worker of `kind`. Idempotent while one is running.
    fn enqueue(
        &self,
        kind: JobKind,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + '_>>;

    /// Whether the worker of `kind` is subscribed to the engine feed.
    fn is_job_listening(&self, kind: JobKind) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    pub poll_interval_ms: u64,
    pub listen_timeout_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            listen_timeout_ms: 30_000,
        }
    }
}

impl HandoffConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }
}

/// Polls until the worker of `kind` is listening.
///
/// Gives up after [`HandoffConfig::listen_timeout`] with a warning rather
/// than an error: the engine keeps transferring either way.
pub async fn wait_until_listening(jobs: &dyn DurableJobs, kind: JobKind, config: &HandoffConfig) {
    let deadline = tokio::time::Instant::now() + config.listen_timeout();
    loop {
        if jobs.is_job_listening(kind).await {
            debug!(?kind, "worker listening");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                ?kind,
                waited_ms = config.listen_timeout_ms,
                "worker not listening yet, continuing handoff"
            );
            return;
        }
        tokio::time::sleep(config.poll_interval()).await;
    }
}

/// In-process scheduler: a worker "listens" after a fixed start delay.
///
/// Stands in for the host scheduler in the simulator and in tests.
#[derive(Debug, Default)]
pub struct InProcessJobs {
    start_delay: Duration,
    started: Mutex<HashMap<JobKind, (tokio::time::Instant, usize)>>,
    fail_enqueue: Mutex<Option<String>>,
}

impl InProcessJobs {
    pub fn new(start_delay: Duration) -> Self {
        Self {
            start_delay,
            ..Self::default()
        }
    }

    /// Makes the next enqueue fail with `message`.
    pub fn fail_next_enqueue(&self, message: impl Into<String>) {
        *self.fail_enqueue.lock().unwrap() = Some(message.into());
    }

    /// How many times `kind` was enqueued.
    pub fn enqueued(&self, kind: JobKind) -> usize {
        self.started
            .lock()
            .unwrap()
            .get(&kind)
            .map_or(0, |(_, count)| *count)
    }
}

impl DurableJobs for InProcessJobs {
    fn enqueue(
        &self,
        kind: JobKind,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(message) = self.fail_enqueue.lock().unwrap().take() {
                return Err(TransferError::Worker(message));
            }
            let mut started = self.started.lock().unwrap();
            let entry = started
                .entry(kind)
                .or_insert_with(|| (tokio::time::Instant::now() + self.start_delay, 0));
            entry.1 += 1;
            info!(?kind, "worker enqueued");
            Ok(())
        })
    }

    fn is_job_listening(&self, kind: JobKind) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            self.started
                .lock()
                .unwrap()
                .get(&kind)
                .is_some_and(|(ready_at, _)| tokio::time::Instant::now() >= *ready_at)
        })
    }
}
