//! Durable task queue worker: claims due tasks from `job_queue`, runs them and
//! applies the retry policy.
use crate::db::{self, Pool, QueueTask};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &QueueTask) -> Result<()>;
}

/// Delays before each automatic retry. A task fails for good once it has
/// failed `delays.len() + 1` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Delay before the next run of a task that has already failed `attempt`
    /// times and just failed again, or `None` when retries are exhausted.
    pub fn delay_for(&self, attempt: i32) -> Option<Duration> {
        usize::try_from(attempt)
            .ok()
            .and_then(|idx| self.delays.get(idx))
            .copied()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(300),
        ])
    }
}

/// Claim and run at most one due task. Returns whether a task was found.
#[instrument(skip_all)]
pub async fn process_next_task(
    pool: &Pool,
    handler: &dyn TaskHandler,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(task) = db::claim_next_task(pool, now).await? else {
        return Ok(false);
    };

    match handler.handle(&task).await {
        Ok(()) => {
            db::delete_task(pool, task.id).await?;
            info!(id = task.id, kind = %task.kind, job_id = %task.job_id, "task succeeded");
        }
        Err(err) => {
            let message = format!("{:#}", err);
            match policy.delay_for(task.attempt) {
                Some(delay) => {
                    let due_at = now + chrono::Duration::from_std(delay)?;
                    warn!(
                        ?err,
                        id = task.id,
                        job_id = %task.job_id,
                        attempt = task.attempt,
                        retry_in_secs = delay.as_secs(),
                        "task failed; backoff"
                    );
                    db::reschedule_task(pool, task.id, task.attempt + 1, due_at, &message).await?;
                }
                None => {
                    error!(
                        ?err,
                        id = task.id,
                        job_id = %task.job_id,
                        attempt = task.attempt,
                        "task failed; retries exhausted"
                    );
                    db::bury_task(pool, task.id, task.attempt + 1, &message).await?;
                }
            }
        }
    }
    Ok(true)
}

/// Spawn `workers` polling loops that run until `shutdown` is cancelled.
/// A loop finishes its current task before exiting.
pub fn spawn_workers(
    pool: Pool,
    handler: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
    workers: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let pool = pool.clone();
            let handler = handler.clone();
            let policy = policy.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(worker, "import worker started");
                while !shutdown.is_cancelled() {
                    let pause = match process_next_task(&pool, handler.as_ref(), &policy, Utc::now())
                        .await
                    {
                        Ok(true) => continue,
                        Ok(false) => poll_interval,
                        Err(err) => {
                            error!(?err, worker, "import worker error");
                            Duration::from_secs(1)
                        }
                    };
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                info!(worker, "import worker stopped");
            })
        })
        .collect()
}
