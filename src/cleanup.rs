//! Scheduled sweeper removing stale upload files and aged terminal job rows.
//!
//! The two actions run independently: a failure in one is logged and does
//! not stop the other, and nothing is ever reported back to jobs or clients.
use crate::db::{self, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub statuses_deleted: u64,
}

#[derive(Debug, Clone)]
pub struct CleanupSweeper {
    pool: Pool,
    upload_dir: PathBuf,
    upload_max_age: Duration,
    status_retention: Duration,
}

impl CleanupSweeper {
    pub fn new(
        pool: Pool,
        upload_dir: impl Into<PathBuf>,
        upload_max_age: Duration,
        status_retention: Duration,
    ) -> Self {
        Self {
            pool,
            upload_dir: upload_dir.into(),
            upload_max_age,
            status_retention,
        }
    }

    /// Run both actions against the reference time `now`. Never fails.
    #[instrument(skip_all)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.sweep_uploads(now).await {
            Ok(n) => report.files_deleted = n,
            Err(err) => error!(?err, dir = %self.upload_dir.display(), "upload sweep failed"),
        }

        match db::delete_terminal_statuses_before(&self.pool, now - self.status_retention).await {
            Ok(n) => report.statuses_deleted = n,
            Err(err) => error!(?err, "job status purge failed"),
        }

        info!(
            files_deleted = report.files_deleted,
            statuses_deleted = report.statuses_deleted,
            "cleanup finished"
        );
        report
    }

    /// Delete files created before `now - upload_max_age`, referenced by a
    /// job or not. Per-file errors are logged and skipped.
    async fn sweep_uploads(&self, now: DateTime<Utc>) -> Result<usize> {
        let exists = tokio::fs::try_exists(&self.upload_dir)
            .await
            .with_context(|| format!("failed to check {}", self.upload_dir.display()))?;
        if !exists {
            return Ok(0);
        }
        let threshold = now - self.upload_max_age;
        let mut entries = tokio::fs::read_dir(&self.upload_dir)
            .await
            .with_context(|| format!("failed to list {}", self.upload_dir.display()))?;

        let mut deleted = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(err) => {
                    warn!(?err, path = %path.display(), "cannot stat upload");
                    continue;
                }
            };
            // creation time is not reported everywhere; fall back to mtime
            let born = match meta.created().or_else(|_| meta.modified()) {
                Ok(t) => DateTime::<Utc>::from(t),
                Err(err) => {
                    warn!(?err, path = %path.display(), "no timestamp for upload");
                    continue;
                }
            };
            if born >= threshold {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "stale upload deleted");
                    deleted += 1;
                }
                Err(err) => warn!(?err, path = %path.display(), "failed to delete stale upload"),
            }
        }
        Ok(deleted)
    }

    /// Run a sweep every `every`, first one after a full period.
    pub fn spawn_scheduled(self, every: StdDuration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_once(Utc::now()).await;
                    }
                }
            }
            debug!("cleanup scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImportKind, JobStatus, Progress};
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn finished_job(pool: &Pool, job_id: &str, completed_at: DateTime<Utc>) {
        let mut status = JobStatus::queued(job_id, format!("/tmp/{}.csv", job_id));
        db::create_job(pool, &status, ImportKind::Unified).await.unwrap();
        status.complete(Progress::default(), completed_at);
        db::save_job_status(pool, &status).await.unwrap();
    }

    #[tokio::test]
    async fn purges_only_terminal_rows_past_retention() {
        let pool = setup_pool().await;
        let now = Utc::now();
        finished_job(&pool, "old", now - Duration::days(15)).await;
        finished_job(&pool, "recent", now - Duration::days(10)).await;
        db::create_job(&pool, &JobStatus::queued("waiting", "/tmp/w.csv"), ImportKind::Unified)
            .await
            .unwrap();

        let td = tempdir().unwrap();
        let sweeper = CleanupSweeper::new(
            pool.clone(),
            td.path().join("missing"),
            Duration::days(2),
            Duration::days(14),
        );
        let report = sweeper.run_once(now).await;
        assert_eq!(report.statuses_deleted, 1);
        assert_eq!(report.files_deleted, 0);

        assert!(db::fetch_job_status(&pool, "old").await.unwrap().is_none());
        assert!(db::fetch_job_status(&pool, "recent").await.unwrap().is_some());
        assert!(db::fetch_job_status(&pool, "waiting").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_upload_sweep_does_not_block_status_purge() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let mut failed = JobStatus::queued("failed-old", "/tmp/f.csv");
        db::create_job(&pool, &failed, ImportKind::Appointments)
            .await
            .unwrap();
        failed.fail("Processing failed: boom", now - Duration::days(15));
        db::save_job_status(&pool, &failed).await.unwrap();
        finished_job(&pool, "completed-old", now - Duration::days(20)).await;

        // a regular file where the upload directory should be makes listing fail
        let td = tempdir().unwrap();
        let not_a_dir = td.path().join("uploads");
        std::fs::write(&not_a_dir, "x").unwrap();
        let sweeper =
            CleanupSweeper::new(pool.clone(), &not_a_dir, Duration::days(2), Duration::days(14));

        assert!(sweeper.sweep_uploads(now + Duration::days(3)).await.is_err());
        let report = sweeper.run_once(now + Duration::days(3)).await;
        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.statuses_deleted, 2);
        assert!(not_a_dir.exists());
        assert!(db::fetch_job_status(&pool, "failed-old").await.unwrap().is_none());
        assert!(db::fetch_job_status(&pool, "completed-old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweeps_uploads_older_than_max_age() {
        let pool = setup_pool().await;
        let td = tempdir().unwrap();
        let upload = td.path().join("abc_batch.csv");
        std::fs::write(&upload, "PatientId\n").unwrap();
        std::fs::create_dir(td.path().join("nested")).unwrap();

        let sweeper =
            CleanupSweeper::new(pool, td.path(), Duration::days(2), Duration::days(14));

        let report = sweeper.run_once(Utc::now()).await;
        assert_eq!(report.files_deleted, 0);
        assert!(upload.exists());

        let report = sweeper.run_once(Utc::now() + Duration::days(3)).await;
        assert_eq!(report.files_deleted, 1);
        assert!(!upload.exists());
        assert!(td.path().join("nested").exists());
    }
}
