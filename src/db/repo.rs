use super::model::{QueueTask, TaskState};
use crate::model::{ImportKind, JobState, JobStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus full sync so queued work survives a crash.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Job status rows
// ---------------------------------------------------------------------------

/// Insert the `Queued` status row and its queue task in one transaction, then
/// link the queue id back onto the row. Returns the queue id.
#[instrument(skip_all, fields(job_id = %status.job_id))]
pub async fn create_job(pool: &Pool, status: &JobStatus, kind: ImportKind) -> Result<i64> {
    let file_path = status
        .source_file_path
        .as_deref()
        .ok_or_else(|| anyhow!("job {} has no source file", status.job_id))?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO bulk_job_statuses (job_id, status, total_count, processed_count, success_count, error_count, source_file_path, created_at) \
         VALUES (?, ?, ?, 0, 0, 0, ?, ?)",
    )
    .bind(&status.job_id)
    .bind(status.state.as_str())
    .bind(status.total_count)
    .bind(file_path)
    .bind(status.created_at)
    .execute(&mut *tx)
    .await?;

    let queue_id = enqueue_task_tx(&mut tx, kind, &status.job_id, file_path, Utc::now()).await?;

    sqlx::query("UPDATE bulk_job_statuses SET queue_id = ? WHERE job_id = ?")
        .bind(queue_id.to_string())
        .bind(&status.job_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(queue_id)
}

#[instrument(skip_all)]
pub async fn fetch_job_status(pool: &Pool, job_id: &str) -> Result<Option<JobStatus>> {
    let row = sqlx::query(
        "SELECT job_id, queue_id, status, total_count, processed_count, success_count, error_count, \
                error_summary, source_file_path, created_at, completed_at \
         FROM bulk_job_statuses WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    row.map(|row| job_status_from_row(&row)).transpose()
}

fn job_status_from_row(row: &SqliteRow) -> Result<JobStatus> {
    let job_id: String = row.get("job_id");
    let state_str: String = row.get("status");
    let state = JobState::parse_state(&state_str)
        .ok_or_else(|| anyhow!("job {} has unknown status {}", job_id, state_str))?;
    Ok(JobStatus {
        queue_id: row.try_get("queue_id")?,
        state,
        total_count: row.try_get("total_count")?,
        processed_count: row.try_get("processed_count")?,
        success_count: row.try_get("success_count")?,
        error_count: row.try_get("error_count")?,
        error_summary: row.try_get("error_summary")?,
        source_file_path: row.try_get("source_file_path")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        job_id,
    })
}

/// Overwrite every mutable column of the row. Only the worker that owns the
/// job calls this, so no locking is needed.
#[instrument(skip_all, fields(job_id = %status.job_id, state = status.state.as_str()))]
pub async fn save_job_status(pool: &Pool, status: &JobStatus) -> Result<()> {
    let res = sqlx::query(
        "UPDATE bulk_job_statuses SET queue_id = ?, status = ?, total_count = ?, processed_count = ?, \
                success_count = ?, error_count = ?, error_summary = ?, source_file_path = ?, completed_at = ? \
         WHERE job_id = ?",
    )
    .bind(&status.queue_id)
    .bind(status.state.as_str())
    .bind(status.total_count)
    .bind(status.processed_count)
    .bind(status.success_count)
    .bind(status.error_count)
    .bind(&status.error_summary)
    .bind(&status.source_file_path)
    .bind(status.completed_at)
    .bind(&status.job_id)
    .execute(pool)
    .await
    .context("failed to persist job status")?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("job status {} no longer exists", status.job_id));
    }
    Ok(())
}

/// Delete Completed/Failed rows whose `completed_at` is before `cutoff`.
#[instrument(skip_all)]
pub async fn delete_terminal_statuses_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM bulk_job_statuses \
         WHERE status IN (?, ?) AND completed_at IS NOT NULL AND datetime(completed_at) < datetime(?)",
    )
    .bind(JobState::Completed.as_str())
    .bind(JobState::Failed.as_str())
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Durable queue
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_task(
    pool: &Pool,
    kind: ImportKind,
    job_id: &str,
    file_path: &str,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_task_tx(&mut tx, kind, job_id, file_path, due_at).await?;
    tx.commit().await?;
    Ok(id)
}

async fn enqueue_task_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: ImportKind,
    job_id: &str,
    file_path: &str,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO job_queue (kind, job_id, file_path, state, attempt, due_at, created_at) VALUES (?, ?, ?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(job_id)
    .bind(file_path)
    .bind(TaskState::Pending.as_str())
    .bind(due_at)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Atomically move the oldest due pending task to `running` and return it.
#[instrument(skip_all)]
pub async fn claim_next_task(pool: &Pool, now: DateTime<Utc>) -> Result<Option<QueueTask>> {
    let row = sqlx::query(
        "UPDATE job_queue SET state = ?, claimed_at = ? \
         WHERE id = ( \
             SELECT id FROM job_queue \
             WHERE state = ? AND datetime(due_at) <= datetime(?) \
             ORDER BY datetime(due_at) ASC, id ASC LIMIT 1 \
         ) \
         RETURNING id, kind, job_id, file_path, attempt",
    )
    .bind(TaskState::Running.as_str())
    .bind(now)
    .bind(TaskState::Pending.as_str())
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| QueueTask {
        id: row.get("id"),
        kind: row.get("kind"),
        job_id: row.get("job_id"),
        file_path: row.get("file_path"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_task(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM job_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Put a failed task back to `pending`, due again at `due_at`.
#[instrument(skip_all)]
pub async fn reschedule_task(
    pool: &Pool,
    id: i64,
    attempt: i32,
    due_at: DateTime<Utc>,
    last_error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE job_queue SET state = ?, attempt = ?, due_at = ?, claimed_at = NULL, last_error = ? WHERE id = ?",
    )
    .bind(TaskState::Pending.as_str())
    .bind(attempt)
    .bind(due_at)
    .bind(last_error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Park a task whose retries are exhausted.
#[instrument(skip_all)]
pub async fn bury_task(pool: &Pool, id: i64, attempt: i32, last_error: &str) -> Result<()> {
    sqlx::query("UPDATE job_queue SET state = ?, attempt = ?, last_error = ? WHERE id = ?")
        .bind(TaskState::Dead.as_str())
        .bind(attempt)
        .bind(last_error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Tasks left `running` by a crashed process go back to `pending`.
#[instrument(skip_all)]
pub async fn requeue_running_tasks(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("UPDATE job_queue SET state = ?, claimed_at = NULL WHERE state = ?")
        .bind(TaskState::Pending.as_str())
        .bind(TaskState::Running.as_str())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_tasks_in_state(pool: &Pool, state: TaskState) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_queue WHERE state = ?")
        .bind(state.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_job_links_queue_id() {
        let pool = setup_pool().await;
        let status = JobStatus::queued("job-1", "/tmp/a.csv");
        let queue_id = create_job(&pool, &status, ImportKind::Appointments)
            .await
            .unwrap();

        let stored = fetch_job_status(&pool, "job-1").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.queue_id, Some(queue_id.to_string()));
        assert_eq!(stored.source_file_path.as_deref(), Some("/tmp/a.csv"));

        let task = claim_next_task(&pool, Utc::now()).await.unwrap().unwrap();
        assert_eq!(task.id, queue_id);
        assert_eq!(task.kind, "import_appointments");
        assert_eq!(task.job_id, "job-1");
        assert_eq!(task.attempt, 0);

        // claimed tasks are not handed out twice
        assert!(claim_next_task(&pool, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_row_and_rejects_missing_job() {
        let pool = setup_pool().await;
        let mut status = JobStatus::queued("job-2", "/tmp/b.csv");
        create_job(&pool, &status, ImportKind::Unified).await.unwrap();
        status.queue_id = fetch_job_status(&pool, "job-2")
            .await
            .unwrap()
            .unwrap()
            .queue_id;

        status.begin_processing();
        status.processed_count = 5;
        status.success_count = 4;
        status.error_count = 1;
        save_job_status(&pool, &status).await.unwrap();
        let stored = fetch_job_status(&pool, "job-2").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Processing);
        assert_eq!(stored.processed_count, 5);
        assert_eq!(stored.error_count, 1);

        let ghost = JobStatus::queued("ghost", "/tmp/c.csv");
        assert!(save_job_status(&pool, &ghost).await.is_err());
    }

    #[tokio::test]
    async fn reschedule_respects_due_time_and_requeue_recovers_running() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let id = enqueue_task(&pool, ImportKind::Unified, "job-3", "/tmp/d.csv", now)
            .await
            .unwrap();
        let task = claim_next_task(&pool, now).await.unwrap().unwrap();
        reschedule_task(&pool, task.id, 1, now + Duration::seconds(60), "boom")
            .await
            .unwrap();

        assert!(claim_next_task(&pool, now).await.unwrap().is_none());
        let task = claim_next_task(&pool, now + Duration::seconds(61))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.attempt, 1);

        assert_eq!(count_tasks_in_state(&pool, TaskState::Running).await.unwrap(), 1);
        assert_eq!(requeue_running_tasks(&pool).await.unwrap(), 1);
        assert_eq!(count_tasks_in_state(&pool, TaskState::Pending).await.unwrap(), 1);
    }

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }
}
