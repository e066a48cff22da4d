//! Rows of the `job_queue` table as the worker sees them.

/// Lifecycle of a row in `job_queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    /// Retries exhausted; kept for inspection.
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Dead => "dead",
        }
    }
}

/// Task claimed by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTask {
    pub id: i64,
    pub kind: String,
    pub job_id: String,
    pub file_path: String,
    /// Failed attempts before this one.
    pub attempt: i32,
}
