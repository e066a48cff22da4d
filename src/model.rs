use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest error summary persisted on a job row, in characters.
pub const ERROR_SUMMARY_MAX_CHARS: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Processing => "Processing",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "Queued" => Some(JobState::Queued),
            "Processing" => Some(JobState::Processing),
            "Completed" => Some(JobState::Completed),
            "Failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// CSV layout of an uploaded file; also the task type stored in the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    /// Positional `PatientId,DoctorId,AppointmentDate,AppointmentTime,Reason,VisitFee`.
    Appointments,
    /// Name-indexed patient + doctor + appointment columns.
    #[default]
    Unified,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::Appointments => "import_appointments",
            ImportKind::Unified => "import_unified",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "import_appointments" => Some(ImportKind::Appointments),
            "import_unified" => Some(ImportKind::Unified),
            _ => None,
        }
    }
}

/// Counters accumulated by the batch processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: i64,
    pub success: i64,
    pub errors: i64,
}

impl Progress {
    pub fn add(&mut self, other: Progress) {
        self.processed += other.processed;
        self.success += other.success;
        self.errors += other.errors;
    }
}

/// Full row of `bulk_job_statuses`. The worker that owns a job overwrites the
/// whole row on every save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: String,
    pub queue_id: Option<String>,
    pub state: JobState,
    pub total_count: i64,
    pub processed_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub error_summary: Option<String>,
    pub source_file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn queued(job_id: impl Into<String>, source_file_path: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            queue_id: None,
            state: JobState::Queued,
            total_count: 0,
            processed_count: 0,
            success_count: 0,
            error_count: 0,
            error_summary: None,
            source_file_path: Some(source_file_path.into()),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Enter `Processing`, dropping terminal leftovers of an earlier attempt.
    pub fn begin_processing(&mut self) {
        self.state = JobState::Processing;
        self.completed_at = None;
        self.error_summary = None;
    }

    pub fn record_progress(&mut self, progress: Progress) {
        self.processed_count = progress.processed;
        self.success_count = progress.success;
        self.error_count = progress.errors;
    }

    pub fn complete(&mut self, progress: Progress, now: DateTime<Utc>) {
        self.record_progress(progress);
        self.state = JobState::Completed;
        self.total_count = progress.processed;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, message: &str, now: DateTime<Utc>) {
        self.state = JobState::Failed;
        self.error_summary = Some(truncate_chars(message, ERROR_SUMMARY_MAX_CHARS));
        self.completed_at = Some(now);
    }

    pub fn snapshot(&self) -> JobStatusSnapshot {
        JobStatusSnapshot {
            job_id: self.job_id.clone(),
            status: self.state,
            total_count: self.total_count,
            processed_count: self.processed_count,
            success_count: self.success_count,
            error_count: self.error_count,
            error_summary: self.error_summary.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Public view of a job returned to polling clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusSnapshot {
    pub job_id: String,
    pub status: JobState,
    pub total_count: i64,
    pub processed_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_summary_is_truncated_on_char_boundary() {
        let mut status = JobStatus::queued("job", "/tmp/a.csv");
        let message = "é".repeat(ERROR_SUMMARY_MAX_CHARS + 10);
        status.fail(&message, Utc::now());
        let summary = status.error_summary.unwrap();
        assert_eq!(summary.chars().count(), ERROR_SUMMARY_MAX_CHARS);
        assert!(status.state.is_terminal());
        assert!(status.completed_at.is_some());
    }

    #[test]
    fn begin_processing_clears_previous_failure() {
        let mut status = JobStatus::queued("job", "/tmp/a.csv");
        status.fail("boom", Utc::now());
        status.begin_processing();
        assert_eq!(status.state, JobState::Processing);
        assert!(status.error_summary.is_none());
        assert!(status.completed_at.is_none());
    }

    #[test]
    fn snapshot_serializes_camel_case_without_empty_optionals() {
        let status = JobStatus::queued("abc", "/tmp/a.csv");
        let json = serde_json::to_value(status.snapshot()).unwrap();
        assert_eq!(json["jobId"], "abc");
        assert_eq!(json["status"], "Queued");
        assert_eq!(json["processedCount"], 0);
        assert!(json.get("errorSummary").is_none());
        assert!(json.get("completedAt").is_none());
    }

    #[test]
    fn kinds_round_trip_through_queue_names() {
        for kind in [ImportKind::Appointments, ImportKind::Unified] {
            assert_eq!(ImportKind::parse_kind(kind.as_str()), Some(kind));
        }
        assert_eq!(JobState::parse_state("Nope"), None);
    }
}
