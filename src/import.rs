//! Job submission and status lookup.
use crate::db::{self, Pool};
use crate::model::{ImportKind, JobStatus, JobStatusSnapshot};
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

/// Ids handed back to the uploader.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedJob {
    pub job_id: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct ImportService {
    pool: Pool,
    default_kind: ImportKind,
}

impl ImportService {
    pub fn new(pool: Pool, default_kind: ImportKind) -> Self {
        Self { pool, default_kind }
    }

    /// Submit a fully written file for background processing with the
    /// configured layout.
    pub async fn enqueue_processing_for_file(&self, path: impl AsRef<Path>) -> Result<EnqueuedJob> {
        self.enqueue_with_kind(path, self.default_kind).await
    }

    #[instrument(skip(self, path), fields(kind = kind.as_str()))]
    pub async fn enqueue_with_kind(
        &self,
        path: impl AsRef<Path>,
        kind: ImportKind,
    ) -> Result<EnqueuedJob> {
        let path = path.as_ref().to_string_lossy().to_string();
        let job_id = Uuid::new_v4().simple().to_string();
        let status = JobStatus::queued(job_id.clone(), path.clone());
        let queue_id = db::create_job(&self.pool, &status, kind).await?;
        info!(%job_id, queue_id, %path, "import job queued");
        Ok(EnqueuedJob {
            job_id,
            correlation_id: queue_id.to_string(),
        })
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobStatusSnapshot>> {
        Ok(db::fetch_job_status(&self.pool, job_id)
            .await?
            .map(|status| status.snapshot()))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("only .csv files are supported")]
    NotCsv,
    #[error("file exceeds max size of {max_bytes} bytes")]
    TooLarge { max_bytes: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Copy `source` into `upload_dir` under a collision-free name, the way the
/// upload receiver stores request bodies before submitting them.
pub async fn stage_upload(
    upload_dir: &Path,
    source: &Path,
    max_bytes: u64,
) -> Result<PathBuf, UploadError> {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let is_csv = Path::new(&file_name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if !is_csv {
        return Err(UploadError::NotCsv);
    }
    let size = tokio::fs::metadata(source).await?.len();
    if size > max_bytes {
        return Err(UploadError::TooLarge { max_bytes });
    }

    tokio::fs::create_dir_all(upload_dir).await?;
    let target = upload_dir.join(format!("{}_{}", Uuid::new_v4().simple(), file_name));
    tokio::fs::copy(source, &target).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn stage_upload_rejects_non_csv_and_oversized() {
        let td = tempdir().unwrap();
        let txt = td.path().join("notes.txt");
        std::fs::write(&txt, "x").unwrap();
        assert!(matches!(
            stage_upload(&td.path().join("up"), &txt, 1024).await,
            Err(UploadError::NotCsv)
        ));

        let csv = td.path().join("big.CSV");
        std::fs::write(&csv, "0123456789").unwrap();
        assert!(matches!(
            stage_upload(&td.path().join("up"), &csv, 5).await,
            Err(UploadError::TooLarge { max_bytes: 5 })
        ));
    }

    #[tokio::test]
    async fn stage_upload_copies_into_upload_dir() {
        let td = tempdir().unwrap();
        let csv = td.path().join("batch.csv");
        std::fs::write(&csv, "PatientId\n").unwrap();
        let upload_dir = td.path().join("up");

        let staged = stage_upload(&upload_dir, &csv, 1024).await.unwrap();
        assert_eq!(staged.parent(), Some(upload_dir.as_path()));
        assert!(staged
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_batch.csv"));
        assert!(csv.exists());
        assert_eq!(std::fs::read_to_string(staged).unwrap(), "PatientId\n");
    }
}
