//! Batch processor: drives one import attempt from source file to terminal
//! job status.
use crate::clinic::{AppointmentRequest, ClinicError, ClinicOps};
use crate::db::{self, Pool, QueueTask};
use crate::model::{ImportKind, JobStatus, Progress};
use crate::parser::{self, ParsedRecord};
use crate::queue::TaskHandler;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Outcome of draining one record stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub progress: Progress,
    /// Progress flushes written to the status row.
    pub flushes: usize,
}

pub struct ImportProcessor {
    pool: Pool,
    clinic: Arc<dyn ClinicOps>,
    batch_size: usize,
    abort: CancellationToken,
}

impl ImportProcessor {
    pub fn new(pool: Pool, clinic: Arc<dyn ClinicOps>, batch_size: usize) -> Self {
        Self {
            pool,
            clinic,
            batch_size: batch_size.max(1),
            abort: CancellationToken::new(),
        }
    }

    /// Token that interrupts in-flight parsing when cancelled.
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Run one attempt of `job_id` over the file at `path`.
    ///
    /// The file is removed once the attempt has started, whatever its outcome.
    /// A retry of a failed attempt therefore finds no file and fails too.
    #[instrument(skip(self, path), fields(kind = kind.as_str()))]
    pub async fn process_file(&self, kind: ImportKind, path: &Path, job_id: &str) -> Result<()> {
        let Some(mut status) = db::fetch_job_status(&self.pool, job_id).await? else {
            warn!(job_id, "job status row not found; skipping");
            return Ok(());
        };

        status.begin_processing();
        db::save_job_status(&self.pool, &status).await?;

        let outcome = async {
            let summary = self.run_file(kind, path, &mut status).await?;
            status.complete(summary.progress, Utc::now());
            db::save_job_status(&self.pool, &status).await?;
            Ok::<_, anyhow::Error>(summary)
        }
        .await;

        let result = match outcome {
            Ok(summary) => {
                info!(
                    job_id,
                    processed = summary.progress.processed,
                    success = summary.progress.success,
                    errors = summary.progress.errors,
                    "import completed"
                );
                Ok(())
            }
            Err(err) => {
                status.fail(&format!("Processing failed: {:#}", err), Utc::now());
                if let Err(save_err) = db::save_job_status(&self.pool, &status).await {
                    error!(?save_err, job_id, "failed to record job failure");
                }
                warn!(?err, job_id, "import failed");
                Err(err)
            }
        };

        remove_source_file(path).await;
        result
    }

    async fn run_file(
        &self,
        kind: ImportKind,
        path: &Path,
        status: &mut JobStatus,
    ) -> Result<ImportSummary> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let records = parser::parse_file(kind, file, self.abort.clone());
        let summary = self.import_records(status, records).await?;
        if self.abort.is_cancelled() {
            return Err(anyhow!("import interrupted before the end of the file"));
        }
        Ok(summary)
    }

    /// Drain `records` in batches, flushing counters to `status` after each.
    pub async fn import_records(
        &self,
        status: &mut JobStatus,
        mut records: BoxStream<'_, io::Result<ParsedRecord>>,
    ) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some(record) = records.next().await {
            batch.push(record.context("failed to read import file")?);
            if batch.len() >= self.batch_size {
                self.flush_batch(status, &mut batch, &mut summary).await?;
            }
        }
        if !batch.is_empty() {
            self.flush_batch(status, &mut batch, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn flush_batch(
        &self,
        status: &mut JobStatus,
        batch: &mut Vec<ParsedRecord>,
        summary: &mut ImportSummary,
    ) -> Result<()> {
        let mut progress = Progress::default();
        for record in batch.drain(..) {
            progress.processed += 1;
            match self.process_record(record).await {
                Ok(()) => progress.success += 1,
                Err(err) => {
                    progress.errors += 1;
                    debug!(job_id = %status.job_id, error = %err, "record failed");
                }
            }
        }
        summary.progress.add(progress);
        summary.flushes += 1;

        status.record_progress(summary.progress);
        db::save_job_status(&self.pool, status).await?;
        debug!(
            job_id = %status.job_id,
            processed = summary.progress.processed,
            "progress flushed"
        );
        Ok(())
    }

    /// One independent resolve-and-commit attempt. Side effects of a record
    /// that fails half way (e.g. a created patient) are kept.
    async fn process_record(&self, record: ParsedRecord) -> Result<(), ClinicError> {
        let request = match record {
            ParsedRecord::Appointment(row) => AppointmentRequest {
                patient_id: row.patient_id,
                doctor_id: row.doctor_id,
                date: row.date,
                time: row.time,
                reason: row.reason,
                // the fee column is parsed but not forwarded for this layout
                visit_fee: BigDecimal::zero(),
            },
            ParsedRecord::Unified(row) => {
                let patient_id = match row.patient_id {
                    Some(id) if id > 0 => id,
                    _ => self.clinic.create_patient(&row.patient, true).await?,
                };
                let doctor_id = match row.doctor_id {
                    Some(id) if id > 0 => id,
                    _ => self.clinic.create_doctor(&row.doctor, true).await?,
                };
                AppointmentRequest {
                    patient_id,
                    doctor_id,
                    date: row.date,
                    time: row.time,
                    reason: row.reason,
                    visit_fee: row.visit_fee.unwrap_or_else(BigDecimal::zero),
                }
            }
        };
        self.clinic.schedule_appointment_with_invoice(&request).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ImportProcessor {
    async fn handle(&self, task: &QueueTask) -> Result<()> {
        let kind = ImportKind::parse_kind(&task.kind)
            .ok_or_else(|| anyhow!("unknown task kind {}", task.kind))?;
        self.process_file(kind, Path::new(&task.file_path), &task.job_id)
            .await
    }
}

async fn remove_source_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "source file removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(?err, path = %path.display(), "failed to remove source file"),
    }
}
