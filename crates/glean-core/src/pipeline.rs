//! Pipeline coordinator: Analyzer -> Ingestion -> Classifier -> Store
//!
//! One coordinator instance serves all tenants; each ingest job runs as its
//! own tokio task. Rows are processed in file order inside chunks, chunk
//! commits are ordered, and progress is published over a watch channel as
//! chunks land. Cancellation is cooperative: a cancelled job finishes its
//! in-flight chunk, commits it, and terminates. A failed or cancelled job
//! leaves committed chunks in place with the raw file in
//! `partially_ingested`; the resume entry point skips the committed source
//! row range.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::analyzer::FormatAnalyzer;
use crate::blob::BlobStore;
use crate::classify::Classifier;
use crate::db::{Database, JobState, UpsertOutcome};
use crate::error::{Error, Result};
use crate::ingest::{read_rows, to_canonical};
use crate::llm::LlmService;
use crate::models::RawFileStatus;

/// Snapshot of an ingest job's progress
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobProgress {
    pub job_id: i64,
    pub state: JobState,
    /// Whether the parse plan has been produced
    pub analyzed: bool,
    pub rows_total: i64,
    pub rows_processed: i64,
    pub rows_accepted: i64,
    pub rows_duplicate: i64,
    pub rows_rejected: i64,
    pub error: Option<String>,
}

impl JobProgress {
    fn new(job_id: i64) -> Self {
        Self {
            job_id,
            state: JobState::Pending,
            analyzed: false,
            rows_total: 0,
            rows_processed: 0,
            rows_accepted: 0,
            rows_duplicate: 0,
            rows_rejected: 0,
            error: None,
        }
    }
}

/// Handle to a running ingest job
pub struct JobHandle {
    pub job_id: i64,
    progress: watch::Receiver<JobProgress>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl JobHandle {
    /// Latest progress snapshot
    pub fn progress(&self) -> JobProgress {
        self.progress.borrow().clone()
    }

    /// Request cooperative cancellation; honored at the next chunk boundary
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the job to finish and return the final progress
    pub async fn wait(self) -> JobProgress {
        let _ = self.task.await;
        self.progress.borrow().clone()
    }
}

/// Coordinates ingest jobs across tenants
pub struct PipelineCoordinator {
    db: Database,
    blob: Arc<dyn BlobStore>,
    llm: LlmService,
    analyzer: Arc<FormatAnalyzer>,
}

impl PipelineCoordinator {
    /// The analyzer cannot produce plans without an LLM, so the service is
    /// required here; only the classifier's fallback degrades gracefully.
    pub fn new(db: Database, blob: Arc<dyn BlobStore>, llm: LlmService) -> Self {
        let analyzer = Arc::new(FormatAnalyzer::new(db.clone(), llm.clone()));
        Self {
            db,
            blob,
            llm,
            analyzer,
        }
    }

    /// Start an ingest job for a raw file. Returns immediately; work runs on
    /// its own task.
    pub fn start_job(&self, tenant_id: &str, raw_file_id: i64) -> Result<JobHandle> {
        self.spawn_job(tenant_id, raw_file_id, -1)
    }

    /// Resume ingestion, skipping the source row range committed by the
    /// previous job for this file
    pub fn resume_job(&self, tenant_id: &str, raw_file_id: i64) -> Result<JobHandle> {
        let prior = self
            .db
            .latest_job_for_file(tenant_id, raw_file_id)?
            .ok_or_else(|| Error::NotFound(format!("no prior job for raw file {}", raw_file_id)))?;
        self.spawn_job(tenant_id, raw_file_id, prior.last_committed_row)
    }

    fn spawn_job(&self, tenant_id: &str, raw_file_id: i64, resume_after: i64) -> Result<JobHandle> {
        let raw_file = self
            .db
            .get_raw_file(tenant_id, raw_file_id)?
            .ok_or_else(|| Error::NotFound(format!("raw file {}", raw_file_id)))?;

        let job_id = self.db.create_ingest_job(tenant_id, raw_file_id)?;
        let (tx, rx) = watch::channel(JobProgress::new(job_id));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = JobWorker {
            db: self.db.clone(),
            blob: self.blob.clone(),
            llm: Some(self.llm.clone()),
            analyzer: self.analyzer.clone(),
            tenant_id: tenant_id.to_string(),
            job_id,
            raw_file_id,
            blob_ref: raw_file.blob_ref,
            resume_after,
            cancel: cancel.clone(),
            progress: tx,
        };

        let task = tokio::spawn(async move {
            worker.run().await;
        });

        Ok(JobHandle {
            job_id,
            progress: rx,
            cancel,
            task,
        })
    }
}

struct JobWorker {
    db: Database,
    blob: Arc<dyn BlobStore>,
    llm: Option<LlmService>,
    analyzer: Arc<FormatAnalyzer>,
    tenant_id: String,
    job_id: i64,
    raw_file_id: i64,
    blob_ref: String,
    /// Source rows at or below this index were committed by a prior job
    resume_after: i64,
    cancel: Arc<AtomicBool>,
    progress: watch::Sender<JobProgress>,
}

impl JobWorker {
    async fn run(&self) {
        match self.run_inner().await {
            Ok(()) => {}
            Err(e) => {
                error!(
                    tenant = %self.tenant_id,
                    job = self.job_id,
                    "ingest job failed: {}",
                    e
                );
                let committed = {
                    let p = self.progress.borrow();
                    p.rows_accepted + p.rows_duplicate > 0
                };
                let file_status = if committed {
                    RawFileStatus::PartiallyIngested
                } else {
                    RawFileStatus::Failed
                };
                let _ = self.db.update_raw_file_status(
                    &self.tenant_id,
                    self.raw_file_id,
                    file_status,
                    Some(&e.to_string()),
                );
                let _ = self.db.update_job_state(
                    &self.tenant_id,
                    self.job_id,
                    JobState::Failed,
                    Some(&e.to_string()),
                );
                self.publish(|p| {
                    p.state = JobState::Failed;
                    p.error = Some(e.to_string());
                });
            }
        }
    }

    async fn run_inner(&self) -> Result<()> {
        let settings = self.db.tenant_settings(&self.tenant_id)?;
        let bytes = self.blob.get(&self.blob_ref)?;

        // Phase 1: analyze
        self.db
            .update_job_state(&self.tenant_id, self.job_id, JobState::Analyzing, None)?;
        self.publish(|p| p.state = JobState::Analyzing);

        let plan = match self.analyzer.analyze(&self.tenant_id, &bytes).await {
            Ok(plan) => plan,
            Err(e @ Error::UnparseableFormat(_)) => {
                // Analyzer exhausted its retry; nothing was committed
                self.db.update_raw_file_status(
                    &self.tenant_id,
                    self.raw_file_id,
                    RawFileStatus::Failed,
                    Some(&e.to_string()),
                )?;
                self.db.update_job_state(
                    &self.tenant_id,
                    self.job_id,
                    JobState::Failed,
                    Some(&e.to_string()),
                )?;
                self.publish(|p| {
                    p.state = JobState::Failed;
                    p.error = Some(e.to_string());
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.db.update_raw_file_status(
            &self.tenant_id,
            self.raw_file_id,
            RawFileStatus::Analyzed,
            None,
        )?;
        self.publish(|p| p.analyzed = true);

        // Phase 2: read the whole file through the plan
        let read = read_rows(&bytes, &plan)?;
        let rows_total = (read.rows.len() + read.failures.len()) as i64;

        let mut rows_rejected = 0i64;
        for failure in &read.failures {
            if failure.row_index > self.resume_after {
                self.db.record_rejected_row(
                    &self.tenant_id,
                    self.job_id,
                    failure.row_index,
                    &failure.reason,
                )?;
                rows_rejected += 1;
            }
        }

        // Reject-ratio guard before any store writes
        if rows_total > 0 && (rows_rejected as f64 / rows_total as f64) > settings.reject_ratio {
            let message = format!(
                "{} of {} rows rejected, over the tenant threshold",
                rows_rejected, rows_total
            );
            warn!(tenant = %self.tenant_id, job = self.job_id, "{}", message);
            self.db.update_raw_file_status(
                &self.tenant_id,
                self.raw_file_id,
                RawFileStatus::Failed,
                Some(&message),
            )?;
            self.db.update_job_state(
                &self.tenant_id,
                self.job_id,
                JobState::Failed,
                Some(&message),
            )?;
            self.publish(|p| {
                p.state = JobState::Failed;
                p.rows_total = rows_total;
                p.rows_rejected = rows_rejected;
                p.error = Some(message);
            });
            return Ok(());
        }

        // Phase 3: classify and commit, chunk by chunk
        self.db
            .update_job_state(&self.tenant_id, self.job_id, JobState::Ingesting, None)?;
        self.publish(|p| {
            p.state = JobState::Ingesting;
            p.rows_total = rows_total;
            p.rows_rejected = rows_rejected;
        });

        let classifier = Classifier::for_job(self.db.clone(), self.llm.clone(), &self.tenant_id)?;
        let default_currency = self
            .db
            .default_base_currency(&self.tenant_id)?
            .or_else(|| {
                self.db
                    .get_tenant(&self.tenant_id)
                    .ok()
                    .flatten()
                    .map(|t| t.default_currency)
            })
            .unwrap_or_else(|| "USD".to_string());

        let pending: Vec<_> = read
            .rows
            .into_iter()
            .filter(|r| r.row_index > self.resume_after)
            .collect();

        let mut rows_processed = rows_rejected;
        let mut rows_accepted = 0i64;
        let mut rows_duplicate = 0i64;
        let mut cancelled = false;

        for chunk in pending.chunks(settings.chunk_size.max(1)) {
            let canonical: Vec<_> = chunk
                .iter()
                .map(|r| {
                    to_canonical(&self.tenant_id, self.raw_file_id, r.clone(), &default_currency)
                })
                .collect();

            // One batched dedupe lookup per chunk
            let hashes: Vec<String> = canonical.iter().map(|c| c.content_hash.clone()).collect();
            let existing = self
                .db
                .existing_content_hashes(&self.tenant_id, &hashes)
                .map_err(store_err)?;

            let mut last_row_index = self.resume_after;
            for row in canonical {
                rows_processed += 1;
                last_row_index = row.row_index_in_file;

                if existing.contains(&row.content_hash) {
                    // Known duplicate: no classifier work at all
                    rows_duplicate += 1;
                    continue;
                }

                let classified = classifier.classify(&row).await?;
                let outcome = self
                    .db
                    .upsert_row(
                        &self.tenant_id,
                        &row,
                        &classified.classification,
                        classified.needs_review,
                        classified.origin_display.as_deref(),
                        classified.destination_display.as_deref(),
                    )
                    .map_err(store_err)?;
                match outcome {
                    UpsertOutcome::Inserted(_) => rows_accepted += 1,
                    // Raced with a concurrent ingest of the same bytes
                    UpsertOutcome::Duplicate(_) => rows_duplicate += 1,
                }
            }

            // Commit the chunk's counters; commits are ordered by source row
            self.db.commit_job_progress(
                &self.tenant_id,
                self.job_id,
                rows_total,
                rows_processed,
                rows_accepted,
                rows_duplicate,
                rows_rejected,
                last_row_index,
            )?;
            self.publish(|p| {
                p.rows_processed = rows_processed;
                p.rows_accepted = rows_accepted;
                p.rows_duplicate = rows_duplicate;
            });

            // Cancellation is honored after the in-flight chunk commits
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            info!(tenant = %self.tenant_id, job = self.job_id, "ingest job cancelled");
            self.db.update_raw_file_status(
                &self.tenant_id,
                self.raw_file_id,
                RawFileStatus::PartiallyIngested,
                None,
            )?;
            self.db
                .update_job_state(&self.tenant_id, self.job_id, JobState::Cancelled, None)?;
            self.publish(|p| p.state = JobState::Cancelled);
            return Ok(());
        }

        self.db.update_raw_file_status(
            &self.tenant_id,
            self.raw_file_id,
            RawFileStatus::Ingested,
            None,
        )?;
        self.db
            .update_job_state(&self.tenant_id, self.job_id, JobState::Completed, None)?;
        self.publish(|p| p.state = JobState::Completed);
        info!(
            tenant = %self.tenant_id,
            job = self.job_id,
            accepted = rows_accepted,
            duplicate = rows_duplicate,
            rejected = rows_rejected,
            "ingest job completed"
        );
        Ok(())
    }

    fn publish(&self, update: impl FnOnce(&mut JobProgress)) {
        self.progress.send_modify(update);
    }
}

/// Transaction Store outages are fatal for the in-flight job
fn store_err(e: Error) -> Error {
    match e {
        Error::Database(inner) => Error::TransactionStoreUnavailable(inner.to_string()),
        Error::Pool(inner) => Error::TransactionStoreUnavailable(inner.to_string()),
        other => other,
    }
}
