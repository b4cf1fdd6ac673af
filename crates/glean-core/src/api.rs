//! Core API facade
//!
//! The surface consumed by collaborators (the HTTP layer, the CLI): ingest,
//! query, edit, and pattern operations. Every operation takes a tenant id
//! and resolves it first; a call arriving without one fails with
//! `MissingTenant` before touching any store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::blob::BlobStore;
use crate::db::{Database, JobState, TransactionFilter, TransactionPage};
use crate::error::{Error, Result};
use crate::llm::{LlmClient, LlmService};
use crate::models::{
    Classification, ClassificationSource, Pattern, PatternKind, RawFile, RejectedRow, Transaction,
};
use crate::pipeline::{JobHandle, JobProgress, PipelineCoordinator};
use crate::reinforce::{ReinforcementEngine, ReinforcementOutcome};
use crate::tenant::resolve_tenant;

/// User-editable classification fields; `Some` means "set to this value"
#[derive(Debug, Clone, Default)]
pub struct ClassificationPatch {
    pub entity_code: Option<String>,
    pub business_line_code: Option<String>,
    pub accounting_category: Option<String>,
    pub subcategory: Option<String>,
    pub justification: Option<String>,
    pub reason: Option<String>,
}

impl ClassificationPatch {
    pub fn is_empty(&self) -> bool {
        self.entity_code.is_none()
            && self.business_line_code.is_none()
            && self.accounting_category.is_none()
            && self.subcategory.is_none()
            && self.justification.is_none()
    }
}

/// The assembled core: stores, pipeline, reinforcement, and the job registry
pub struct GleanCore {
    db: Database,
    coordinator: PipelineCoordinator,
    reinforcement: ReinforcementEngine,
    blob: Arc<dyn BlobStore>,
    jobs: Mutex<HashMap<i64, JobHandle>>,
}

impl GleanCore {
    pub fn new(db: Database, blob: Arc<dyn BlobStore>, llm_client: LlmClient) -> Self {
        let llm = LlmService::new(llm_client);
        let coordinator = PipelineCoordinator::new(db.clone(), blob.clone(), llm.clone());
        let reinforcement = ReinforcementEngine::new(db.clone(), Some(llm));
        Self {
            db,
            coordinator,
            reinforcement,
            blob,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Direct store access for administrative operations (tenant onboarding,
    /// chart and account setup). Every store method is tenant-scoped itself.
    pub fn db(&self) -> &Database {
        &self.db
    }

    // ============================================
    // Ingest API
    // ============================================

    /// Store raw bytes and register the upload. Idempotent for identical
    /// bytes: the same file registers once per tenant.
    pub fn submit_raw_file(&self, tenant_id: &str, filename: &str, bytes: &[u8]) -> Result<RawFile> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;

        let blob_ref = self.blob.put(bytes)?;
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let content_hash = hex::encode(hasher.finalize());

        let file = self.db.register_raw_file(
            &tenant.id,
            filename,
            &blob_ref,
            &content_hash,
            bytes.len() as i64,
        )?;
        info!(tenant = %tenant.id, raw_file = file.id, filename, "raw file submitted");
        Ok(file)
    }

    /// Start an ingest job; returns the job id immediately
    pub fn start_ingest(&self, tenant_id: &str, raw_file_id: i64) -> Result<i64> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        let handle = self.coordinator.start_job(&tenant.id, raw_file_id)?;
        let job_id = handle.job_id;
        self.jobs.lock().unwrap().insert(job_id, handle);
        Ok(job_id)
    }

    /// Resume a partially ingested file, skipping committed rows
    pub fn resume_ingest(&self, tenant_id: &str, raw_file_id: i64) -> Result<i64> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        let handle = self.coordinator.resume_job(&tenant.id, raw_file_id)?;
        let job_id = handle.job_id;
        self.jobs.lock().unwrap().insert(job_id, handle);
        Ok(job_id)
    }

    /// Current progress of a job, live when running, from the store otherwise
    pub fn job_status(&self, tenant_id: &str, job_id: i64) -> Result<JobProgress> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;

        if let Some(handle) = self.jobs.lock().unwrap().get(&job_id) {
            return Ok(handle.progress());
        }

        let record = self
            .db
            .get_ingest_job(&tenant.id, job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;
        Ok(JobProgress {
            job_id: record.id,
            state: record.state,
            analyzed: record.state != JobState::Pending && record.state != JobState::Analyzing,
            rows_total: record.rows_total,
            rows_processed: record.rows_processed,
            rows_accepted: record.rows_accepted,
            rows_duplicate: record.rows_duplicate,
            rows_rejected: record.rows_rejected,
            error: record.error,
        })
    }

    /// Request cooperative cancellation of a running job
    pub fn cancel_job(&self, tenant_id: &str, job_id: i64) -> Result<()> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;

        if let Some(handle) = self.jobs.lock().unwrap().get(&job_id) {
            handle.cancel();
            return Ok(());
        }
        // Not live: fine if it exists and already finished
        self.db
            .get_ingest_job(&tenant.id, job_id)?
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    /// Wait for a job to reach a terminal state and return its final progress
    pub async fn wait_for_job(&self, tenant_id: &str, job_id: i64) -> Result<JobProgress> {
        resolve_tenant(&self.db, tenant_id)?;
        let handle = self.jobs.lock().unwrap().remove(&job_id);
        match handle {
            Some(h) => Ok(h.wait().await),
            None => self.job_status(tenant_id, job_id),
        }
    }

    /// Per-row rejection diagnostics for a job
    pub fn rejected_rows(&self, tenant_id: &str, job_id: i64) -> Result<Vec<RejectedRow>> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        self.db.list_rejected_rows(&tenant.id, job_id)
    }

    // ============================================
    // Query API
    // ============================================

    pub fn list_transactions(
        &self,
        tenant_id: &str,
        filter: &TransactionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<TransactionPage> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        self.db.list_transactions(&tenant.id, filter, limit, offset)
    }

    pub fn get_transaction(&self, tenant_id: &str, transaction_id: i64) -> Result<Transaction> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        self.db
            .get_transaction(&tenant.id, transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))
    }

    // ============================================
    // Edit API
    // ============================================

    /// Apply a user's classification edit.
    ///
    /// Writes one Correction per changed field, rewrites the transaction
    /// with source `user` (protected thereafter), and hands the edit to the
    /// reinforcement engine, which may mutate the tenant's Pattern Store.
    pub async fn update_classification(
        &self,
        tenant_id: &str,
        transaction_id: i64,
        patch: ClassificationPatch,
        user_id: &str,
    ) -> Result<ReinforcementOutcome> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        if patch.is_empty() {
            return Err(Error::InvalidData("empty classification patch".to_string()));
        }

        let current = self
            .db
            .get_transaction(&tenant.id, transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))?;

        // One correction row per changed field; never deleted
        let changes: [(&str, Option<&str>, Option<&String>); 5] = [
            ("entity_code", current.entity_code.as_deref(), patch.entity_code.as_ref()),
            (
                "business_line_code",
                current.business_line_code.as_deref(),
                patch.business_line_code.as_ref(),
            ),
            (
                "accounting_category",
                current.accounting_category.as_deref(),
                patch.accounting_category.as_ref(),
            ),
            ("subcategory", current.subcategory.as_deref(), patch.subcategory.as_ref()),
            ("justification", current.justification.as_deref(), patch.justification.as_ref()),
        ];
        let mut corrections_written = 0usize;
        for (field, old, new) in changes {
            if let Some(new_value) = new {
                if old != Some(new_value.as_str()) {
                    self.db.record_correction(
                        &tenant.id,
                        transaction_id,
                        field,
                        old,
                        Some(new_value),
                        user_id,
                        patch.reason.as_deref(),
                    )?;
                    corrections_written += 1;
                }
            }
        }

        let classification = Classification {
            entity_code: patch.entity_code.clone().or(current.entity_code.clone()),
            business_line_code: patch
                .business_line_code
                .clone()
                .or(current.business_line_code.clone()),
            accounting_category: patch
                .accounting_category
                .clone()
                .or(current.accounting_category.clone())
                .unwrap_or_else(|| "Uncategorized".to_string()),
            subcategory: patch
                .subcategory
                .clone()
                .or(current.subcategory.clone())
                .unwrap_or_default(),
            justification: patch
                .justification
                .clone()
                .or(current.justification.clone())
                .unwrap_or_default(),
            confidence: 1.0,
            source: ClassificationSource::User,
        };
        self.db
            .update_classification(&tenant.id, transaction_id, &classification, false)?;

        let updated = self
            .db
            .get_transaction(&tenant.id, transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))?;

        // The learning loop runs whenever the edit actually changed a
        // classification field and the row resolves to an entity target.
        // An edit to any of the five fields counts; the entity may have
        // been set by an earlier correction or by the classifier itself.
        match &classification.entity_code {
            Some(entity) if corrections_written > 0 => {
                self.reinforcement
                    .process(
                        &tenant.id,
                        &updated,
                        entity,
                        patch
                            .accounting_category
                            .as_deref()
                            .or(updated.accounting_category.as_deref()),
                    )
                    .await
            }
            _ => Ok(ReinforcementOutcome {
                suggestion: None,
                pattern_id: None,
            }),
        }
    }

    // ============================================
    // Pattern API
    // ============================================

    pub fn list_patterns(
        &self,
        tenant_id: &str,
        kind: Option<PatternKind>,
        entity_code: Option<&str>,
    ) -> Result<Vec<Pattern>> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        self.db.list_patterns(&tenant.id, kind, entity_code, false)
    }

    /// Soft-deactivate a pattern; history is retained
    pub fn deactivate_pattern(&self, tenant_id: &str, pattern_id: i64, user_id: &str) -> Result<()> {
        let tenant = resolve_tenant(&self.db, tenant_id)?;
        self.db.deactivate_pattern(&tenant.id, pattern_id)?;
        info!(tenant = %tenant.id, pattern = pattern_id, user = user_id, "pattern deactivated");
        Ok(())
    }
}
