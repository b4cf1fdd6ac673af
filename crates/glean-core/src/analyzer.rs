//! Format analyzer: turns a raw file into a validated parse plan
//!
//! The analyzer reads a bounded sample of the file, asks the LLM for a plan,
//! validates the plan's shape, and dry-runs it against the sample. A plan
//! that cannot produce a valid date and amount for every sampled row is
//! rejected; one retry feeds the failures back into the prompt, and a second
//! failure surfaces `UnparseableFormat` with the accumulated errors.
//!
//! Nothing here inspects filenames or vendor identity. All parse knowledge
//! ends up in the plan.
//!
//! Validated plans are cached by (tenant, header-region hash) under a
//! single-flight guard, so two concurrent uploads of the same format cause
//! at most one analyze call.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::ingest::dry_run;
use crate::llm::LlmService;
use crate::plan::ParsePlan;

/// Bytes sampled from the head of the file
const SAMPLE_BYTES: usize = 64 * 1024;
/// Rows sampled from the head of the file
const SAMPLE_ROWS: usize = 40;
/// Rows that participate in the cache key's header region
const HEADER_REGION_ROWS: usize = 8;

pub struct FormatAnalyzer {
    db: Database,
    llm: LlmService,
    /// Per-cache-key guards so concurrent analyze calls collapse into one
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FormatAnalyzer {
    pub fn new(db: Database, llm: LlmService) -> Self {
        Self {
            db,
            llm,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Produce a validated plan for raw bytes, consulting the plan cache
    pub async fn analyze(&self, tenant_id: &str, bytes: &[u8]) -> Result<ParsePlan> {
        let header_hash = header_region_hash(bytes);

        if let Some(plan) = self.db.get_cached_plan(tenant_id, &header_hash)? {
            debug!(tenant = tenant_id, "plan cache hit");
            return Ok(plan);
        }

        // Single-flight: the first caller for this key computes, the rest wait
        let guard = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(format!("{}:{}", tenant_id, header_hash))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        // A concurrent caller may have filled the cache while we waited
        if let Some(plan) = self.db.get_cached_plan(tenant_id, &header_hash)? {
            debug!(tenant = tenant_id, "plan cache hit after single-flight wait");
            return Ok(plan);
        }

        let plan = self.request_and_validate(tenant_id, bytes).await?;
        self.db.cache_plan(tenant_id, &header_hash, &plan)?;
        info!(tenant = tenant_id, "parse plan produced and cached");
        Ok(plan)
    }

    /// One request, one retry with failure feedback, then give up
    async fn request_and_validate(&self, tenant_id: &str, bytes: &[u8]) -> Result<ParsePlan> {
        let sample = sample_of(bytes);
        let row_count = sample.lines().count();

        let mut errors: Vec<String> = Vec::new();
        let mut feedback: Option<String> = None;

        for attempt in 0..2 {
            let plan_result = self
                .llm
                .analyze_format(tenant_id, &sample, row_count, feedback.as_deref())
                .await;

            let failure = match plan_result {
                Ok(plan) => match self.check_plan(&plan, sample.as_bytes()) {
                    Ok(()) => return Ok(plan),
                    Err(reason) => reason,
                },
                Err(Error::LlmInvalidResponse(msg)) => msg,
                Err(Error::LlmUnavailable(msg)) => {
                    // The analyzer has no default path; an unreachable LLM
                    // fails the analysis outright
                    errors.push(msg);
                    break;
                }
                Err(e) => return Err(e),
            };

            warn!(tenant = tenant_id, attempt, "plan rejected: {}", failure);
            errors.push(format!("attempt {}: {}", attempt + 1, failure));
            feedback = Some(failure);
        }

        Err(Error::UnparseableFormat(errors.join("; ")))
    }

    /// Schema validation plus a dry-run parse of the sample
    fn check_plan(&self, plan: &ParsePlan, sample: &[u8]) -> std::result::Result<(), String> {
        if let Err(e) = plan.validate() {
            return Err(e.to_string());
        }
        match dry_run(sample, plan) {
            Ok(failures) if failures.is_empty() => Ok(()),
            Ok(failures) => {
                let shown: Vec<String> = failures
                    .iter()
                    .take(5)
                    .map(|f| format!("row {}: {}", f.row_index, f.reason))
                    .collect();
                Err(format!(
                    "dry run rejected {} sampled row(s): {}",
                    failures.len(),
                    shown.join("; ")
                ))
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

/// The bounded sample shown to the LLM
fn sample_of(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(SAMPLE_BYTES)];
    let text = String::from_utf8_lossy(head);
    text.lines()
        .take(SAMPLE_ROWS)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Hash of the file's header region, the plan cache key.
///
/// The region runs from the top of the file through the first line that
/// looks like a delimited header (capped at a few rows), so two exports of
/// the same format share a key even when their data rows differ.
pub fn header_region_hash(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(SAMPLE_BYTES)];
    let text = String::from_utf8_lossy(head);

    let mut region: Vec<&str> = Vec::new();
    for line in text.lines().take(HEADER_REGION_ROWS) {
        region.push(line);
        let delimiters = line.matches(',').count();
        let has_words = line.chars().any(|c| c.is_alphabetic());
        if delimiters >= 2 && has_words {
            break;
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(region.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}
