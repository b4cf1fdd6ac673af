//! Per-tenant tuning knobs
//!
//! Every threshold the pipeline consults is tenant-configurable and stored
//! alongside the tenant row. `TenantSettings::default()` carries the product
//! defaults.

use serde::{Deserialize, Serialize};

/// Tenant-scoped thresholds and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Rows below this confidence are flagged for review
    pub review_threshold: f64,
    /// Minimum confidence for a description-pattern match to win
    pub match_threshold: f64,
    /// Minimum normalized score for an entity-signature match to win
    pub signature_threshold: f64,
    /// Required lead of the top signature candidate over the runner-up
    pub signature_margin: f64,
    /// Description match and signature match within this confidence of each
    /// other but naming different entities fall to the default classification
    pub disagreement_margin: f64,
    /// Cap on weighted signature token hits
    pub signature_cap: i64,
    /// Fraction of rejected rows that fails the whole job
    pub reject_ratio: f64,
    /// Corrections sharing a target before a pattern suggestion is built
    pub correction_min: i64,
    /// Manual classifications that count as high user conviction (Pass 2)
    pub conviction_min: i64,
    /// Maximum amount coefficient-of-variation for temporal recurrence
    pub amount_cv_max: f64,
    /// Per-call LLM timeout in seconds
    pub llm_timeout_secs: u64,
    /// Per-job LLM call budget; exhausted budget demotes rows to default
    pub llm_job_budget: u32,
    /// Rows per ingest chunk (dedupe batching and commit granularity)
    pub chunk_size: usize,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            review_threshold: 0.80,
            match_threshold: 0.80,
            signature_threshold: 0.60,
            signature_margin: 0.05,
            disagreement_margin: 0.05,
            signature_cap: 6,
            reject_ratio: 0.25,
            correction_min: 3,
            conviction_min: 15,
            amount_cv_max: 0.15,
            llm_timeout_secs: 30,
            llm_job_budget: 250,
            chunk_size: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = TenantSettings::default();
        assert_eq!(s.review_threshold, 0.80);
        assert_eq!(s.match_threshold, 0.80);
        assert_eq!(s.signature_threshold, 0.60);
        assert_eq!(s.signature_margin, 0.05);
        assert_eq!(s.disagreement_margin, 0.05);
        assert_eq!(s.reject_ratio, 0.25);
        assert_eq!(s.correction_min, 3);
        assert_eq!(s.conviction_min, 15);
        assert_eq!(s.amount_cv_max, 0.15);
        assert_eq!(s.llm_timeout_secs, 30);
        assert_eq!(s.chunk_size, 500);
    }

    #[test]
    fn test_roundtrip_json() {
        let s = TenantSettings::default();
        let json = serde_json::to_string(&s).unwrap();
        let back: TenantSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
