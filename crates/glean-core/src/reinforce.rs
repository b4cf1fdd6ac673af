//! Reinforcement engine: user corrections mutate the Pattern Store
//!
//! A correction immediately rewrites one transaction; this engine decides
//! whether it also generalizes. Once enough corrections share a target, a
//! candidate pattern is extracted (deterministically where possible, via the
//! LLM otherwise) and must clear two-pass validation before it goes live:
//!
//! - Pass 1 is a syntactic/safety check against matching and non-matching
//!   samples.
//! - Pass 2 runs only after a Pass-1 rejection, and only when temporal
//!   recurrence or user conviction justifies a second look, with the
//!   evidence in the prompt.
//!
//! Every suggestion reaches a terminal state in at most two validation
//! calls. Rejected suggestions are retained and never retried automatically.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use crate::db::{Database, TransactionFilter};
use crate::error::Result;
use crate::llm::{LlmService, ValidationEnrichment, ValidationRequest};
use crate::models::{
    EntitySignature, FrequencyClass, NewPattern, PatternKind, PatternSource, SuggestionStats,
    SuggestionStatus, Transaction,
};
use crate::settings::TenantSettings;
use crate::text::{common_token_sequence, tokenize};

/// Confidence of a pattern approved on the first pass
const PASS1_CONFIDENCE: f64 = 0.90;
/// Ceiling for a pattern approved on the second pass
const PASS2_CONFIDENCE_CAP: f64 = 0.85;
/// Corrected transactions considered when extracting a pattern
const EXTRACTION_WINDOW: i64 = 50;
/// Samples shown to the validator per side
const SAMPLE_LIMIT: usize = 5;

/// Outcome of running the engine after a correction
#[derive(Debug, Clone)]
pub struct ReinforcementOutcome {
    /// Suggestion id and terminal status, when a suggestion was built
    pub suggestion: Option<(i64, SuggestionStatus)>,
    /// Pattern id, when the suggestion was approved and promoted
    pub pattern_id: Option<i64>,
}

pub struct ReinforcementEngine {
    db: Database,
    llm: Option<LlmService>,
}

impl ReinforcementEngine {
    pub fn new(db: Database, llm: Option<LlmService>) -> Self {
        Self { db, llm }
    }

    /// Run the learning loop after a user reclassified `transaction` to
    /// `entity_code` (and optionally a category).
    ///
    /// The correction row and the transaction rewrite have already happened;
    /// this decides whether the tenant's rule base changes too.
    pub async fn process(
        &self,
        tenant_id: &str,
        transaction: &Transaction,
        entity_code: &str,
        category: Option<&str>,
    ) -> Result<ReinforcementOutcome> {
        let settings = self.db.tenant_settings(tenant_id)?;

        let correction_count =
            self.db
                .count_corrections_to(tenant_id, "entity_code", entity_code)?;
        if correction_count < settings.correction_min {
            return Ok(ReinforcementOutcome {
                suggestion: None,
                pattern_id: None,
            });
        }

        // Descriptions behind the corrections that share this target
        let corrected = self.corrected_descriptions(tenant_id, entity_code)?;
        if corrected.len() < settings.correction_min as usize {
            return Ok(ReinforcementOutcome {
                suggestion: None,
                pattern_id: None,
            });
        }

        // Keep only history similar to the transaction that triggered us, so
        // one entity with two unrelated payment shapes doesn't collapse into
        // a nonsense pattern
        let similar: Vec<&String> = corrected
            .iter()
            .filter(|d| crate::text::token_similarity(d, &transaction.description) > 0.2)
            .collect();
        let basis: Vec<&str> = if similar.len() >= settings.correction_min as usize {
            similar.iter().map(|d| d.as_str()).collect()
        } else {
            corrected.iter().map(|d| d.as_str()).collect()
        };

        // Simple case: a shared ordered token sequence
        let common = common_token_sequence(&basis);
        let (kind, body, signature) = if !common.is_empty() {
            (PatternKind::TokenBag, common.join(" "), None)
        } else {
            // Complex case: LLM-extracted entity signature
            match self.extract_signature(tenant_id, entity_code, &basis).await {
                Some(sig) => {
                    let body = format!("sig:{}", sig.keywords.join("+").to_lowercase());
                    (PatternKind::EntitySignature, body, Some(sig))
                }
                None => {
                    return Ok(ReinforcementOutcome {
                        suggestion: None,
                        pattern_id: None,
                    })
                }
            }
        };

        // Rejected suggestions do not retry; live ones are not duplicated
        if let Some(existing) = self.db.find_suggestion_by_body(tenant_id, kind, &body)? {
            return Ok(ReinforcementOutcome {
                suggestion: Some((existing.id, existing.status)),
                pattern_id: None,
            });
        }

        let suggestion_id = self.db.create_suggestion(
            tenant_id,
            kind,
            &body,
            signature.as_ref(),
            entity_code,
            category,
            None,
            correction_count,
        )?;

        let stats = self.gather_stats(tenant_id, &body, correction_count)?;
        self.db.update_suggestion_stats(
            tenant_id,
            suggestion_id,
            stats.occurrence_count,
            stats.first_seen,
            stats.last_seen,
            stats.frequency_class,
            stats.amount_cv,
            stats.correction_count,
        )?;

        let (status, confidence) = self
            .validate(
                tenant_id,
                suggestion_id,
                kind,
                &body,
                signature.as_ref(),
                entity_code,
                &basis,
                &stats,
                &settings,
            )
            .await?;

        let pattern_id = if status == SuggestionStatus::Approved {
            let source = match kind {
                PatternKind::EntitySignature => PatternSource::LlmExtraction,
                _ => PatternSource::UserCorrection,
            };
            let id = self.db.upsert_pattern(
                tenant_id,
                &NewPattern {
                    kind,
                    body: body.clone(),
                    signature,
                    entity_code: Some(entity_code.to_string()),
                    business_line_code: None,
                    category: category.map(|c| c.to_string()),
                    subcategory: None,
                    confidence,
                    source,
                },
            )?;
            info!(
                tenant = tenant_id,
                pattern = id,
                kind = kind.as_str(),
                "promoted learned pattern"
            );
            Some(id)
        } else {
            None
        };

        Ok(ReinforcementOutcome {
            suggestion: Some((suggestion_id, status)),
            pattern_id,
        })
    }

    /// Two-pass validation; always terminal, at most two LLM calls.
    ///
    /// Returns the terminal status plus the promotion confidence (only
    /// meaningful for approvals: full for Pass 1, capped for Pass 2).
    #[allow(clippy::too_many_arguments)]
    async fn validate(
        &self,
        tenant_id: &str,
        suggestion_id: i64,
        kind: PatternKind,
        body: &str,
        signature: Option<&EntitySignature>,
        entity_code: &str,
        matching: &[&str],
        stats: &SuggestionStats,
        settings: &TenantSettings,
    ) -> Result<(SuggestionStatus, f64)> {
        let llm = match &self.llm {
            Some(l) => l,
            None => {
                // No validator: terminal rejection, evidence retained
                self.db.update_suggestion_status(
                    tenant_id,
                    suggestion_id,
                    SuggestionStatus::Rejected,
                    Some("no validation backend configured"),
                )?;
                return Ok((SuggestionStatus::Rejected, 0.0));
            }
        };

        let body_for_prompt = match signature {
            Some(sig) => serde_json::to_string(sig)?,
            None => body.to_string(),
        };
        let request = ValidationRequest {
            entity_code: entity_code.to_string(),
            kind: kind.as_str().to_string(),
            body: body_for_prompt,
            matching_samples: matching
                .iter()
                .take(SAMPLE_LIMIT)
                .map(|s| s.to_string())
                .collect(),
            non_matching_samples: self.non_matching_samples(tenant_id, entity_code)?,
            enrichment: None,
        };

        // Pass 1
        let pass1 = match llm.validate_suggestion(tenant_id, &request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(tenant = tenant_id, suggestion = suggestion_id, "pass 1 validation failed: {}", e);
                self.db.update_suggestion_status(
                    tenant_id,
                    suggestion_id,
                    SuggestionStatus::Rejected,
                    Some(&format!("validation call failed: {}", e)),
                )?;
                return Ok((SuggestionStatus::Rejected, 0.0));
            }
        };

        if pass1.approved {
            self.db.update_suggestion_status(
                tenant_id,
                suggestion_id,
                SuggestionStatus::Approved,
                None,
            )?;
            return Ok((SuggestionStatus::Approved, PASS1_CONFIDENCE));
        }

        self.db.update_suggestion_status(
            tenant_id,
            suggestion_id,
            SuggestionStatus::ValidatedPassOne,
            Some(&pass1.reason),
        )?;

        // Pass 2 runs only with recurrence or conviction behind it
        let recurring = stats.frequency_class.is_recurring()
            && stats
                .amount_cv
                .map(|cv| cv < settings.amount_cv_max)
                .unwrap_or(false);
        let convinced = stats.correction_count >= settings.conviction_min;
        if !recurring && !convinced {
            self.db.update_suggestion_status(
                tenant_id,
                suggestion_id,
                SuggestionStatus::Rejected,
                Some(&pass1.reason),
            )?;
            return Ok((SuggestionStatus::Rejected, 0.0));
        }

        let enriched = ValidationRequest {
            enrichment: Some(ValidationEnrichment {
                rejection_reason: pass1.reason.clone(),
                occurrence_count: stats.occurrence_count,
                first_seen: stats
                    .first_seen
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                last_seen: stats
                    .last_seen
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                frequency_class: stats.frequency_class.as_str().to_string(),
                amount_cv: stats.amount_cv,
                correction_count: stats.correction_count,
            }),
            ..request
        };

        self.db.update_suggestion_status(
            tenant_id,
            suggestion_id,
            SuggestionStatus::ValidatedPassTwo,
            Some(&pass1.reason),
        )?;

        let pass2 = match llm.validate_suggestion(tenant_id, &enriched).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(tenant = tenant_id, suggestion = suggestion_id, "pass 2 validation failed: {}", e);
                self.db.update_suggestion_status(
                    tenant_id,
                    suggestion_id,
                    SuggestionStatus::Rejected,
                    Some(&format!("pass 2 validation call failed: {}", e)),
                )?;
                return Ok((SuggestionStatus::Rejected, 0.0));
            }
        };

        if pass2.approved {
            // The pass-1 objection stays on the row for the audit trail
            self.db.update_suggestion_status(
                tenant_id,
                suggestion_id,
                SuggestionStatus::Approved,
                Some(&pass1.reason),
            )?;
            Ok((SuggestionStatus::Approved, PASS2_CONFIDENCE_CAP))
        } else {
            self.db.update_suggestion_status(
                tenant_id,
                suggestion_id,
                SuggestionStatus::Rejected,
                Some(&pass2.reason),
            )?;
            Ok((SuggestionStatus::Rejected, 0.0))
        }
    }

    /// Descriptions of transactions behind corrections targeting an entity
    fn corrected_descriptions(&self, tenant_id: &str, entity_code: &str) -> Result<Vec<String>> {
        let corrections =
            self.db
                .corrections_to(tenant_id, "entity_code", entity_code, EXTRACTION_WINDOW)?;
        let mut out = Vec::new();
        for c in corrections {
            if let Some(tx) = self.db.get_transaction(tenant_id, c.transaction_id)? {
                if !out.contains(&tx.description) {
                    out.push(tx.description);
                }
            }
        }
        Ok(out)
    }

    /// Recent descriptions the candidate must not hit
    fn non_matching_samples(&self, tenant_id: &str, entity_code: &str) -> Result<Vec<String>> {
        let page = self.db.list_transactions(
            tenant_id,
            &TransactionFilter::default(),
            50,
            0,
        )?;
        Ok(page
            .transactions
            .into_iter()
            .filter(|t| t.entity_code.as_deref() != Some(entity_code))
            .map(|t| t.description)
            .take(SAMPLE_LIMIT)
            .collect())
    }

    async fn extract_signature(
        &self,
        tenant_id: &str,
        entity_code: &str,
        descriptions: &[&str],
    ) -> Option<EntitySignature> {
        let llm = self.llm.as_ref()?;
        let owned: Vec<String> = descriptions.iter().map(|d| d.to_string()).collect();
        match llm.extract_signature(tenant_id, entity_code, &owned).await {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(tenant = tenant_id, "signature extraction failed: {}", e);
                None
            }
        }
    }

    /// Occurrence statistics over the history the candidate matches
    fn gather_stats(
        &self,
        tenant_id: &str,
        body: &str,
        correction_count: i64,
    ) -> Result<SuggestionStats> {
        let body_tokens = tokenize(body);
        let candidates = self.db.find_similar(tenant_id, body, 200)?;

        let mut dates: Vec<NaiveDate> = Vec::new();
        let mut amounts: Vec<f64> = Vec::new();
        for (tx, _) in candidates {
            let tx_tokens: std::collections::HashSet<String> =
                tokenize(&tx.description).into_iter().collect();
            if body_tokens.iter().all(|t| tx_tokens.contains(t)) {
                dates.push(tx.posted_date);
                if let Some(a) = tx.amount.abs().to_f64() {
                    amounts.push(a);
                }
            }
        }
        dates.sort();
        dates.dedup();

        let frequency_class = frequency_of(&dates);
        let amount_cv = coefficient_of_variation(&amounts);

        Ok(SuggestionStats {
            occurrence_count: amounts.len() as i64,
            first_seen: dates.first().copied(),
            last_seen: dates.last().copied(),
            frequency_class,
            amount_cv,
            correction_count,
        })
    }
}

/// Classify recurrence from the median gap between consecutive dates
fn frequency_of(dates: &[NaiveDate]) -> FrequencyClass {
    if dates.len() < 3 {
        return FrequencyClass::Irregular;
    }
    let mut gaps: Vec<i64> = dates
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days())
        .collect();
    gaps.sort();
    let median = gaps[gaps.len() / 2];
    match median {
        0..=2 => FrequencyClass::Daily,
        3..=10 => FrequencyClass::Weekly,
        11..=45 => FrequencyClass::Monthly,
        _ => FrequencyClass::Irregular,
    }
}

/// Standard deviation over mean of the matched amounts
fn coefficient_of_variation(amounts: &[f64]) -> Option<f64> {
    if amounts.len() < 2 {
        return None;
    }
    let n = amounts.len() as f64;
    let mean = amounts.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return None;
    }
    let variance = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() / mean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_of_monthly() {
        let dates: Vec<NaiveDate> = [
            (2024, 1, 15),
            (2024, 2, 15),
            (2024, 3, 14),
            (2024, 4, 16),
        ]
        .iter()
        .map(|(y, m, d)| NaiveDate::from_ymd_opt(*y, *m, *d).unwrap())
        .collect();
        assert_eq!(frequency_of(&dates), FrequencyClass::Monthly);
    }

    #[test]
    fn test_frequency_of_sparse_is_irregular() {
        let dates: Vec<NaiveDate> = [(2024, 1, 1), (2024, 6, 1), (2024, 6, 2)]
            .iter()
            .map(|(y, m, d)| NaiveDate::from_ymd_opt(*y, *m, *d).unwrap())
            .collect();
        // Median gap dominated by the five-month hole
        assert_eq!(frequency_of(&dates), FrequencyClass::Irregular);
    }

    #[test]
    fn test_frequency_needs_three_points() {
        let dates: Vec<NaiveDate> = [(2024, 1, 1), (2024, 1, 2)]
            .iter()
            .map(|(y, m, d)| NaiveDate::from_ymd_opt(*y, *m, *d).unwrap())
            .collect();
        assert_eq!(frequency_of(&dates), FrequencyClass::Irregular);
    }

    #[test]
    fn test_coefficient_of_variation() {
        let steady = [100.0, 101.0, 99.5, 100.5];
        assert!(coefficient_of_variation(&steady).unwrap() < 0.15);

        let wild = [10.0, 500.0, 3.0, 120.0];
        assert!(coefficient_of_variation(&wild).unwrap() > 0.15);

        assert_eq!(coefficient_of_variation(&[5.0]), None);
    }
}
