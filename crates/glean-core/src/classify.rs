//! Layered transaction classifier
//!
//! Strategy, in strict order, stopping at the first confident match:
//!
//! 1. Account/wallet map (accounts table, then learned account-map patterns)
//! 2. Description pattern match from the Pattern Store
//! 3. Entity-signature scoring
//! 4. LLM fallback, validated against the tenant's enumerations
//! 5. Default (Uncategorized, needs review)
//!
//! The classifier is deterministic given tenant state and side-effect-free
//! on the Pattern Store except for `record_occurrence` on matched rules.
//! A per-job memo keyed on (normalized description, amount sign, currency,
//! account identifier) keeps identical rows from being re-classified within
//! one job; the memo dies with the job.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::llm::{ClassifyRequest, LlmService};
use crate::models::{Account, CanonicalRow, Classification, ClassificationSource};
use crate::settings::TenantSettings;
use crate::text::{normalize_identifier, normalize_whitespace};

/// Account role whose wallet receipts classify as revenue
const MINING_ROLE: &str = "mining";
/// Ceiling on LLM-reported confidence
const LLM_CONFIDENCE_CAP: f64 = 0.90;
/// Confidence of an account-map hit
const ACCOUNT_MAP_CONFIDENCE: f64 = 0.99;

/// A classified row ready for storage
#[derive(Debug, Clone)]
pub struct ClassifiedRow {
    pub classification: Classification,
    pub needs_review: bool,
    pub origin_display: Option<String>,
    pub destination_display: Option<String>,
}

type MemoKey = (String, i8, String, Option<String>);

/// Per-job classifier bound to one tenant
pub struct Classifier {
    db: Database,
    llm: Option<LlmService>,
    tenant_id: String,
    settings: TenantSettings,
    /// Normalized identifier -> account, prefetched for the job
    accounts: HashMap<String, Account>,
    /// Entity code -> default business line, prefetched
    default_lines: HashMap<String, Option<String>>,
    entities: Vec<String>,
    categories: Vec<String>,
    chart_seeded: bool,
    memo: Mutex<HashMap<MemoKey, ClassifiedRow>>,
    /// Remaining LLM calls for this job; exhausted budget demotes to default
    llm_budget: AtomicU32,
}

impl Classifier {
    /// Build a classifier for one job, prefetching the tenant's chart and
    /// account map
    pub fn for_job(db: Database, llm: Option<LlmService>, tenant_id: &str) -> Result<Self> {
        let settings = db.tenant_settings(tenant_id)?;
        let chart_seeded = db.has_seeded_chart(tenant_id)?;
        let entities = db.list_entity_codes(tenant_id)?;
        let categories = db.list_categories(tenant_id)?;

        let mut accounts = HashMap::new();
        for account in db.list_accounts(tenant_id, false)? {
            accounts.insert(normalize_identifier(&account.identifier), account);
        }

        let mut default_lines = HashMap::new();
        for code in &entities {
            default_lines.insert(code.clone(), db.default_business_line(tenant_id, code)?);
        }

        let budget = settings.llm_job_budget;
        Ok(Self {
            db,
            llm,
            tenant_id: tenant_id.to_string(),
            settings,
            accounts,
            default_lines,
            entities,
            categories,
            chart_seeded,
            memo: Mutex::new(HashMap::new()),
            llm_budget: AtomicU32::new(budget),
        })
    }

    /// Classify one canonical row
    pub async fn classify(&self, row: &CanonicalRow) -> Result<ClassifiedRow> {
        let key = memo_key(row);
        if let Some(hit) = self.memo.lock().unwrap().get(&key).cloned() {
            debug!(tenant = %self.tenant_id, "classifier memo hit");
            return Ok(hit);
        }

        let mut result = self.classify_uncached(row).await?;

        // Zero-amount rows are accepted but always reviewed
        if row.amount == Decimal::ZERO {
            result.needs_review = true;
        }

        self.memo.lock().unwrap().insert(key, result.clone());
        Ok(result)
    }

    async fn classify_uncached(&self, row: &CanonicalRow) -> Result<ClassifiedRow> {
        let origin_display = row
            .origin
            .as_deref()
            .and_then(|o| self.account_for(o))
            .and_then(|a| a.display_name.clone());
        let destination_display = row
            .destination
            .as_deref()
            .and_then(|d| self.account_for(d))
            .and_then(|a| a.display_name.clone());

        // A tenant without a seeded chart gets only default output
        if !self.chart_seeded {
            return Ok(ClassifiedRow {
                classification: Classification::unclassified(),
                needs_review: true,
                origin_display,
                destination_display,
            });
        }

        // Layer 1: account / wallet map
        if let Some(classification) = self.match_account_layer(row)? {
            let needs_review = classification.confidence < self.settings.review_threshold;
            return Ok(ClassifiedRow {
                classification,
                needs_review,
                origin_display,
                destination_display,
            });
        }

        // Layers 2 and 3 are computed together so conflicting confident
        // signals can be detected instead of silently picking one
        let desc_matches = self
            .db
            .match_description(&self.tenant_id, &row.description)
            .map_err(pattern_store_err)?;
        let desc_best = desc_matches
            .into_iter()
            .find(|m| m.confidence >= self.settings.match_threshold);

        let sig_scores = self
            .db
            .match_entity_signature(&self.tenant_id, &row.description, self.settings.signature_cap)
            .map_err(pattern_store_err)?;
        let signature = self.best_signature(&sig_scores);

        if let (Some(desc), Some((sig_entity, sig_score, _))) = (&desc_best, &signature) {
            let desc_entity = desc.entity_code.as_deref().unwrap_or("");
            if desc_entity != sig_entity.as_str()
                && (desc.confidence - *sig_score).abs() <= self.settings.disagreement_margin
            {
                warn!(
                    tenant = %self.tenant_id,
                    description = %row.description,
                    "description pattern and entity signature disagree at comparable confidence"
                );
                let mut classification = Classification::unclassified();
                classification.justification =
                    "conflicting pattern and signature matches".to_string();
                return Ok(ClassifiedRow {
                    classification,
                    needs_review: true,
                    origin_display,
                    destination_display,
                });
            }
        }

        // Layer 2: description pattern
        if let Some(m) = desc_best {
            self.db
                .record_occurrence(&self.tenant_id, m.pattern_id)
                .map_err(pattern_store_err)?;
            let entity_code = m.entity_code.clone();
            let line = self.line_for(entity_code.as_deref(), m.business_line_code.clone());
            let classification = Classification {
                entity_code,
                business_line_code: line,
                accounting_category: m.category.clone().unwrap_or_else(|| "Uncategorized".to_string()),
                subcategory: m.subcategory.clone().unwrap_or_default(),
                justification: "matched tenant description pattern".to_string(),
                confidence: m.confidence,
                source: ClassificationSource::TenantPattern,
            };
            let needs_review = classification.confidence < self.settings.review_threshold;
            return Ok(ClassifiedRow {
                classification,
                needs_review,
                origin_display,
                destination_display,
            });
        }

        // Layer 3: entity signature; category falls through to the LLM
        if let Some((entity, score, pattern_id)) = signature {
            self.db
                .record_occurrence(&self.tenant_id, pattern_id)
                .map_err(pattern_store_err)?;
            let (category, subcategory, justification) =
                match self.llm_category_for(row).await {
                    Some(cls) => (cls.category, cls.subcategory, cls.justification),
                    None => ("Uncategorized".to_string(), String::new(), String::new()),
                };
            let line = self.line_for(Some(&entity), None);
            let classification = Classification {
                entity_code: Some(entity),
                business_line_code: line,
                accounting_category: category,
                subcategory,
                justification: if justification.is_empty() {
                    "matched entity signature tokens".to_string()
                } else {
                    justification
                },
                confidence: score,
                source: ClassificationSource::TenantPattern,
            };
            let needs_review = classification.confidence < self.settings.review_threshold;
            return Ok(ClassifiedRow {
                classification,
                needs_review,
                origin_display,
                destination_display,
            });
        }

        // Layer 4: LLM fallback
        if let Some(classification) = self.llm_layer(row).await {
            let needs_review = classification.confidence < self.settings.review_threshold;
            return Ok(ClassifiedRow {
                classification,
                needs_review,
                origin_display,
                destination_display,
            });
        }

        // Layer 5: default
        Ok(ClassifiedRow {
            classification: Classification::unclassified(),
            needs_review: true,
            origin_display,
            destination_display,
        })
    }

    /// Layer 1: the row's account identifier, origin, or destination matches
    /// a known account
    fn match_account_layer(&self, row: &CanonicalRow) -> Result<Option<Classification>> {
        let mut matched: Option<(&Account, bool)> = None;

        if let Some(account) = row.account_identifier.as_deref().and_then(|i| self.account_for(i)) {
            matched = Some((account, false));
        } else if let Some(account) = row.origin.as_deref().and_then(|o| self.account_for(o)) {
            matched = Some((account, false));
        } else if let Some(account) = row.destination.as_deref().and_then(|d| self.account_for(d)) {
            // Destination hit: this row is money arriving at a known account
            matched = Some((account, true));
        }

        // Learned account-map patterns extend the table
        if matched.is_none() {
            for candidate in [&row.account_identifier, &row.origin, &row.destination]
                .into_iter()
                .flatten()
            {
                if let Some(p) = self
                    .db
                    .match_account_pattern(&self.tenant_id, candidate)
                    .map_err(pattern_store_err)?
                {
                    self.db
                        .record_occurrence(&self.tenant_id, p.id)
                        .map_err(pattern_store_err)?;
                    let line = self.line_for(p.entity_code.as_deref(), p.business_line_code.clone());
                    return Ok(Some(Classification {
                        entity_code: p.entity_code.clone(),
                        business_line_code: line,
                        accounting_category: p
                            .category
                            .clone()
                            .unwrap_or_else(|| "Uncategorized".to_string()),
                        subcategory: p.subcategory.clone().unwrap_or_default(),
                        justification: "matched learned account pattern".to_string(),
                        confidence: ACCOUNT_MAP_CONFIDENCE,
                        source: ClassificationSource::AccountMap,
                    }));
                }
            }
        }

        let (account, is_destination) = match matched {
            Some(m) => m,
            None => return Ok(None),
        };

        // Receiving wallet with a mining role: incoming network transfers are
        // revenue
        let mining_receipt = is_destination
            && account.role.as_deref() == Some(MINING_ROLE)
            && (row.network.is_some() || row.origin.is_some());

        let category = if mining_receipt {
            "Revenue".to_string()
        } else {
            account
                .default_category
                .clone()
                .unwrap_or_else(|| "Uncategorized".to_string())
        };

        let line = self.line_for(Some(&account.entity_code), account.business_line_code.clone());
        Ok(Some(Classification {
            entity_code: Some(account.entity_code.clone()),
            business_line_code: line,
            accounting_category: category,
            subcategory: account.default_subcategory.clone().unwrap_or_default(),
            justification: format!(
                "matched account {}",
                account.display_name.as_deref().unwrap_or(&account.identifier)
            ),
            confidence: ACCOUNT_MAP_CONFIDENCE,
            source: ClassificationSource::AccountMap,
        }))
    }

    /// Top signature candidate if it clears the threshold and margin.
    ///
    /// Candidates are aggregated per entity (best weight wins) before the
    /// margin check, so several weak signatures for one entity don't crowd
    /// out the runner-up comparison.
    fn best_signature(
        &self,
        scores: &[crate::models::SignatureMatch],
    ) -> Option<(String, f64, i64)> {
        let cap = self.settings.signature_cap.max(1) as f64;
        let mut per_entity: HashMap<&str, (i64, i64)> = HashMap::new();
        for s in scores {
            let entry = per_entity.entry(s.entity_code.as_str()).or_insert((0, s.pattern_id));
            if s.total_weight > entry.0 {
                *entry = (s.total_weight, s.pattern_id);
            }
        }

        let mut ranked: Vec<(&str, i64, i64)> = per_entity
            .into_iter()
            .map(|(entity, (weight, pattern_id))| (entity, weight, pattern_id))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        let (entity, weight, pattern_id) = ranked.first().copied()?;
        let score = weight as f64 / cap;
        if score < self.settings.signature_threshold {
            return None;
        }
        if let Some((_, runner_weight, _)) = ranked.get(1) {
            let runner_score = *runner_weight as f64 / cap;
            if score - runner_score < self.settings.signature_margin {
                return None;
            }
        }
        Some((entity.to_string(), score, pattern_id))
    }

    /// LLM call for the signature layer's category fallthrough
    async fn llm_category_for(&self, row: &CanonicalRow) -> Option<crate::llm::LlmClassification> {
        let response = self.call_llm(row).await?;
        if self.categories.contains(&response.category) {
            Some(response)
        } else {
            None
        }
    }

    /// Layer 4: LLM fallback with strict enumeration validation
    async fn llm_layer(&self, row: &CanonicalRow) -> Option<Classification> {
        let response = self.call_llm(row).await?;

        // The LLM is an oracle, not an authority: anything outside the
        // tenant's enumerations is an invalid response
        if let Some(ref entity) = response.entity {
            if !self.entities.contains(entity) {
                warn!(
                    tenant = %self.tenant_id,
                    entity = %entity,
                    "LLM named an entity outside the tenant's chart; demoting to default"
                );
                return None;
            }
        }
        if !self.categories.contains(&response.category) {
            warn!(
                tenant = %self.tenant_id,
                category = %response.category,
                "LLM named a category outside the tenant's enumeration; demoting to default"
            );
            return None;
        }

        let line = self.line_for(response.entity.as_deref(), response.business_line.clone());
        Some(Classification {
            entity_code: response.entity,
            business_line_code: line,
            accounting_category: response.category,
            subcategory: response.subcategory,
            justification: response.justification,
            confidence: response.confidence.clamp(0.0, LLM_CONFIDENCE_CAP),
            source: ClassificationSource::Llm,
        })
    }

    /// One budgeted, recoverable LLM call
    async fn call_llm(&self, row: &CanonicalRow) -> Option<crate::llm::LlmClassification> {
        let llm = self.llm.as_ref()?;

        // Budget check: fetch_update refuses to go below zero
        let had_budget = self
            .llm_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_ok();
        if !had_budget {
            debug!(tenant = %self.tenant_id, "LLM job budget exhausted; demoting to default");
            return None;
        }

        let recent_patterns = match self.db.top_patterns(&self.tenant_id, 10) {
            Ok(patterns) => patterns
                .iter()
                .map(|p| {
                    format!(
                        "{} \"{}\" -> {} / {}",
                        p.kind.as_str(),
                        p.body,
                        p.entity_code.as_deref().unwrap_or("-"),
                        p.category.as_deref().unwrap_or("-")
                    )
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        let request = ClassifyRequest {
            description: row.description.clone(),
            amount: row.amount.to_string(),
            currency: row.currency.clone(),
            origin: row.origin.clone(),
            destination: row.destination.clone(),
            account_identifier: row.account_identifier.clone(),
            entities: self.entities.clone(),
            categories: self.categories.clone(),
            recent_patterns,
        };

        match llm.classify_transaction(&self.tenant_id, &request).await {
            Ok(response) => Some(response),
            Err(e) => {
                // Recoverable: the row falls through to the default layer
                warn!(
                    tenant = %self.tenant_id,
                    description = %row.description,
                    "LLM classification failed: {}",
                    e
                );
                None
            }
        }
    }

    fn account_for(&self, identifier: &str) -> Option<&Account> {
        self.accounts.get(&normalize_identifier(identifier))
    }

    /// Resolve a business line: an explicit line wins, otherwise the
    /// entity's default line
    fn line_for(&self, entity: Option<&str>, explicit: Option<String>) -> Option<String> {
        explicit.or_else(|| {
            entity
                .and_then(|e| self.default_lines.get(e))
                .cloned()
                .flatten()
        })
    }
}

fn memo_key(row: &CanonicalRow) -> MemoKey {
    let sign = match row.amount.cmp(&Decimal::ZERO) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    };
    (
        normalize_whitespace(&row.description).to_uppercase(),
        sign,
        row.currency.clone(),
        row.account_identifier.clone(),
    )
}

/// Pattern Store failures are fatal for the job; a silent "match nothing"
/// path would misclassify everything as default.
fn pattern_store_err(e: Error) -> Error {
    match e {
        Error::Database(inner) => Error::PatternStoreUnavailable(inner.to_string()),
        Error::Pool(inner) => Error::PatternStoreUnavailable(inner.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, MockBackend};
    use crate::models::{AccountKind, NewPattern, PatternKind, PatternSource};
    use std::str::FromStr;

    fn seeded_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.create_tenant("acme", "Acme", None, "USD", None).unwrap();
        db.create_legal_entity("acme", "DMP", "Digital Mining Partners", None, None, "USD")
            .unwrap();
        db.create_legal_entity("acme", "HLD", "Holdings", None, None, "USD")
            .unwrap();
        db.create_business_line("acme", "DMP", "MINE", "Mining", true, None)
            .unwrap();
        db.create_business_line("acme", "HLD", "OPS", "Operations", true, None)
            .unwrap();
        db.add_category("acme", "Revenue").unwrap();
        db.add_category("acme", "Expenses").unwrap();
        db
    }

    fn row(description: &str, amount: &str) -> CanonicalRow {
        let amount = Decimal::from_str(amount).unwrap();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let content_hash = CanonicalRow::compute_content_hash(
            "acme", &date, description, &amount, "USD", None, None,
        );
        CanonicalRow {
            tenant_id: "acme".to_string(),
            raw_file_id: 1,
            row_index_in_file: 1,
            posted_date: date,
            description: description.to_string(),
            amount,
            currency: "USD".to_string(),
            account_identifier: None,
            origin: None,
            destination: None,
            reference: None,
            transaction_type: None,
            network: None,
            content_hash,
        }
    }

    fn classifier(db: &Database, mock: &MockBackend) -> Classifier {
        let llm = LlmService::new(LlmClient::Mock(mock.clone()));
        Classifier::for_job(db.clone(), Some(llm), "acme").unwrap()
    }

    #[tokio::test]
    async fn test_account_map_short_circuits_with_zero_llm_calls() {
        let db = seeded_db();
        db.create_account(
            "acme",
            AccountKind::Wallet,
            "0xABCdef123",
            Some("Mining wallet"),
            "DMP",
            None,
            None,
            None,
            Some("mining"),
        )
        .unwrap();

        let mock = MockBackend::new();
        let classifier = classifier(&db, &mock);

        let mut r = row("Inbound transfer", "0.5");
        // Case-insensitive identifier match on the destination
        r.destination = Some("0xabcDEF123".to_string());
        r.origin = Some("bitcoin".to_string());
        r.network = Some("BTC".to_string());

        let out = classifier.classify(&r).await.unwrap();
        assert_eq!(out.classification.source, ClassificationSource::AccountMap);
        assert_eq!(out.classification.entity_code.as_deref(), Some("DMP"));
        assert_eq!(out.classification.confidence, 0.99);
        // Receiving wallet with a mining role: revenue
        assert_eq!(out.classification.accounting_category, "Revenue");
        assert_eq!(out.destination_display.as_deref(), Some("Mining wallet"));
        assert!(!out.needs_review);
        assert_eq!(mock.classify_calls(), 0);
    }

    #[tokio::test]
    async fn test_description_pattern_suppresses_llm() {
        let db = seeded_db();
        db.upsert_pattern(
            "acme",
            &NewPattern {
                kind: PatternKind::Substring,
                body: "EVERMINER".to_string(),
                signature: None,
                entity_code: Some("DMP".to_string()),
                business_line_code: None,
                category: Some("Revenue".to_string()),
                subcategory: None,
                confidence: 0.9,
                source: PatternSource::UserCorrection,
            },
        )
        .unwrap();

        let mock = MockBackend::new();
        let classifier = classifier(&db, &mock);

        let out = classifier.classify(&row("EVERMINER MONTHLY", "150")).await.unwrap();
        assert_eq!(out.classification.source, ClassificationSource::TenantPattern);
        assert_eq!(out.classification.entity_code.as_deref(), Some("DMP"));
        assert_eq!(out.classification.accounting_category, "Revenue");
        // Default business line inherited from the entity
        assert_eq!(out.classification.business_line_code.as_deref(), Some("MINE"));
        assert!(out.classification.confidence >= 0.8);
        assert_eq!(mock.classify_calls(), 0);
    }

    #[tokio::test]
    async fn test_low_confidence_pattern_falls_through_to_llm() {
        let db = seeded_db();
        db.upsert_pattern(
            "acme",
            &NewPattern {
                kind: PatternKind::Substring,
                body: "COFFEE".to_string(),
                signature: None,
                entity_code: Some("HLD".to_string()),
                business_line_code: None,
                category: Some("Expenses".to_string()),
                subcategory: None,
                confidence: 0.4,
                source: PatternSource::Seed,
            },
        )
        .unwrap();

        let mock = MockBackend::new();
        let classifier = classifier(&db, &mock);

        let out = classifier.classify(&row("COFFEE SHOP HLD", "-4.50")).await.unwrap();
        // 0.4 < match threshold, so the LLM got the row
        assert_eq!(out.classification.source, ClassificationSource::Llm);
        assert_eq!(mock.classify_calls(), 1);
    }

    #[tokio::test]
    async fn test_disagreement_yields_default_and_review() {
        let db = seeded_db();
        db.upsert_pattern(
            "acme",
            &NewPattern {
                kind: PatternKind::Substring,
                body: "ACME SERVICES".to_string(),
                signature: None,
                entity_code: Some("HLD".to_string()),
                business_line_code: None,
                category: Some("Expenses".to_string()),
                subcategory: None,
                confidence: 0.82,
                source: PatternSource::Seed,
            },
        )
        .unwrap();
        db.upsert_pattern(
            "acme",
            &NewPattern {
                kind: PatternKind::EntitySignature,
                body: "sig:acme-services".to_string(),
                signature: Some(crate::models::EntitySignature {
                    company_names: vec!["ACME SERVICES".to_string()],
                    keywords: vec!["SERVICES".to_string(), "ACME".to_string(), "INVOICE".to_string()],
                    ..Default::default()
                }),
                entity_code: Some("DMP".to_string()),
                business_line_code: None,
                category: None,
                subcategory: None,
                confidence: 0.8,
                source: PatternSource::LlmExtraction,
            },
        )
        .unwrap();

        let mock = MockBackend::new();
        let classifier = classifier(&db, &mock);

        // Signature weight: company name (2) + two keyword hits (2) + INVOICE (1) = 5 -> 5/6 = 0.833
        // Description pattern confidence 0.82: comparable, different entity
        let out = classifier
            .classify(&row("ACME SERVICES INVOICE 42", "-100"))
            .await
            .unwrap();
        assert_eq!(out.classification.source, ClassificationSource::Default);
        assert!(out.needs_review);
        assert_eq!(out.classification.entity_code, None);
        assert_eq!(mock.classify_calls(), 0);
    }

    #[tokio::test]
    async fn test_llm_entity_outside_chart_is_rejected() {
        let db = seeded_db();
        let mut mock = MockBackend::new();
        mock.canned_classification = Some(crate::llm::LlmClassification {
            entity: Some("EVIL".to_string()),
            business_line: None,
            category: "Revenue".to_string(),
            subcategory: String::new(),
            justification: String::new(),
            confidence: 0.95,
            reasoning: String::new(),
        });
        let classifier = classifier(&db, &mock);

        let out = classifier.classify(&row("MYSTERY PAYMENT", "-10")).await.unwrap();
        assert_eq!(out.classification.source, ClassificationSource::Default);
        assert!(out.needs_review);
    }

    #[tokio::test]
    async fn test_llm_confidence_capped() {
        let db = seeded_db();
        let mut mock = MockBackend::new();
        mock.canned_classification = Some(crate::llm::LlmClassification {
            entity: Some("DMP".to_string()),
            business_line: None,
            category: "Revenue".to_string(),
            subcategory: String::new(),
            justification: String::new(),
            confidence: 0.99,
            reasoning: String::new(),
        });
        let classifier = classifier(&db, &mock);

        let out = classifier.classify(&row("SOMETHING", "5")).await.unwrap();
        assert_eq!(out.classification.source, ClassificationSource::Llm);
        assert_eq!(out.classification.confidence, 0.90);
    }

    #[tokio::test]
    async fn test_llm_unreachable_falls_to_default() {
        let db = seeded_db();
        let mock = MockBackend::unhealthy();
        let classifier = classifier(&db, &mock);

        let out = classifier.classify(&row("UNKNOWN VENDOR", "-25")).await.unwrap();
        assert_eq!(out.classification.source, ClassificationSource::Default);
        assert_eq!(out.classification.accounting_category, "Uncategorized");
        assert!(out.needs_review);
    }

    #[tokio::test]
    async fn test_zero_amount_flagged_for_review() {
        let db = seeded_db();
        let mock = MockBackend::new();
        let classifier = classifier(&db, &mock);

        let out = classifier.classify(&row("DMP ADJUSTMENT", "0")).await.unwrap();
        assert!(out.needs_review);
    }

    #[tokio::test]
    async fn test_memo_avoids_reclassification() {
        let db = seeded_db();
        let mock = MockBackend::new();
        let classifier = classifier(&db, &mock);

        let r = row("SOME UNKNOWN THING", "-10");
        classifier.classify(&r).await.unwrap();
        classifier.classify(&r).await.unwrap();
        // Identical rows within a job hit the memo, not the LLM
        assert_eq!(mock.classify_calls(), 1);
    }

    #[tokio::test]
    async fn test_unseeded_chart_produces_only_default() {
        let db = Database::in_memory().unwrap();
        db.create_tenant("bare", "Bare", None, "USD", None).unwrap();
        db.create_legal_entity("bare", "X", "X", None, None, "USD").unwrap();
        // No default business line: chart not seeded

        let mock = MockBackend::new();
        let llm = LlmService::new(LlmClient::Mock(mock.clone()));
        let classifier = Classifier::for_job(db.clone(), Some(llm), "bare").unwrap();

        let mut r = row("X PAYMENT", "-1");
        r.tenant_id = "bare".to_string();
        let out = classifier.classify(&r).await.unwrap();
        assert_eq!(out.classification.source, ClassificationSource::Default);
        assert_eq!(mock.classify_calls(), 0);
    }

    #[tokio::test]
    async fn test_llm_budget_exhaustion_demotes_to_default() {
        let db = seeded_db();
        let mut settings = db.tenant_settings("acme").unwrap();
        settings.llm_job_budget = 1;
        db.update_tenant_settings("acme", &settings).unwrap();

        let mock = MockBackend::new();
        let classifier = classifier(&db, &mock);

        classifier.classify(&row("FIRST UNKNOWN", "-1")).await.unwrap();
        let out = classifier.classify(&row("SECOND UNKNOWN", "-2")).await.unwrap();
        assert_eq!(mock.classify_calls(), 1);
        assert_eq!(out.classification.source, ClassificationSource::Default);
    }
}
