//! Integration tests for glean-core
//!
//! These tests exercise the full submit -> analyze -> ingest -> classify ->
//! store pipeline, the correction -> learned pattern loop, and the
//! multi-tenant isolation guarantees, with a mock LLM whose call counters
//! back the layering assertions.

use std::sync::Arc;

use glean_core::db::TransactionFilter;
use glean_core::models::{AccountKind, ClassificationSource, SuggestionStatus};
use glean_core::{
    ClassificationPatch, Database, Error, GleanCore, JobState, LlmClient, LocalBlobStore,
    MockBackend,
};

/// CSV with two junk lines plus a blank-ish preamble before the header
const JUNKY_CSV: &str = "Account export\nGenerated by portal\nperiod 2024-03\nDate,Description,Amount,Currency\n2024-03-01,EVERMINER PAYOUT 001,150.00,USD\n2024-03-02,OFFICE RENT MARCH,-2000.00,USD\n";

const TWO_ROW_CSV: &str = "Date,Description,Amount,Currency\n2024-03-01,COFFEE BEANS,-18.50,USD\n2024-03-02,CLIENT WIRE,3200.00,USD\n";

struct Harness {
    core: GleanCore,
    mock: MockBackend,
    _blob_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let db = Database::in_memory().unwrap();
    let blob_dir = tempfile::tempdir().unwrap();
    let blob = Arc::new(LocalBlobStore::new(blob_dir.path().to_path_buf()).unwrap());
    let mock = MockBackend::new();
    let core = GleanCore::new(db, blob, LlmClient::Mock(mock.clone()));
    Harness {
        core,
        mock,
        _blob_dir: blob_dir,
    }
}

fn seed_tenant(core: &GleanCore, tenant: &str) {
    let db = core.db();
    db.create_tenant(tenant, tenant, None, "USD", None).unwrap();
    db.create_legal_entity(tenant, "DMP", "Digital Mining Partners", None, None, "USD")
        .unwrap();
    db.create_legal_entity(tenant, "HLD", "Holdings", None, None, "USD")
        .unwrap();
    db.create_business_line(tenant, "DMP", "MINE", "Mining", true, None)
        .unwrap();
    db.create_business_line(tenant, "HLD", "OPS", "Operations", true, None)
        .unwrap();
    db.add_category(tenant, "Revenue").unwrap();
    db.add_category(tenant, "Expenses").unwrap();
}

async fn ingest(core: &GleanCore, tenant: &str, name: &str, bytes: &[u8]) -> (i64, glean_core::JobProgress) {
    let file = core.submit_raw_file(tenant, name, bytes).unwrap();
    let job = core.start_ingest(tenant, file.id).unwrap();
    let progress = core.wait_for_job(tenant, job).await.unwrap();
    (file.id, progress)
}

// =============================================================================
// S1: heterogeneous format, parse knowledge only in the plan
// =============================================================================

#[tokio::test]
async fn test_s1_junk_preamble_parsed_via_plan() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    let (_file, progress) = ingest(&h.core, "acme", "export.csv", JUNKY_CSV.as_bytes()).await;
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!(progress.rows_accepted, 2);
    assert_eq!(progress.rows_rejected, 0);

    let page = h
        .core
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    assert_eq!(page.total, 2);
    assert!(page
        .transactions
        .iter()
        .any(|t| t.description == "EVERMINER PAYOUT 001"));
}

#[test]
fn test_s1_no_vendor_name_constants_in_parse_or_classify_paths() {
    // The redesign forbids vendor branching: all parse knowledge lives in the
    // plan. Guard the core paths against regressions.
    let root = env!("CARGO_MANIFEST_DIR");
    for file in ["analyzer.rs", "ingest.rs", "classify.rs", "plan.rs"] {
        let source = std::fs::read_to_string(format!("{}/src/{}", root, file)).unwrap();
        for vendor in ["Chase", "Coinbase", "BofA", "Amex", "Capital One", "Kraken", "Binance"] {
            assert!(
                !source.contains(vendor),
                "{} mentions vendor name {}",
                file,
                vendor
            );
        }
    }
}

// =============================================================================
// S2: duplicate re-upload is idempotent, no classifier work for duplicates
// =============================================================================

#[tokio::test]
async fn test_s2_duplicate_reupload() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    let (file_id, first) = ingest(&h.core, "acme", "two.csv", TWO_ROW_CSV.as_bytes()).await;
    assert_eq!(first.rows_accepted, 2);
    assert_eq!(first.rows_duplicate, 0);

    let calls_after_first = h.mock.classify_calls();

    // Submitting identical bytes lands on the same raw file
    let again = h
        .core
        .submit_raw_file("acme", "two-copy.csv", TWO_ROW_CSV.as_bytes())
        .unwrap();
    assert_eq!(again.id, file_id);

    let job = h.core.start_ingest("acme", file_id).unwrap();
    let second = h.core.wait_for_job("acme", job).await.unwrap();
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(second.rows_accepted, 0);
    assert_eq!(second.rows_duplicate, 2);

    // Store unchanged, and no classifier (hence no LLM) work for duplicates
    let page = h
        .core
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(h.mock.classify_calls(), calls_after_first);
}

// =============================================================================
// S3: account map short-circuit
// =============================================================================

#[tokio::test]
async fn test_s3_wallet_map_short_circuit() {
    let h = harness();
    seed_tenant(&h.core, "acme");
    h.core
        .db()
        .create_account(
            "acme",
            AccountKind::Wallet,
            "0xABC1234567",
            Some("Mining wallet"),
            "DMP",
            None,
            Some("Revenue"),
            None,
            Some("mining"),
        )
        .unwrap();

    let csv = "Date,Description,Amount,Currency,Destination,Network\n2024-03-05,INBOUND TRANSFER,0.42000000,BTC,0xabc1234567,bitcoin\n";
    let (_file, progress) = ingest(&h.core, "acme", "chain.csv", csv.as_bytes()).await;
    assert_eq!(progress.rows_accepted, 1);

    let page = h
        .core
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    let tx = &page.transactions[0];
    assert_eq!(tx.classification_source, ClassificationSource::AccountMap);
    assert_eq!(tx.entity_code.as_deref(), Some("DMP"));
    assert_eq!(tx.confidence, 0.99);
    assert_eq!(tx.accounting_category.as_deref(), Some("Revenue"));
    assert_eq!(tx.destination_display.as_deref(), Some("Mining wallet"));
    assert!(!tx.needs_review);
    // The short circuit means the LLM never saw the row
    assert_eq!(h.mock.classify_calls(), 0);
}

// =============================================================================
// S4 / property 7: corrections become patterns that classify future imports
// =============================================================================

#[tokio::test]
async fn test_s4_learned_pattern_promotion_round_trip() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    let csv = "Date,Description,Amount,Currency\n\
        2024-01-15,EVERMINER PAYOUT 0017,150.00,USD\n\
        2024-02-15,EVERMINER PAYOUT 0018,151.00,USD\n\
        2024-03-15,EVERMINER PAYOUT 0019,149.50,USD\n\
        2024-03-20,OFFICE RENT MARCH,-2000.00,USD\n";
    let (_file, progress) = ingest(&h.core, "acme", "q1.csv", csv.as_bytes()).await;
    assert_eq!(progress.rows_accepted, 4);

    // The user classifies the three payout rows to DMP / Revenue
    let page = h
        .core
        .list_transactions(
            "acme",
            &TransactionFilter {
                search: Some("EVERMINER".to_string()),
                ..Default::default()
            },
            10,
            0,
        )
        .unwrap();
    assert_eq!(page.total, 3);

    let mut last_outcome = None;
    for tx in &page.transactions {
        let outcome = h
            .core
            .update_classification(
                "acme",
                tx.id,
                ClassificationPatch {
                    entity_code: Some("DMP".to_string()),
                    accounting_category: Some("Revenue".to_string()),
                    ..Default::default()
                },
                "user-1",
            )
            .await
            .unwrap();
        last_outcome = Some(outcome);
    }

    // The third correction crossed the threshold and promoted a pattern
    let outcome = last_outcome.unwrap();
    let (_, status) = outcome.suggestion.expect("a suggestion should have been built");
    assert_eq!(status, SuggestionStatus::Approved);
    assert!(outcome.pattern_id.is_some());

    let patterns = h.core.list_patterns("acme", None, Some("DMP")).unwrap();
    assert!(!patterns.is_empty());
    assert!(patterns.iter().any(|p| p.confidence >= 0.80));

    // A new import with a fresh description classifies deterministically
    let classify_calls_before = h.mock.classify_calls();
    let csv2 = "Date,Description,Amount,Currency\n2024-04-15,EVERMINER MONTHLY PAYOUT,152.00,USD\n";
    let (_f2, p2) = ingest(&h.core, "acme", "apr.csv", csv2.as_bytes()).await;
    assert_eq!(p2.rows_accepted, 1);

    let page = h
        .core
        .list_transactions(
            "acme",
            &TransactionFilter {
                search: Some("MONTHLY".to_string()),
                ..Default::default()
            },
            10,
            0,
        )
        .unwrap();
    let tx = &page.transactions[0];
    assert_eq!(tx.classification_source, ClassificationSource::TenantPattern);
    assert_eq!(tx.entity_code.as_deref(), Some("DMP"));
    assert_eq!(tx.accounting_category.as_deref(), Some("Revenue"));
    assert!(tx.confidence >= 0.80);
    // Zero LLM calls for the pattern-matched row
    assert_eq!(h.mock.classify_calls(), classify_calls_before);
}

#[tokio::test]
async fn test_category_only_correction_still_feeds_reinforcement() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    // Build the learned pattern the same way S4 does
    let csv = "Date,Description,Amount,Currency\n\
        2024-01-15,EVERMINER PAYOUT 0017,150.00,USD\n\
        2024-02-15,EVERMINER PAYOUT 0018,151.00,USD\n\
        2024-03-15,EVERMINER PAYOUT 0019,149.50,USD\n";
    ingest(&h.core, "acme", "q1.csv", csv.as_bytes()).await;
    let page = h
        .core
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    for tx in &page.transactions {
        h.core
            .update_classification(
                "acme",
                tx.id,
                ClassificationPatch {
                    entity_code: Some("DMP".to_string()),
                    accounting_category: Some("Revenue".to_string()),
                    ..Default::default()
                },
                "user-1",
            )
            .await
            .unwrap();
    }

    // A new row classifies to DMP through the learned pattern, no user entity
    // edit involved
    let csv2 = "Date,Description,Amount,Currency\n2024-04-15,EVERMINER MONTHLY PAYOUT,152.00,USD\n";
    ingest(&h.core, "acme", "apr.csv", csv2.as_bytes()).await;
    let tx = h
        .core
        .list_transactions(
            "acme",
            &TransactionFilter {
                search: Some("MONTHLY".to_string()),
                ..Default::default()
            },
            10,
            0,
        )
        .unwrap()
        .transactions
        .remove(0);
    assert_eq!(tx.classification_source, ClassificationSource::TenantPattern);
    assert_eq!(tx.entity_code.as_deref(), Some("DMP"));

    // Correcting only the category must still run the learning loop: the
    // correction row plus the row's resolved entity are the trigger, not a
    // repeated --entity edit
    let outcome = h
        .core
        .update_classification(
            "acme",
            tx.id,
            ClassificationPatch {
                accounting_category: Some("Expenses".to_string()),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .unwrap();
    let (_, status) = outcome
        .suggestion
        .expect("category-only edit must reach the reinforcement engine");
    assert_eq!(status, SuggestionStatus::Approved);

    let tx = h.core.get_transaction("acme", tx.id).unwrap();
    assert_eq!(tx.accounting_category.as_deref(), Some("Expenses"));
    assert_eq!(tx.classification_source, ClassificationSource::User);
}

// =============================================================================
// S6: missing tenant fails loudly, mutates nothing, logs a security event
// =============================================================================

#[tokio::test]
async fn test_s6_missing_tenant() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    let err = h.core.start_ingest("", 1).unwrap_err();
    assert!(matches!(err, Error::MissingTenant));

    let err = h
        .core
        .submit_raw_file("   ", "f.csv", b"Date,Description,Amount\n")
        .unwrap_err();
    assert!(matches!(err, Error::MissingTenant));

    // Unknown tenants are just as dead
    let err = h.core.start_ingest("ghost", 1).unwrap_err();
    assert!(matches!(err, Error::MissingTenant));

    // No raw file was registered anywhere
    assert!(h.core.db().list_raw_files("acme", 10).unwrap().is_empty());

    // Each refusal left a security-category event
    let events = h
        .core
        .db()
        .list_security_events(Some(glean_core::tenant::SECURITY_CATEGORY_TENANT), 10)
        .unwrap();
    assert_eq!(events.len(), 3);
}

// =============================================================================
// Property 1: tenant isolation across every read path
// =============================================================================

#[tokio::test]
async fn test_tenant_isolation_across_read_paths() {
    let h = harness();
    seed_tenant(&h.core, "acme");
    seed_tenant(&h.core, "globex");

    // Concurrent ingest of the same bytes for both tenants
    let file_a = h.core.submit_raw_file("acme", "q.csv", JUNKY_CSV.as_bytes()).unwrap();
    let file_b = h.core.submit_raw_file("globex", "q.csv", JUNKY_CSV.as_bytes()).unwrap();
    let job_a = h.core.start_ingest("acme", file_a.id).unwrap();
    let job_b = h.core.start_ingest("globex", file_b.id).unwrap();
    let (pa, pb) = tokio::join!(
        h.core.wait_for_job("acme", job_a),
        h.core.wait_for_job("globex", job_b)
    );
    assert_eq!(pa.unwrap().rows_accepted, 2);
    assert_eq!(pb.unwrap().rows_accepted, 2);

    // Corrections and learned patterns only for acme
    let page = h
        .core
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    for tx in &page.transactions {
        assert_eq!(tx.tenant_id, "acme");
        h.core
            .update_classification(
                "acme",
                tx.id,
                ClassificationPatch {
                    entity_code: Some("DMP".to_string()),
                    ..Default::default()
                },
                "user-1",
            )
            .await
            .unwrap();
    }

    // Transaction store: globex sees only its own rows
    let globex_page = h
        .core
        .list_transactions("globex", &TransactionFilter::default(), 10, 0)
        .unwrap();
    assert_eq!(globex_page.total, 2);
    assert!(globex_page.transactions.iter().all(|t| t.tenant_id == "globex"));

    // Cross-tenant get by id fails
    let acme_tx_id = page.transactions[0].id;
    assert!(matches!(
        h.core.get_transaction("globex", acme_tx_id),
        Err(Error::NotFound(_))
    ));

    let db = h.core.db();
    // Pattern store
    assert!(db.list_patterns("globex", None, None, true).unwrap().is_empty());
    assert!(db.match_description("globex", "EVERMINER PAYOUT 001").unwrap().is_empty());
    // Corrections
    assert!(db.list_corrections("globex", 10).unwrap().is_empty());
    assert_eq!(db.count_corrections_to("globex", "entity_code", "DMP").unwrap(), 0);
    // Suggestions
    assert!(db
        .list_suggestions("globex", None, 10)
        .unwrap()
        .is_empty());
    // Similarity index
    assert!(db.find_similar("globex", "EVERMINER PAYOUT", 10).unwrap().is_empty());
    // Raw files and jobs
    assert!(db.get_raw_file("globex", file_a.id).unwrap().is_none() || file_a.id == file_b.id);
    assert!(db
        .list_raw_files("globex", 10)
        .unwrap()
        .iter()
        .all(|f| f.tenant_id == "globex"));
}

// =============================================================================
// Property 5: user edits survive automated overwrites
// =============================================================================

#[tokio::test]
async fn test_user_edit_protection_via_api() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    let (_file, _) = ingest(&h.core, "acme", "two.csv", TWO_ROW_CSV.as_bytes()).await;
    let page = h
        .core
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    let tx_id = page.transactions[0].id;

    h.core
        .update_classification(
            "acme",
            tx_id,
            ClassificationPatch {
                entity_code: Some("HLD".to_string()),
                accounting_category: Some("Expenses".to_string()),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .unwrap();

    // An automated reclassification attempt is refused with no state change
    let auto = glean_core::models::Classification {
        entity_code: Some("DMP".to_string()),
        business_line_code: None,
        accounting_category: "Revenue".to_string(),
        subcategory: String::new(),
        justification: String::new(),
        confidence: 0.9,
        source: ClassificationSource::Llm,
    };
    let err = h
        .core
        .db()
        .update_classification("acme", tx_id, &auto, false)
        .unwrap_err();
    assert!(matches!(err, Error::UserEditRejected(_)));

    let tx = h.core.get_transaction("acme", tx_id).unwrap();
    assert_eq!(tx.classification_source, ClassificationSource::User);
    assert_eq!(tx.entity_code.as_deref(), Some("HLD"));
    assert_eq!(tx.confidence, 1.0);

    // Re-ingesting the same file cannot touch the row either
    let again = h.core.submit_raw_file("acme", "two.csv", TWO_ROW_CSV.as_bytes()).unwrap();
    let job = h.core.start_ingest("acme", again.id).unwrap();
    let progress = h.core.wait_for_job("acme", job).await.unwrap();
    assert_eq!(progress.rows_duplicate, 2);
    let tx = h.core.get_transaction("acme", tx_id).unwrap();
    assert_eq!(tx.classification_source, ClassificationSource::User);
}

// =============================================================================
// Property 6: two-pass validation terminates within two validation calls
// =============================================================================

#[tokio::test]
async fn test_two_pass_validation_terminates() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    // Descriptions engineered so the learned body also appears in an
    // unrelated transaction, forcing a Pass-1 rejection; with no recurrence
    // and low conviction, Pass 2 never runs.
    let csv = "Date,Description,Amount,Currency\n\
        2024-01-10,ACME FEE ALPHA,-10.00,USD\n\
        2024-02-20,ACME FEE BETA,-20.00,USD\n\
        2024-03-05,ACME FEE GAMMA,-990.00,USD\n\
        2024-03-06,ACME FEE UNRELATED SERVICE,-55.00,USD\n";
    ingest(&h.core, "acme", "fees.csv", csv.as_bytes()).await;

    let page = h
        .core
        .list_transactions(
            "acme",
            &TransactionFilter {
                search: Some("ACME FEE".to_string()),
                ..Default::default()
            },
            10,
            0,
        )
        .unwrap();

    let mut final_outcome = None;
    for tx in page
        .transactions
        .iter()
        .filter(|t| !t.description.contains("UNRELATED"))
    {
        let outcome = h
            .core
            .update_classification(
                "acme",
                tx.id,
                ClassificationPatch {
                    entity_code: Some("HLD".to_string()),
                    ..Default::default()
                },
                "user-1",
            )
            .await
            .unwrap();
        final_outcome = Some(outcome);
    }

    let outcome = final_outcome.unwrap();
    let (suggestion_id, status) = outcome.suggestion.expect("suggestion expected");
    // Terminal state reached
    assert!(status.is_terminal());
    assert_eq!(status, SuggestionStatus::Rejected);
    assert!(outcome.pattern_id.is_none());
    // At most two validation calls ever happen for one suggestion
    assert!(h.mock.validate_calls() <= 2);

    let suggestion = h
        .core
        .db()
        .get_suggestion("acme", suggestion_id)
        .unwrap()
        .unwrap();
    assert!(suggestion.rejection_reason.is_some());

    // Rejected suggestions do not retry: another correction to the same
    // target builds nothing new
    let unrelated = page
        .transactions
        .iter()
        .find(|t| t.description.contains("UNRELATED"))
        .unwrap();
    let outcome = h
        .core
        .update_classification(
            "acme",
            unrelated.id,
            ClassificationPatch {
                entity_code: Some("HLD".to_string()),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .unwrap();
    if let Some((id, status)) = outcome.suggestion {
        assert_eq!(id, suggestion_id);
        assert_eq!(status, SuggestionStatus::Rejected);
    }
    assert!(outcome.pattern_id.is_none());
}

// =============================================================================
// Resume: committed rows are skipped
// =============================================================================

#[tokio::test]
async fn test_resume_skips_committed_rows() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    let (file_id, progress) = ingest(&h.core, "acme", "two.csv", TWO_ROW_CSV.as_bytes()).await;
    assert_eq!(progress.rows_accepted, 2);

    let job = h.core.resume_ingest("acme", file_id).unwrap();
    let resumed = h.core.wait_for_job("acme", job).await.unwrap();
    assert_eq!(resumed.state, JobState::Completed);
    // Everything was already committed; nothing re-processed
    assert_eq!(resumed.rows_accepted, 0);
    assert_eq!(resumed.rows_duplicate, 0);

    let page = h
        .core
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    assert_eq!(page.total, 2);
}

// =============================================================================
// Reject-ratio: a mostly-broken file fails as a whole
// =============================================================================

#[tokio::test]
async fn test_reject_ratio_fails_job() {
    let h = harness();
    seed_tenant(&h.core, "acme");

    // Header parses, but most data rows carry unparseable amounts
    let csv = "Date,Description,Amount,Currency\n\
        2024-03-01,GOOD ROW,10.00,USD\n\
        2024-03-02,BAD ROW,not-a-number,USD\n\
        2024-03-03,BAD ROW 2,also-bad,USD\n";

    // The analyzer's dry run would reject this plan outright; bypass it by
    // warming the plan cache from a clean sibling export, as a re-upload of
    // the same format would
    let clean = "Date,Description,Amount,Currency\n2024-03-01,GOOD ROW,10.00,USD\n";
    ingest(&h.core, "acme", "clean.csv", clean.as_bytes()).await;

    let (file_id, progress) = ingest(&h.core, "acme", "broken.csv", csv.as_bytes()).await;
    assert_eq!(progress.state, JobState::Failed);
    assert!(progress.error.is_some());

    let file = h.core.db().get_raw_file("acme", file_id).unwrap().unwrap();
    assert_eq!(file.status, glean_core::models::RawFileStatus::Failed);

    // Diagnostics carry the per-row reasons
    let rejected = h.core.rejected_rows("acme", progress.job_id).unwrap();
    assert_eq!(rejected.len(), 2);
    assert!(rejected.iter().all(|r| r.reason.contains("amount")));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_unknown_job_is_not_found() {
    let h = harness();
    seed_tenant(&h.core, "acme");
    assert!(matches!(
        h.core.cancel_job("acme", 424242),
        Err(Error::NotFound(_))
    ));
}
