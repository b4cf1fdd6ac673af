//! Database layer tests

use super::*;
use crate::db::transactions::UpsertOutcome;
use crate::error::Error;
use crate::models::{
    AccountKind, CanonicalRow, Classification, ClassificationSource, EntitySignature, NewPattern,
    PatternKind, PatternSource, SuggestionStatus,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

fn db_with_tenants() -> Database {
    let db = Database::in_memory().unwrap();
    for (id, name) in [("acme", "Acme Corp"), ("globex", "Globex Inc")] {
        db.create_tenant(id, name, None, "USD", None).unwrap();
        db.create_legal_entity(id, "OPS", "Operations", None, None, "USD")
            .unwrap();
        db.create_business_line(id, "OPS", "MAIN", "Main", true, None)
            .unwrap();
        db.add_category(id, "Revenue").unwrap();
        // Transactions in these tests reference raw file id 1
        db.register_raw_file(id, "seed.csv", "blobref", &format!("hash-{}", id), 1)
            .unwrap();
    }
    db
}

fn canonical(tenant: &str, description: &str, amount: &str, day: u32) -> CanonicalRow {
    let amount = Decimal::from_str(amount).unwrap();
    let date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
    let content_hash = CanonicalRow::compute_content_hash(
        tenant, &date, description, &amount, "USD", None, None,
    );
    CanonicalRow {
        tenant_id: tenant.to_string(),
        raw_file_id: 1,
        row_index_in_file: day as i64,
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

fn substring_pattern(body: &str, entity: &str, confidence: f64) -> NewPattern {
    NewPattern {
        kind: PatternKind::Substring,
        body: body.to_string(),
        signature: None,
        entity_code: Some(entity.to_string()),
        business_line_code: None,
        category: Some("Revenue".to_string()),
        subcategory: None,
        confidence,
        source: PatternSource::UserCorrection,
    }
}

// =============================================================================
// Tenant and chart
// =============================================================================

#[test]
fn test_tenant_settings_default_and_update() {
    let db = db_with_tenants();
    let defaults = db.tenant_settings("acme").unwrap();
    assert_eq!(defaults.match_threshold, 0.80);

    let mut custom = defaults.clone();
    custom.match_threshold = 0.7;
    db.update_tenant_settings("acme", &custom).unwrap();
    assert_eq!(db.tenant_settings("acme").unwrap().match_threshold, 0.7);
    // Other tenants keep their defaults
    assert_eq!(db.tenant_settings("globex").unwrap().match_threshold, 0.80);
}

#[test]
fn test_settings_for_unknown_tenant_fail() {
    let db = db_with_tenants();
    assert!(matches!(
        db.tenant_settings("ghost"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_chart_seeding() {
    let db = Database::in_memory().unwrap();
    db.create_tenant("t", "T", None, "USD", None).unwrap();
    assert!(!db.has_seeded_chart("t").unwrap());

    db.create_legal_entity("t", "X", "X Co", None, None, "EUR").unwrap();
    assert!(!db.has_seeded_chart("t").unwrap());

    db.create_business_line("t", "X", "DEF", "Default", true, None).unwrap();
    assert!(db.has_seeded_chart("t").unwrap());
    assert_eq!(db.default_business_line("t", "X").unwrap().as_deref(), Some("DEF"));
    assert_eq!(db.default_base_currency("t").unwrap().as_deref(), Some("EUR"));
}

// =============================================================================
// Accounts
// =============================================================================

#[test]
fn test_account_lookup_case_insensitive() {
    let db = db_with_tenants();
    db.create_account(
        "acme",
        AccountKind::Wallet,
        "0xAbCdEf",
        Some("Treasury"),
        "OPS",
        None,
        None,
        None,
        None,
    )
    .unwrap();

    let hit = db.find_account("acme", "0XABCDEF").unwrap().unwrap();
    assert_eq!(hit.display_name.as_deref(), Some("Treasury"));

    // Another tenant never sees it
    assert!(db.find_account("globex", "0xabcdef").unwrap().is_none());
}

#[test]
fn test_deactivated_account_not_matched() {
    let db = db_with_tenants();
    let id = db
        .create_account("acme", AccountKind::Bank, "****1234", None, "OPS", None, None, None, None)
        .unwrap();
    assert!(db.find_account("acme", "****1234").unwrap().is_some());

    db.deactivate_account("acme", id).unwrap();
    assert!(db.find_account("acme", "****1234").unwrap().is_none());
}

// =============================================================================
// Raw files and plan cache
// =============================================================================

#[test]
fn test_raw_file_whole_file_dedupe() {
    let db = db_with_tenants();
    let a = db.register_raw_file("acme", "jan.csv", "ref1", "hash1", 100).unwrap();
    let b = db.register_raw_file("acme", "jan-again.csv", "ref1", "hash1", 100).unwrap();
    assert_eq!(a.id, b.id);

    // Same bytes under another tenant are a distinct upload
    let c = db.register_raw_file("globex", "jan.csv", "ref1", "hash1", 100).unwrap();
    assert_ne!(a.id, c.id);
    assert!(db.get_raw_file("globex", a.id).unwrap().is_none());
}

#[test]
fn test_plan_cache_tenant_scoped() {
    let db = db_with_tenants();
    let plan: crate::plan::ParsePlan = serde_json::from_str(
        r#"{"header_row_index": 0,
            "column_mapping": {"date": "D", "description": "X", "amount": "A"},
            "date_formats": ["%Y-%m-%d"]}"#,
    )
    .unwrap();

    db.cache_plan("acme", "hh1", &plan).unwrap();
    assert!(db.get_cached_plan("acme", "hh1").unwrap().is_some());
    assert!(db.get_cached_plan("globex", "hh1").unwrap().is_none());
}

// =============================================================================
// Pattern store
// =============================================================================

#[test]
fn test_upsert_pattern_idempotent_on_normalized_body() {
    let db = db_with_tenants();
    let first = db
        .upsert_pattern("acme", &substring_pattern("everminer  payout", "OPS", 0.8))
        .unwrap();
    // Different case and spacing, same normalized body
    let second = db
        .upsert_pattern("acme", &substring_pattern("EVERMINER PAYOUT", "OPS", 0.9))
        .unwrap();
    assert_eq!(first, second);

    let patterns = db.list_patterns("acme", None, None, false).unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].confidence, 0.9);
}

#[test]
fn test_match_description_ordering() {
    let db = db_with_tenants();
    db.upsert_pattern("acme", &substring_pattern("EVERMINER", "OPS", 0.85)).unwrap();
    let strong = db
        .upsert_pattern("acme", &substring_pattern("EVERMINER PAYOUT", "OPS", 0.95))
        .unwrap();

    let matches = db.match_description("acme", "EVERMINER PAYOUT JUNE").unwrap();
    assert_eq!(matches.len(), 2);
    // Confidence descending
    assert_eq!(matches[0].pattern_id, strong);
    assert!(matches[0].confidence > matches[1].confidence);
}

#[test]
fn test_match_description_kinds() {
    let db = db_with_tenants();
    db.upsert_pattern(
        "acme",
        &NewPattern {
            kind: PatternKind::TokenBag,
            body: "wire everminer".to_string(),
            ..substring_pattern("", "OPS", 0.9)
        },
    )
    .unwrap();
    db.upsert_pattern(
        "acme",
        &NewPattern {
            kind: PatternKind::Regex,
            body: r"INV-\d{4}".to_string(),
            ..substring_pattern("", "OPS", 0.88)
        },
    )
    .unwrap();

    // Token bag: order-independent
    assert_eq!(db.match_description("acme", "EVERMINER inbound WIRE").unwrap().len(), 1);
    // Regex, case-insensitive
    assert_eq!(db.match_description("acme", "payment inv-2024 ref").unwrap().len(), 1);
    assert!(db.match_description("acme", "nothing relevant").unwrap().is_empty());
}

#[test]
fn test_match_description_is_tenant_scoped() {
    let db = db_with_tenants();
    db.upsert_pattern("acme", &substring_pattern("EVERMINER", "OPS", 0.9)).unwrap();
    assert!(db.match_description("globex", "EVERMINER PAYOUT").unwrap().is_empty());
}

#[test]
fn test_match_account_pattern() {
    let db = db_with_tenants();
    db.upsert_pattern(
        "acme",
        &NewPattern {
            kind: PatternKind::AccountMap,
            body: "0xDEADBEEF".to_string(),
            ..substring_pattern("", "OPS", 1.0)
        },
    )
    .unwrap();

    assert!(db.match_account_pattern("acme", "0xdeadbeef").unwrap().is_some());
    assert!(db.match_account_pattern("acme", "0xother").unwrap().is_none());
    assert!(db.match_account_pattern("globex", "0xdeadbeef").unwrap().is_none());
}

#[test]
fn test_entity_signature_scoring_weights_and_cap() {
    let db = db_with_tenants();
    db.upsert_pattern(
        "acme",
        &NewPattern {
            kind: PatternKind::EntitySignature,
            body: "sig:everminer".to_string(),
            signature: Some(EntitySignature {
                company_names: vec!["Everminer LLC".to_string()],
                keywords: vec!["PAYOUT".to_string(), "MINING".to_string()],
                bank_identifiers: vec!["ACH".to_string()],
                ..Default::default()
            }),
            ..substring_pattern("", "OPS", 0.8)
        },
    )
    .unwrap();

    // company name (2) + PAYOUT (1) + ACH (1) = 4
    let scores = db
        .match_entity_signature("acme", "ACH CREDIT Everminer LLC PAYOUT", 6)
        .unwrap();
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].total_weight, 4);
    assert_eq!(scores[0].match_count, 3);

    // Cap applies
    let capped = db
        .match_entity_signature("acme", "ACH CREDIT Everminer LLC PAYOUT MINING", 3)
        .unwrap();
    assert_eq!(capped[0].total_weight, 3);
}

#[test]
fn test_record_occurrence_and_deactivate() {
    let db = db_with_tenants();
    let id = db.upsert_pattern("acme", &substring_pattern("EVERMINER", "OPS", 0.9)).unwrap();

    db.record_occurrence("acme", id).unwrap();
    db.record_occurrence("acme", id).unwrap();
    let p = db.get_pattern("acme", id).unwrap().unwrap();
    assert_eq!(p.occurrence_count, 2);
    assert!(p.last_seen_at.is_some());

    db.deactivate_pattern("acme", id).unwrap();
    assert!(db.match_description("acme", "EVERMINER PAYOUT").unwrap().is_empty());
    // Soft: the row is retained
    assert!(db.get_pattern("acme", id).unwrap().is_some());
}

#[test]
fn test_deactivate_foreign_pattern_fails() {
    let db = db_with_tenants();
    let id = db.upsert_pattern("acme", &substring_pattern("EVERMINER", "OPS", 0.9)).unwrap();
    assert!(matches!(
        db.deactivate_pattern("globex", id),
        Err(Error::NotFound(_))
    ));
}

// =============================================================================
// Transaction store
// =============================================================================

#[test]
fn test_upsert_row_idempotent() {
    let db = db_with_tenants();
    let row = canonical("acme", "NETFLIX.COM", "-15.99", 1);
    let cls = Classification::unclassified();

    let first = db.upsert_row("acme", &row, &cls, true, None, None).unwrap();
    let id = match first {
        UpsertOutcome::Inserted(id) => id,
        UpsertOutcome::Duplicate(_) => panic!("first insert marked duplicate"),
    };

    let second = db.upsert_row("acme", &row, &cls, true, None, None).unwrap();
    assert!(matches!(second, UpsertOutcome::Duplicate(existing) if existing == id));
    assert_eq!(db.count_transactions("acme").unwrap(), 1);
}

#[test]
fn test_same_row_different_tenants_both_insert() {
    let db = db_with_tenants();
    let cls = Classification::unclassified();
    db.upsert_row("acme", &canonical("acme", "WIRE IN", "100", 2), &cls, true, None, None)
        .unwrap();
    db.upsert_row("globex", &canonical("globex", "WIRE IN", "100", 2), &cls, true, None, None)
        .unwrap();

    assert_eq!(db.count_transactions("acme").unwrap(), 1);
    assert_eq!(db.count_transactions("globex").unwrap(), 1);

    // Cross-tenant reads see nothing
    let page = db
        .list_transactions("acme", &TransactionFilter::default(), 10, 0)
        .unwrap();
    assert!(page.transactions.iter().all(|t| t.tenant_id == "acme"));
}

#[test]
fn test_user_edit_protection() {
    let db = db_with_tenants();
    let row = canonical("acme", "EVERMINER PAYOUT", "150", 3);
    let outcome = db
        .upsert_row("acme", &row, &Classification::unclassified(), true, None, None)
        .unwrap();
    let id = match outcome {
        UpsertOutcome::Inserted(id) => id,
        _ => unreachable!(),
    };

    let user_cls = Classification {
        entity_code: Some("OPS".to_string()),
        business_line_code: Some("MAIN".to_string()),
        accounting_category: "Revenue".to_string(),
        subcategory: String::new(),
        justification: "user says so".to_string(),
        confidence: 1.0,
        source: ClassificationSource::User,
    };
    db.update_classification("acme", id, &user_cls, false).unwrap();

    // Automated overwrite refused, no state change
    let auto_cls = Classification {
        source: ClassificationSource::Llm,
        ..Classification::unclassified()
    };
    let err = db.update_classification("acme", id, &auto_cls, true).unwrap_err();
    assert!(matches!(err, Error::UserEditRejected(_)));

    let tx = db.get_transaction("acme", id).unwrap().unwrap();
    assert_eq!(tx.classification_source, ClassificationSource::User);
    assert_eq!(tx.entity_code.as_deref(), Some("OPS"));

    // A later user edit is allowed
    db.update_classification("acme", id, &user_cls, false).unwrap();
}

#[test]
fn test_bulk_update_skips_user_rows() {
    let db = db_with_tenants();
    let cls = Classification::unclassified();
    let mut ids = Vec::new();
    for day in 1..=3 {
        let row = canonical("acme", &format!("EVERMINER PAYOUT {}", day), "100", day);
        if let UpsertOutcome::Inserted(id) =
            db.upsert_row("acme", &row, &cls, true, None, None).unwrap()
        {
            ids.push(id);
        }
    }

    let user_cls = Classification {
        entity_code: Some("OPS".to_string()),
        source: ClassificationSource::User,
        confidence: 1.0,
        ..Classification::unclassified()
    };
    db.update_classification("acme", ids[0], &user_cls, false).unwrap();

    let auto_cls = Classification {
        entity_code: Some("OPS".to_string()),
        accounting_category: "Revenue".to_string(),
        source: ClassificationSource::TenantPattern,
        confidence: 0.9,
        ..Classification::unclassified()
    };
    let (updated, skipped) = db
        .bulk_update_classification("acme", &TransactionFilter::default(), &auto_cls, false)
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(skipped, 1);
}

#[test]
fn test_find_similar_ranks_by_overlap() {
    let db = db_with_tenants();
    let cls = Classification::unclassified();
    for (day, desc) in [
        (1, "EVERMINER MONTHLY PAYOUT"),
        (2, "EVERMINER PAYOUT"),
        (3, "OFFICE RENT MARCH"),
    ] {
        db.upsert_row("acme", &canonical("acme", desc, "10", day), &cls, true, None, None)
            .unwrap();
    }

    let similar = db.find_similar("acme", "EVERMINER PAYOUT JULY", 10).unwrap();
    assert!(similar.len() >= 2);
    assert!(similar[0].0.description.contains("EVERMINER"));
    assert!(similar[0].1 > 0.0);
    // The rent row shares no tokens and is absent
    assert!(similar.iter().all(|(t, _)| !t.description.contains("RENT")));

    // Tenant scoping
    assert!(db.find_similar("globex", "EVERMINER PAYOUT", 10).unwrap().is_empty());
}

#[test]
fn test_list_transactions_filters() {
    let db = db_with_tenants();
    let cls_ops = Classification {
        entity_code: Some("OPS".to_string()),
        accounting_category: "Revenue".to_string(),
        source: ClassificationSource::TenantPattern,
        confidence: 0.9,
        ..Classification::unclassified()
    };
    db.upsert_row("acme", &canonical("acme", "EVERMINER PAYOUT", "10", 1), &cls_ops, false, None, None)
        .unwrap();
    db.upsert_row(
        "acme",
        &canonical("acme", "MYSTERY CHARGE", "-5", 2),
        &Classification::unclassified(),
        true,
        None,
        None,
    )
    .unwrap();

    let review = db
        .list_transactions(
            "acme",
            &TransactionFilter {
                needs_review: Some(true),
                ..Default::default()
            },
            10,
            0,
        )
        .unwrap();
    assert_eq!(review.total, 1);
    assert_eq!(review.transactions[0].description, "MYSTERY CHARGE");

    let search = db
        .list_transactions(
            "acme",
            &TransactionFilter {
                search: Some("everminer".to_string()),
                ..Default::default()
            },
            10,
            0,
        )
        .unwrap();
    assert_eq!(search.total, 1);

    let by_entity = db
        .list_transactions(
            "acme",
            &TransactionFilter {
                entity_code: Some("OPS".to_string()),
                ..Default::default()
            },
            10,
            0,
        )
        .unwrap();
    assert_eq!(by_entity.total, 1);
}

#[test]
fn test_existing_content_hashes_batch() {
    let db = db_with_tenants();
    let cls = Classification::unclassified();
    let row1 = canonical("acme", "A", "1", 1);
    let row2 = canonical("acme", "B", "2", 2);
    db.upsert_row("acme", &row1, &cls, true, None, None).unwrap();

    let hashes = vec![row1.content_hash.clone(), row2.content_hash.clone()];
    let existing = db.existing_content_hashes("acme", &hashes).unwrap();
    assert!(existing.contains(&row1.content_hash));
    assert!(!existing.contains(&row2.content_hash));

    // Scoped by tenant
    assert!(db.existing_content_hashes("globex", &hashes).unwrap().is_empty());
}

// =============================================================================
// Corrections and suggestions
// =============================================================================

#[test]
fn test_corrections_are_tenant_scoped() {
    let db = db_with_tenants();
    let cls = Classification::unclassified();
    let id = match db
        .upsert_row("acme", &canonical("acme", "X", "1", 1), &cls, true, None, None)
        .unwrap()
    {
        UpsertOutcome::Inserted(id) => id,
        _ => unreachable!(),
    };

    db.record_correction("acme", id, "entity_code", None, Some("OPS"), "user-1", None)
        .unwrap();

    assert_eq!(db.count_corrections_to("acme", "entity_code", "OPS").unwrap(), 1);
    assert_eq!(db.count_corrections_to("globex", "entity_code", "OPS").unwrap(), 0);
    assert_eq!(db.list_corrections("globex", 10).unwrap().len(), 0);
}

#[test]
fn test_suggestion_lifecycle() {
    let db = db_with_tenants();
    let id = db
        .create_suggestion("acme", PatternKind::TokenBag, "EVERMINER", None, "OPS", Some("Revenue"), None, 3)
        .unwrap();

    let s = db.get_suggestion("acme", id).unwrap().unwrap();
    assert_eq!(s.status, SuggestionStatus::Pending);

    db.update_suggestion_status("acme", id, SuggestionStatus::Rejected, Some("too broad"))
        .unwrap();
    let s = db.get_suggestion("acme", id).unwrap().unwrap();
    assert_eq!(s.status, SuggestionStatus::Rejected);
    assert_eq!(s.rejection_reason.as_deref(), Some("too broad"));

    // Rejected suggestion is findable by body, suppressing re-creation
    let found = db
        .find_suggestion_by_body("acme", PatternKind::TokenBag, "EVERMINER")
        .unwrap();
    assert!(found.is_some());
    // Other tenant sees nothing
    assert!(db.get_suggestion("globex", id).unwrap().is_none());
}

// =============================================================================
// Jobs
// =============================================================================

#[test]
fn test_job_progress_and_resume_watermark() {
    let db = db_with_tenants();
    let file = db.register_raw_file("acme", "f.csv", "ref", "h", 10).unwrap();
    let job = db.create_ingest_job("acme", file.id).unwrap();

    db.commit_job_progress("acme", job, 100, 50, 40, 5, 5, 49).unwrap();
    // The watermark never goes backwards
    db.commit_job_progress("acme", job, 100, 60, 50, 5, 5, 30).unwrap();

    let record = db.get_ingest_job("acme", job).unwrap().unwrap();
    assert_eq!(record.last_committed_row, 49);
    assert_eq!(record.rows_processed, 60);

    assert!(db.get_ingest_job("globex", job).unwrap().is_none());
    assert_eq!(db.latest_job_for_file("acme", file.id).unwrap().unwrap().id, job);
}

#[test]
fn test_rejected_rows_recorded() {
    let db = db_with_tenants();
    let file = db.register_raw_file("acme", "f.csv", "ref", "h", 10).unwrap();
    let job = db.create_ingest_job("acme", file.id).unwrap();

    db.record_rejected_row("acme", job, 7, "unparseable date: foo").unwrap();
    let rows = db.list_rejected_rows("acme", job).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_index_in_file, 7);
    assert!(db.list_rejected_rows("globex", job).unwrap().is_empty());
}
