//! Transaction query, correction, and pattern commands

use anyhow::Result;

use glean_core::db::TransactionFilter;
use glean_core::models::PatternKind;
use glean_core::{ClassificationPatch, Database, GleanCore};

pub fn cmd_transactions_list(
    core: &GleanCore,
    tenant: &str,
    limit: i64,
    needs_review: bool,
    search: Option<&str>,
) -> Result<()> {
    let filter = TransactionFilter {
        needs_review: if needs_review { Some(true) } else { None },
        search: search.map(|s| s.to_string()),
        ..Default::default()
    };
    let page = core.list_transactions(tenant, &filter, limit, 0)?;

    if page.transactions.is_empty() {
        println!("No transactions");
        return Ok(());
    }

    println!(
        "{:<6} {:<12} {:<40} {:>14} {:<5} {:<8} {:<14} {}",
        "ID", "DATE", "DESCRIPTION", "AMOUNT", "CCY", "ENTITY", "SOURCE", "REVIEW"
    );
    for t in &page.transactions {
        let desc = ellipsize(&t.description, 38);
        println!(
            "{:<6} {:<12} {:<40} {:>14} {:<5} {:<8} {:<14} {}",
            t.id,
            t.posted_date,
            desc,
            t.amount,
            t.currency,
            t.entity_code.as_deref().unwrap_or("-"),
            t.classification_source.as_str(),
            if t.needs_review { "yes" } else { "" }
        );
    }
    println!("{} of {} shown", page.transactions.len(), page.total);
    Ok(())
}

pub fn cmd_transactions_show(core: &GleanCore, tenant: &str, transaction_id: i64) -> Result<()> {
    let t = core.get_transaction(tenant, transaction_id)?;
    println!("Transaction {}", t.id);
    println!("  date:          {}", t.posted_date);
    println!("  description:   {}", t.description);
    println!("  amount:        {} {}", t.amount, t.currency);
    if let Some(ref acct) = t.account_identifier {
        println!("  account:       {}", acct);
    }
    if let Some(ref origin) = t.origin {
        println!(
            "  origin:        {}{}",
            origin,
            t.origin_display
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );
    }
    if let Some(ref destination) = t.destination {
        println!(
            "  destination:   {}{}",
            destination,
            t.destination_display
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );
    }
    if let Some(ref reference) = t.reference {
        println!("  reference:     {}", reference);
    }
    println!(
        "  classification: {} / {} / {}",
        t.entity_code.as_deref().unwrap_or("-"),
        t.accounting_category.as_deref().unwrap_or("-"),
        t.subcategory.as_deref().unwrap_or("-")
    );
    println!(
        "  source:        {} (confidence {:.2}{})",
        t.classification_source.as_str(),
        t.confidence,
        if t.needs_review { ", needs review" } else { "" }
    );
    if let Some(ref j) = t.justification {
        if !j.is_empty() {
            println!("  justification: {}", j);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn cmd_correct(
    core: &GleanCore,
    tenant: &str,
    transaction_id: i64,
    entity: Option<String>,
    line: Option<String>,
    category: Option<String>,
    subcategory: Option<String>,
    justification: Option<String>,
    user: &str,
) -> Result<()> {
    let patch = ClassificationPatch {
        entity_code: entity,
        business_line_code: line,
        accounting_category: category,
        subcategory,
        justification,
        reason: None,
    };
    let outcome = core
        .update_classification(tenant, transaction_id, patch, user)
        .await?;

    println!("Correction recorded for transaction {}", transaction_id);
    match outcome.suggestion {
        Some((id, status)) => {
            println!("Pattern suggestion {}: {}", id, status);
            if let Some(pattern_id) = outcome.pattern_id {
                println!("Promoted to live pattern {}", pattern_id);
            }
        }
        None => println!("No pattern suggestion yet (below the correction threshold)"),
    }
    Ok(())
}

pub fn cmd_patterns_list(
    core: &GleanCore,
    tenant: &str,
    kind: Option<&str>,
    entity: Option<&str>,
) -> Result<()> {
    let kind = match kind {
        Some(k) => Some(k.parse::<PatternKind>().map_err(|e| anyhow::anyhow!(e))?),
        None => None,
    };
    let patterns = core.list_patterns(tenant, kind, entity)?;
    if patterns.is_empty() {
        println!("No patterns");
        return Ok(());
    }

    println!(
        "{:<6} {:<18} {:<34} {:<8} {:<12} {:>6} {:>6}",
        "ID", "KIND", "BODY", "ENTITY", "CATEGORY", "CONF", "HITS"
    );
    for p in patterns {
        let body = ellipsize(&p.body, 32);
        println!(
            "{:<6} {:<18} {:<34} {:<8} {:<12} {:>6.2} {:>6}",
            p.id,
            p.kind.as_str(),
            body,
            p.entity_code.as_deref().unwrap_or("-"),
            p.category.as_deref().unwrap_or("-"),
            p.confidence,
            p.occurrence_count
        );
    }
    Ok(())
}

pub fn cmd_patterns_deactivate(
    core: &GleanCore,
    tenant: &str,
    pattern_id: i64,
    user: &str,
) -> Result<()> {
    core.deactivate_pattern(tenant, pattern_id, user)?;
    println!("Deactivated pattern {}", pattern_id);
    Ok(())
}

pub fn cmd_suggestions(db: &Database, tenant: &str, status: Option<&str>) -> Result<()> {
    let status = match status {
        Some(s) => Some(
            s.parse::<glean_core::models::SuggestionStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
        ),
        None => None,
    };
    let suggestions = db.list_suggestions(tenant, status, 50)?;
    if suggestions.is_empty() {
        println!("No suggestions");
        return Ok(());
    }

    println!(
        "{:<6} {:<20} {:<30} {:<8} {:<10} {}",
        "ID", "STATUS", "BODY", "ENTITY", "FREQ", "REASON"
    );
    for s in suggestions {
        let body = ellipsize(&s.body, 28);
        println!(
            "{:<6} {:<20} {:<30} {:<8} {:<10} {}",
            s.id,
            s.status.as_str(),
            body,
            s.entity_code,
            s.frequency_class.map(|f| f.as_str()).unwrap_or("-"),
            s.rejection_reason.unwrap_or_default()
        );
    }
    Ok(())
}

/// Shorten a display string to `max` characters on a char boundary
fn ellipsize(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub fn cmd_status(db: &Database, tenant: &str) -> Result<()> {
    let tenant_row = db
        .get_tenant(tenant)?
        .ok_or_else(|| anyhow::anyhow!("unknown tenant {}", tenant))?;

    println!("Tenant {} ({})", tenant_row.id, tenant_row.display_name);
    println!("  entities:     {}", db.list_entity_codes(tenant)?.len());
    println!("  categories:   {}", db.list_categories(tenant)?.len());
    println!("  accounts:     {}", db.list_accounts(tenant, false)?.len());
    println!("  transactions: {}", db.count_transactions(tenant)?);
    println!(
        "  patterns:     {}",
        db.list_patterns(tenant, None, None, false)?.len()
    );
    println!("  raw files:    {}", db.list_raw_files(tenant, 1000)?.len());
    if !db.has_seeded_chart(tenant)? {
        println!("  NOTE: chart not seeded; classifier emits only default output");
    }
    Ok(())
}
