//! Ingestion engine: applies a parse plan to raw bytes and produces
//! canonical rows
//!
//! The engine knows nothing about where a file came from. Skip rows, header
//! position, column projection, cleaning, and date formats all come from the
//! plan; a row that cannot satisfy the plan is rejected with a reason and a
//! source row number, never silently coerced.

use csv::ReaderBuilder;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::models::CanonicalRow;
use crate::plan::{parse_amount, parse_date, ParsePlan};
use crate::text::normalize_whitespace;

/// One source row projected through a plan, before tenant enrichment
#[derive(Debug, Clone)]
pub struct ParsedRow {
    /// Zero-based record index in the source file
    pub row_index: i64,
    pub posted_date: chrono::NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub currency: Option<String>,
    pub account_identifier: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub reference: Option<String>,
    pub transaction_type: Option<String>,
    pub network: Option<String>,
}

/// A row that failed the plan, with its source position
#[derive(Debug, Clone)]
pub struct RowFailure {
    pub row_index: i64,
    pub reason: String,
}

/// Outcome of reading a whole file through a plan
#[derive(Debug)]
pub struct ReadResult {
    pub rows: Vec<ParsedRow>,
    pub failures: Vec<RowFailure>,
}

/// Read raw bytes as a record sequence under a plan.
///
/// Rows listed in `skip_rows` and rows before the header are discarded; the
/// header row supplies column names for the plan's projection. Failures are
/// collected, not fatal.
pub fn read_rows(bytes: &[u8], plan: &ParsePlan) -> Result<ReadResult> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let skip: HashSet<usize> = plan.skip_rows.iter().copied().collect();
    let mut header: Option<HashMap<String, usize>> = None;
    let mut rows = Vec::new();
    let mut failures = Vec::new();

    for (idx, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                if idx > plan.header_row_index {
                    failures.push(RowFailure {
                        row_index: idx as i64,
                        reason: format!("malformed record: {}", e),
                    });
                }
                continue;
            }
        };

        if skip.contains(&idx) {
            continue;
        }
        if idx == plan.header_row_index {
            let mut map = HashMap::new();
            for (col, name) in record.iter().enumerate() {
                map.insert(normalize_whitespace(name).to_lowercase(), col);
            }
            header = Some(map);
            continue;
        }
        if idx < plan.header_row_index {
            // Junk above the header the plan didn't bother listing
            continue;
        }

        let header = match &header {
            Some(h) => h,
            None => {
                return Err(Error::UnparseableFormat(format!(
                    "header row {} never materialized",
                    plan.header_row_index
                )))
            }
        };

        // Skip blank padding rows rather than rejecting them
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }

        match project_row(idx as i64, &record, header, plan) {
            Ok(row) => rows.push(row),
            Err(e) => failures.push(RowFailure {
                row_index: idx as i64,
                reason: e.to_string(),
            }),
        }
    }

    if header.is_none() {
        return Err(Error::UnparseableFormat(format!(
            "file has no row at header index {}",
            plan.header_row_index
        )));
    }

    Ok(ReadResult { rows, failures })
}

/// Project one record through the plan's column mapping
fn project_row(
    row_index: i64,
    record: &csv::StringRecord,
    header: &HashMap<String, usize>,
    plan: &ParsePlan,
) -> Result<ParsedRow> {
    let cell = |field: &str| -> Option<String> {
        let col_name = plan.column_for(field)?;
        let col = header.get(&normalize_whitespace(col_name).to_lowercase())?;
        record
            .get(*col)
            .map(normalize_whitespace)
            .filter(|s| !s.is_empty())
    };

    let date_raw = cell("date")
        .ok_or_else(|| Error::RowRejected("missing date value".to_string()))?;
    let posted_date = parse_date(&date_raw, &plan.date_formats)?;

    let description = cell("description")
        .ok_or_else(|| Error::RowRejected("missing description value".to_string()))?;

    let amount_raw = cell("amount")
        .ok_or_else(|| Error::RowRejected("missing amount value".to_string()))?;
    let amount = parse_amount(&amount_raw, &plan.cleaning_rule("amount"))?;

    let account_identifier = cell("account_identifier");
    if plan.has_multiple_accounts && account_identifier.is_none() {
        return Err(Error::RowRejected(
            "multi-account file row carries no account identifier".to_string(),
        ));
    }

    Ok(ParsedRow {
        row_index,
        posted_date,
        description,
        amount,
        currency: cell("currency").map(|c| c.to_uppercase()),
        account_identifier,
        origin: cell("origin"),
        destination: cell("destination"),
        reference: cell("reference"),
        transaction_type: cell("transaction_type"),
        network: cell("network"),
    })
}

/// Lift a parsed row into a canonical row for a tenant.
///
/// The currency default comes from the tenant's base currency when the file
/// carries none; the content hash is derived from the identifying fields.
pub fn to_canonical(
    tenant_id: &str,
    raw_file_id: i64,
    row: ParsedRow,
    default_currency: &str,
) -> CanonicalRow {
    let currency = row
        .currency
        .unwrap_or_else(|| default_currency.to_uppercase());
    let content_hash = CanonicalRow::compute_content_hash(
        tenant_id,
        &row.posted_date,
        &row.description,
        &row.amount,
        &currency,
        row.account_identifier.as_deref(),
        row.reference.as_deref(),
    );
    CanonicalRow {
        tenant_id: tenant_id.to_string(),
        raw_file_id,
        row_index_in_file: row.row_index,
        posted_date: row.posted_date,
        description: row.description,
        amount: row.amount,
        currency,
        account_identifier: row.account_identifier,
        origin: row.origin,
        destination: row.destination,
        reference: row.reference,
        transaction_type: row.transaction_type,
        network: row.network,
        content_hash,
    }
}

/// Dry-run a plan against sample bytes.
///
/// Returns the per-row failures; an empty list means every sampled row
/// yielded a valid date and amount.
pub fn dry_run(sample: &[u8], plan: &ParsePlan) -> Result<Vec<RowFailure>> {
    let result = read_rows(sample, plan)?;
    Ok(result.failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn simple_plan() -> ParsePlan {
        let json = r#"{
            "skip_rows": [],
            "header_row_index": 0,
            "column_mapping": {"date": "Date", "description": "Description", "amount": "Amount", "currency": "Currency"},
            "cleaning_rules": {"amount": {"strip_currency_symbols": true, "strip_thousands_separators": true, "parentheses_negative": true, "decimal_separator": ".", "scale": 1}},
            "has_multiple_accounts": false,
            "date_formats": ["%Y-%m-%d", "%m/%d/%Y"]
        }"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_read_rows_simple() {
        let csv = "Date,Description,Amount,Currency\n2024-01-15,NETFLIX.COM,-15.99,USD\n2024-01-16,WIRE  IN,\"$1,000.00\",USD\n";
        let result = read_rows(csv.as_bytes(), &simple_plan()).unwrap();
        assert_eq!(result.rows.len(), 2);
        assert!(result.failures.is_empty());

        assert_eq!(result.rows[0].description, "NETFLIX.COM");
        assert_eq!(result.rows[0].amount, Decimal::from_str("-15.99").unwrap());
        assert_eq!(result.rows[0].row_index, 1);

        // Whitespace normalized, currency symbols stripped
        assert_eq!(result.rows[1].description, "WIRE IN");
        assert_eq!(result.rows[1].amount, Decimal::from_str("1000").unwrap());
    }

    #[test]
    fn test_read_rows_skip_and_header_offset() {
        let mut plan = simple_plan();
        plan.skip_rows = vec![0, 1, 2];
        plan.header_row_index = 3;

        let csv = "Export for account\nGenerated 2024-01-31\n,,\nDate,Description,Amount,Currency\n2024-01-15,COFFEE,-4.50,USD\n";
        let result = read_rows(csv.as_bytes(), &plan).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].description, "COFFEE");
        assert_eq!(result.rows[0].row_index, 4);
    }

    #[test]
    fn test_read_rows_bad_date_rejected_not_fatal() {
        let csv = "Date,Description,Amount,Currency\nnot-a-date,JUNK,-1.00,USD\n2024-01-15,OK,-2.00,USD\n";
        let result = read_rows(csv.as_bytes(), &simple_plan()).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].row_index, 1);
        assert!(result.failures[0].reason.contains("date"));
    }

    #[test]
    fn test_read_rows_multi_account_requires_identifier() {
        let mut plan = simple_plan();
        plan.has_multiple_accounts = true;
        plan.column_mapping
            .insert("account_identifier".to_string(), "Account".to_string());

        let csv = "Date,Description,Amount,Currency,Account\n2024-01-15,A,-1.00,USD,acct-1\n2024-01-16,B,-2.00,USD,\n";
        let result = read_rows(csv.as_bytes(), &plan).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].reason.contains("account identifier"));
    }

    #[test]
    fn test_read_rows_blank_rows_skipped() {
        let csv = "Date,Description,Amount,Currency\n2024-01-15,A,-1.00,USD\n,,,\n";
        let result = read_rows(csv.as_bytes(), &simple_plan()).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert!(result.failures.is_empty());
    }

    #[test]
    fn test_missing_header_row_is_unparseable() {
        let mut plan = simple_plan();
        plan.header_row_index = 10;
        let csv = "Date,Description,Amount\n";
        assert!(matches!(
            read_rows(csv.as_bytes(), &plan),
            Err(Error::UnparseableFormat(_))
        ));
    }

    #[test]
    fn test_to_canonical_currency_default_and_hash() {
        let mut plan = simple_plan();
        plan.column_mapping.remove("currency");
        let csv = "Date,Description,Amount\n2024-01-15,NETFLIX.COM,-15.99\n";
        let result = read_rows(csv.as_bytes(), &plan).unwrap();
        let row = to_canonical("acme", 7, result.rows[0].clone(), "usd");

        assert_eq!(row.currency, "USD");
        assert_eq!(row.raw_file_id, 7);
        assert!(!row.content_hash.is_empty());

        // Determinism: identical input yields an identical canonical row
        let again = read_rows(csv.as_bytes(), &plan).unwrap();
        let row2 = to_canonical("acme", 7, again.rows[0].clone(), "usd");
        assert_eq!(row, row2);
    }

    #[test]
    fn test_dry_run_surfaces_failures() {
        let csv = "Date,Description,Amount,Currency\n2024-01-15,A,not-money,USD\n";
        let failures = dry_run(csv.as_bytes(), &simple_plan()).unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].reason.contains("amount"));
    }
}
