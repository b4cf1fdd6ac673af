//! Parse plans: declarative descriptions of how to turn raw statement bytes
//! into canonical rows
//!
//! All parse knowledge lives in the plan produced by the format analyzer.
//! Nothing in this module or downstream of it branches on a vendor identity;
//! the plan schema is the extensibility point.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::AMOUNT_SCALE;

/// Canonical fields a source column can map to
pub const REQUIRED_FIELDS: &[&str] = &["date", "description", "amount"];
pub const OPTIONAL_FIELDS: &[&str] = &[
    "currency",
    "account_identifier",
    "origin",
    "destination",
    "reference",
    "transaction_type",
    "network",
];

/// Per-field cleaning rules applied before parsing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleaningRule {
    /// Strip currency symbols and letters glued to the number
    #[serde(default)]
    pub strip_currency_symbols: bool,
    /// Strip thousands separators
    #[serde(default)]
    pub strip_thousands_separators: bool,
    /// Treat "(123.45)" as -123.45
    #[serde(default)]
    pub parentheses_negative: bool,
    /// Decimal separator in the source data: "." or ","
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: String,
    /// Multiplier applied after parsing (e.g. statements in cents)
    #[serde(default = "default_scale")]
    pub scale: Decimal,
}

fn default_decimal_separator() -> String {
    ".".to_string()
}

fn default_scale() -> Decimal {
    Decimal::ONE
}

impl Default for CleaningRule {
    fn default() -> Self {
        Self {
            strip_currency_symbols: true,
            strip_thousands_separators: true,
            parentheses_negative: true,
            decimal_separator: default_decimal_separator(),
            scale: default_scale(),
        }
    }
}

/// Output of the format analyzer for one raw file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsePlan {
    /// Zero-based row indices to discard before the header
    #[serde(default)]
    pub skip_rows: Vec<usize>,
    /// Zero-based index of the row to treat as column names
    pub header_row_index: usize,
    /// Canonical field -> source column name
    pub column_mapping: HashMap<String, String>,
    /// Canonical field -> cleaning rules
    #[serde(default)]
    pub cleaning_rules: HashMap<String, CleaningRule>,
    /// If true, `account_identifier` must be mapped
    #[serde(default)]
    pub has_multiple_accounts: bool,
    /// Date patterns tried in order
    pub date_formats: Vec<String>,
}

impl ParsePlan {
    /// Validate the plan shape before any parsing happens.
    ///
    /// A plan that cannot name a date, description, and amount column, or
    /// that claims multiple accounts without mapping an identifier, is
    /// rejected here rather than producing half-parsed rows.
    pub fn validate(&self) -> Result<()> {
        for field in REQUIRED_FIELDS {
            match self.column_mapping.get(*field) {
                Some(col) if !col.trim().is_empty() => {}
                _ => {
                    return Err(Error::UnparseableFormat(format!(
                        "plan does not map required field '{}'",
                        field
                    )))
                }
            }
        }
        for field in self.column_mapping.keys() {
            if !REQUIRED_FIELDS.contains(&field.as_str())
                && !OPTIONAL_FIELDS.contains(&field.as_str())
            {
                return Err(Error::UnparseableFormat(format!(
                    "plan maps unknown canonical field '{}'",
                    field
                )));
            }
        }
        if self.date_formats.is_empty() {
            return Err(Error::UnparseableFormat(
                "plan has an empty date_formats list".to_string(),
            ));
        }
        if self.has_multiple_accounts && !self.column_mapping.contains_key("account_identifier") {
            return Err(Error::UnparseableFormat(
                "plan claims multiple accounts but does not map account_identifier".to_string(),
            ));
        }
        for (field, rule) in &self.cleaning_rules {
            if rule.decimal_separator != "." && rule.decimal_separator != "," {
                return Err(Error::UnparseableFormat(format!(
                    "cleaning rule for '{}' has invalid decimal separator '{}'",
                    field, rule.decimal_separator
                )));
            }
            if rule.scale <= Decimal::ZERO {
                return Err(Error::UnparseableFormat(format!(
                    "cleaning rule for '{}' has non-positive scale",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Column name mapped to a canonical field, if any
    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.column_mapping.get(field).map(|s| s.as_str())
    }

    /// Cleaning rule for a field, defaulted when the plan doesn't carry one
    pub fn cleaning_rule(&self, field: &str) -> CleaningRule {
        self.cleaning_rules.get(field).cloned().unwrap_or_default()
    }
}

/// Parse an amount string under a cleaning rule
pub fn parse_amount(raw: &str, rule: &CleaningRule) -> Result<Decimal> {
    let mut s = raw.trim().to_string();
    if s.is_empty() {
        return Err(Error::RowRejected("empty amount".to_string()));
    }

    let mut negative = false;
    if rule.parentheses_negative && s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].trim().to_string();
    }

    if rule.strip_currency_symbols {
        s = s
            .chars()
            .filter(|c| {
                c.is_ascii_digit()
                    || *c == '-'
                    || *c == '+'
                    || c.to_string() == rule.decimal_separator
                    || (rule.strip_thousands_separators
                        && (*c == ',' || *c == '.' || *c == '\'' || *c == ' '))
            })
            .collect();
    }

    if rule.strip_thousands_separators {
        let thousands = if rule.decimal_separator == "," { '.' } else { ',' };
        s = s.replace([thousands, '\'', ' '], "");
    }

    if rule.decimal_separator == "," {
        s = s.replace(',', ".");
    }

    let mut amount = Decimal::from_str(&s)
        .map_err(|_| Error::RowRejected(format!("unparseable amount: {}", raw)))?;
    amount *= rule.scale;
    if negative {
        amount = -amount;
    }
    Ok(amount.round_dp(AMOUNT_SCALE))
}

/// Parse a date by trying each configured format in order
pub fn parse_date(raw: &str, formats: &[String]) -> Result<chrono::NaiveDate> {
    let s = raw.trim();
    for fmt in formats {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(s, fmt) {
            return Ok(date);
        }
    }
    Err(Error::RowRejected(format!("unparseable date: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(mapping: &[(&str, &str)]) -> ParsePlan {
        ParsePlan {
            skip_rows: vec![],
            header_row_index: 0,
            column_mapping: mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            cleaning_rules: HashMap::new(),
            has_multiple_accounts: false,
            date_formats: vec!["%Y-%m-%d".to_string()],
        }
    }

    #[test]
    fn test_validate_requires_core_fields() {
        let plan = plan_with(&[("date", "Date"), ("description", "Desc")]);
        assert!(matches!(plan.validate(), Err(Error::UnparseableFormat(_))));

        let plan = plan_with(&[("date", "Date"), ("description", "Desc"), ("amount", "Amt")]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_field() {
        let plan = plan_with(&[
            ("date", "Date"),
            ("description", "Desc"),
            ("amount", "Amt"),
            ("vendor", "Vendor"),
        ]);
        assert!(matches!(plan.validate(), Err(Error::UnparseableFormat(_))));
    }

    #[test]
    fn test_validate_multi_account_requires_identifier() {
        let mut plan = plan_with(&[("date", "Date"), ("description", "Desc"), ("amount", "Amt")]);
        plan.has_multiple_accounts = true;
        assert!(matches!(plan.validate(), Err(Error::UnparseableFormat(_))));

        plan.column_mapping
            .insert("account_identifier".to_string(), "Account".to_string());
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_date_formats() {
        let mut plan = plan_with(&[("date", "Date"), ("description", "Desc"), ("amount", "Amt")]);
        plan.date_formats.clear();
        assert!(matches!(plan.validate(), Err(Error::UnparseableFormat(_))));
    }

    #[test]
    fn test_parse_amount_default_rule() {
        let rule = CleaningRule::default();
        assert_eq!(parse_amount("$1,234.56", &rule).unwrap(), Decimal::from_str("1234.56").unwrap());
        assert_eq!(parse_amount("-123.45", &rule).unwrap(), Decimal::from_str("-123.45").unwrap());
        assert_eq!(parse_amount("(100.00)", &rule).unwrap(), Decimal::from_str("-100").unwrap());
    }

    #[test]
    fn test_parse_amount_european() {
        let rule = CleaningRule {
            decimal_separator: ",".to_string(),
            ..CleaningRule::default()
        };
        assert_eq!(
            parse_amount("1.234,56", &rule).unwrap(),
            Decimal::from_str("1234.56").unwrap()
        );
    }

    #[test]
    fn test_parse_amount_scale() {
        let rule = CleaningRule {
            scale: Decimal::from_str("0.01").unwrap(),
            ..CleaningRule::default()
        };
        // Statement amounts in cents
        assert_eq!(parse_amount("1599", &rule).unwrap(), Decimal::from_str("15.99").unwrap());
    }

    #[test]
    fn test_parse_amount_crypto_precision() {
        let rule = CleaningRule::default();
        assert_eq!(
            parse_amount("0.00012345", &rule).unwrap(),
            Decimal::from_str("0.00012345").unwrap()
        );
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        let rule = CleaningRule::default();
        assert!(matches!(
            parse_amount("N/A", &rule),
            Err(Error::RowRejected(_))
        ));
        assert!(matches!(parse_amount("", &rule), Err(Error::RowRejected(_))));
    }

    #[test]
    fn test_parse_date_format_order() {
        let formats = vec!["%m/%d/%Y".to_string(), "%Y-%m-%d".to_string()];
        assert_eq!(
            parse_date("01/15/2024", &formats).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
        assert_eq!(
            parse_date("2024-01-15", &formats).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
        assert!(parse_date("15th Jan", &formats).is_err());
    }

    #[test]
    fn test_plan_json_roundtrip() {
        let json = r#"{
            "skip_rows": [0, 1, 2],
            "header_row_index": 3,
            "column_mapping": {"date": "Fecha", "description": "Concepto", "amount": "Importe"},
            "cleaning_rules": {"amount": {"decimal_separator": ",", "strip_thousands_separators": true}},
            "has_multiple_accounts": false,
            "date_formats": ["%d/%m/%Y"]
        }"#;
        let plan: ParsePlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.skip_rows, vec![0, 1, 2]);
        assert_eq!(plan.header_row_index, 3);
        assert_eq!(plan.column_for("amount"), Some("Importe"));
        assert_eq!(plan.cleaning_rule("amount").decimal_separator, ",");
        plan.validate().unwrap();
    }
}
