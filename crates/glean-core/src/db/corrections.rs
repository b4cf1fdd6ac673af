//! Correction log and pattern suggestion operations

use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{
    Correction, EntitySignature, FrequencyClass, PatternKind, PatternSuggestion, SuggestionStatus,
};

impl Database {
    /// Append a correction row. Corrections are never deleted.
    #[allow(clippy::too_many_arguments)]
    pub fn record_correction(
        &self,
        tenant_id: &str,
        transaction_id: i64,
        field: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
        user_id: &str,
        reason: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO corrections (tenant_id, transaction_id, field, old_value, new_value, user_id, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![tenant_id, transaction_id, field, old_value, new_value, user_id, reason],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List corrections for a tenant, newest first
    pub fn list_corrections(&self, tenant_id: &str, limit: i64) -> Result<Vec<Correction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tenant_id, transaction_id, field, old_value, new_value, user_id, reason, created_at
            FROM corrections WHERE tenant_id = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )?;
        let corrections = stmt
            .query_map(params![tenant_id, limit], Self::row_to_correction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(corrections)
    }

    /// How many corrections in the tenant's recent history set this field to
    /// this value
    pub fn count_corrections_to(
        &self,
        tenant_id: &str,
        field: &str,
        new_value: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM corrections WHERE tenant_id = ? AND field = ? AND new_value = ?",
            params![tenant_id, field, new_value],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Corrections that set this field to this value, newest first
    pub fn corrections_to(
        &self,
        tenant_id: &str,
        field: &str,
        new_value: &str,
        limit: i64,
    ) -> Result<Vec<Correction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tenant_id, transaction_id, field, old_value, new_value, user_id, reason, created_at
            FROM corrections
            WHERE tenant_id = ? AND field = ? AND new_value = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )?;
        let corrections = stmt
            .query_map(params![tenant_id, field, new_value, limit], Self::row_to_correction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(corrections)
    }

    fn row_to_correction(row: &rusqlite::Row) -> rusqlite::Result<Correction> {
        let created_at: String = row.get(8)?;
        Ok(Correction {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            transaction_id: row.get(2)?,
            field: row.get(3)?,
            old_value: row.get(4)?,
            new_value: row.get(5)?,
            user_id: row.get(6)?,
            reason: row.get(7)?,
            created_at: parse_datetime(&created_at),
        })
    }

    // ============================================
    // Pattern suggestions
    // ============================================

    /// Create a pattern suggestion in `pending` state
    #[allow(clippy::too_many_arguments)]
    pub fn create_suggestion(
        &self,
        tenant_id: &str,
        kind: PatternKind,
        body: &str,
        signature: Option<&EntitySignature>,
        entity_code: &str,
        category: Option<&str>,
        subcategory: Option<&str>,
        correction_count: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let signature_json = signature.map(serde_json::to_string).transpose()?;
        conn.execute(
            r#"
            INSERT INTO pattern_suggestions (
                tenant_id, kind, body, signature, entity_code, category, subcategory, correction_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                tenant_id,
                kind.as_str(),
                body,
                signature_json,
                entity_code,
                category,
                subcategory,
                correction_count,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get a suggestion by id
    pub fn get_suggestion(&self, tenant_id: &str, id: i64) -> Result<Option<PatternSuggestion>> {
        let conn = self.conn()?;
        let suggestion = conn
            .query_row(
                &format!("{} WHERE tenant_id = ? AND id = ?", SELECT_SUGGESTION),
                params![tenant_id, id],
                Self::row_to_suggestion,
            )
            .optional()?;
        Ok(suggestion)
    }

    /// An existing non-rejected suggestion with the same body, if any.
    ///
    /// Rejected suggestions are retained and do not retry automatically, so a
    /// matching rejected row also suppresses re-creation.
    pub fn find_suggestion_by_body(
        &self,
        tenant_id: &str,
        kind: PatternKind,
        body: &str,
    ) -> Result<Option<PatternSuggestion>> {
        let conn = self.conn()?;
        let suggestion = conn
            .query_row(
                &format!(
                    "{} WHERE tenant_id = ? AND kind = ? AND body = ? ORDER BY id DESC LIMIT 1",
                    SELECT_SUGGESTION
                ),
                params![tenant_id, kind.as_str(), body],
                Self::row_to_suggestion,
            )
            .optional()?;
        Ok(suggestion)
    }

    /// List suggestions, optionally by status
    pub fn list_suggestions(
        &self,
        tenant_id: &str,
        status: Option<SuggestionStatus>,
        limit: i64,
    ) -> Result<Vec<PatternSuggestion>> {
        let conn = self.conn()?;
        let mut sql = format!("{} WHERE tenant_id = ?", SELECT_SUGGESTION);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];
        if let Some(s) = status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(s.as_str().to_string()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        params_vec.push(Box::new(limit));

        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let suggestions = stmt
            .query_map(params_refs.as_slice(), Self::row_to_suggestion)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(suggestions)
    }

    /// Advance a suggestion's status, optionally recording a rejection reason
    pub fn update_suggestion_status(
        &self,
        tenant_id: &str,
        id: i64,
        status: SuggestionStatus,
        rejection_reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE pattern_suggestions
            SET status = ?, rejection_reason = ?, updated_at = CURRENT_TIMESTAMP
            WHERE tenant_id = ? AND id = ?
            "#,
            params![status.as_str(), rejection_reason, tenant_id, id],
        )?;
        Ok(())
    }

    /// Record the occurrence statistics gathered for Pass 2 validation
    pub fn update_suggestion_stats(
        &self,
        tenant_id: &str,
        id: i64,
        occurrence_count: i64,
        first_seen: Option<chrono::NaiveDate>,
        last_seen: Option<chrono::NaiveDate>,
        frequency_class: FrequencyClass,
        amount_cv: Option<f64>,
        correction_count: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE pattern_suggestions
            SET occurrence_count = ?, first_seen = ?, last_seen = ?, frequency_class = ?,
                amount_cv = ?, correction_count = ?, updated_at = CURRENT_TIMESTAMP
            WHERE tenant_id = ? AND id = ?
            "#,
            params![
                occurrence_count,
                first_seen.map(|d| d.to_string()),
                last_seen.map(|d| d.to_string()),
                frequency_class.as_str(),
                amount_cv,
                correction_count,
                tenant_id,
                id,
            ],
        )?;
        Ok(())
    }

    fn row_to_suggestion(row: &rusqlite::Row) -> rusqlite::Result<PatternSuggestion> {
        let status_str: String = row.get(2)?;
        let kind_str: String = row.get(3)?;
        let signature_json: Option<String> = row.get(5)?;
        let first_seen: Option<String> = row.get(10)?;
        let last_seen: Option<String> = row.get(11)?;
        let frequency: Option<String> = row.get(12)?;
        let created_at: String = row.get(16)?;
        let updated_at: String = row.get(17)?;
        Ok(PatternSuggestion {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            status: status_str.parse().unwrap_or(SuggestionStatus::Pending),
            kind: kind_str.parse().unwrap_or(PatternKind::TokenBag),
            body: row.get(4)?,
            signature: signature_json.and_then(|j| serde_json::from_str(&j).ok()),
            entity_code: row.get(6)?,
            category: row.get(7)?,
            subcategory: row.get(8)?,
            occurrence_count: row.get(9)?,
            first_seen: first_seen
                .and_then(|s| chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
            last_seen: last_seen
                .and_then(|s| chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
            frequency_class: frequency.and_then(|s| s.parse().ok()),
            amount_cv: row.get(13)?,
            correction_count: row.get(14)?,
            rejection_reason: row.get(15)?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }
}

const SELECT_SUGGESTION: &str = r#"
SELECT id, tenant_id, status, kind, body, signature, entity_code, category,
       subcategory, occurrence_count, first_seen, last_seen, frequency_class,
       amount_cv, correction_count, rejection_reason, created_at, updated_at
FROM pattern_suggestions"#;
