//! Transaction Store operations

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashSet;

use super::{parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{
    CanonicalRow, Classification, ClassificationSource, Transaction, AMOUNT_SCALE,
};
use crate::text::{signal_tokens, token_similarity};

/// Result of upserting a canonical row
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// Row was inserted, contains new transaction ID
    Inserted(i64),
    /// Row was a duplicate, contains existing transaction ID
    Duplicate(i64),
}

/// Filter for transaction queries. Every query is tenant-scoped; the tenant
/// id is a separate required parameter, never part of the filter.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub entity_code: Option<String>,
    pub accounting_category: Option<String>,
    pub needs_review: Option<bool>,
    pub raw_file_id: Option<i64>,
    pub search: Option<String>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub include_archived: bool,
}

impl TransactionFilter {
    fn build(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = vec!["t.tenant_id = ?".to_string()];
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref e) = self.entity_code {
            conditions.push("t.entity_code = ?".to_string());
            params_vec.push(Box::new(e.clone()));
        }
        if let Some(ref c) = self.accounting_category {
            conditions.push("t.accounting_category = ?".to_string());
            params_vec.push(Box::new(c.clone()));
        }
        if let Some(nr) = self.needs_review {
            conditions.push("t.needs_review = ?".to_string());
            params_vec.push(Box::new(nr));
        }
        if let Some(fid) = self.raw_file_id {
            conditions.push("t.raw_file_id = ?".to_string());
            params_vec.push(Box::new(fid));
        }
        if let Some(ref q) = self.search {
            if !q.trim().is_empty() {
                conditions.push("t.description LIKE ? COLLATE NOCASE".to_string());
                params_vec.push(Box::new(format!("%{}%", q.trim())));
            }
        }
        if let Some((from, to)) = self.date_range {
            conditions.push("t.posted_date >= ? AND t.posted_date <= ?".to_string());
            params_vec.push(Box::new(from.to_string()));
            params_vec.push(Box::new(to.to_string()));
        }
        if !self.include_archived {
            conditions.push("t.archived = 0".to_string());
        }

        (format!("WHERE {}", conditions.join(" AND ")), params_vec)
    }
}

/// One page of transactions plus the total match count
#[derive(Debug, Clone)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub total: i64,
}

impl Database {
    /// Insert a canonical row with its classification, idempotent on
    /// (tenant, content_hash).
    pub fn upsert_row(
        &self,
        tenant_id: &str,
        row: &CanonicalRow,
        classification: &Classification,
        needs_review: bool,
        origin_display: Option<&str>,
        destination_display: Option<&str>,
    ) -> Result<UpsertOutcome> {
        let conn = self.conn()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM transactions WHERE tenant_id = ? AND content_hash = ?",
                params![tenant_id, row.content_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing_id) = existing {
            return Ok(UpsertOutcome::Duplicate(existing_id));
        }

        conn.execute(
            r#"
            INSERT INTO transactions (
                tenant_id, raw_file_id, row_index_in_file, posted_date, description,
                amount, currency, account_identifier, origin, destination, reference,
                transaction_type, network, content_hash, entity_code, business_line_code,
                accounting_category, subcategory, justification, confidence,
                classification_source, needs_review, origin_display, destination_display
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                tenant_id,
                row.raw_file_id,
                row.row_index_in_file,
                row.posted_date.to_string(),
                row.description,
                row.amount.round_dp(AMOUNT_SCALE).normalize().to_string(),
                row.currency,
                row.account_identifier,
                row.origin,
                row.destination,
                row.reference,
                row.transaction_type,
                row.network,
                row.content_hash,
                classification.entity_code,
                classification.business_line_code,
                classification.accounting_category,
                classification.subcategory,
                classification.justification,
                classification.confidence,
                classification.source.as_str(),
                needs_review,
                origin_display,
                destination_display,
            ],
        )?;
        let id = conn.last_insert_rowid();

        for token in signal_tokens(&row.description) {
            conn.execute(
                "INSERT OR IGNORE INTO transaction_tokens (tenant_id, token, transaction_id) VALUES (?, ?, ?)",
                params![tenant_id, token, id],
            )?;
        }

        Ok(UpsertOutcome::Inserted(id))
    }

    /// Batched dedupe lookup: which of these content hashes already exist?
    pub fn existing_content_hashes(
        &self,
        tenant_id: &str,
        hashes: &[String],
    ) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.conn()?;
        let placeholders: Vec<&str> = hashes.iter().map(|_| "?").collect();
        let sql = format!(
            "SELECT content_hash FROM transactions WHERE tenant_id = ? AND content_hash IN ({})",
            placeholders.join(", ")
        );
        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&tenant_id];
        for h in hashes {
            params_vec.push(h);
        }
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_vec.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(found)
    }

    /// Get a single transaction by ID
    pub fn get_transaction(&self, tenant_id: &str, id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let transaction = conn
            .query_row(
                &format!("{} WHERE t.tenant_id = ? AND t.id = ?", SELECT_TRANSACTION),
                params![tenant_id, id],
                Self::row_to_transaction,
            )
            .optional()?;
        Ok(transaction)
    }

    /// Paginated, filtered retrieval
    pub fn list_transactions(
        &self,
        tenant_id: &str,
        filter: &TransactionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<TransactionPage> {
        let conn = self.conn()?;
        let (where_clause, mut params_vec) = filter.build();
        // tenant id binds first in the WHERE clause
        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];
        all_params.append(&mut params_vec);

        let count_sql = format!("SELECT COUNT(*) FROM transactions t {}", where_clause);
        let count_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();
        let total: i64 = conn.query_row(&count_sql, count_refs.as_slice(), |row| row.get(0))?;

        let sql = format!(
            "{} {} ORDER BY t.posted_date DESC, t.id DESC LIMIT ? OFFSET ?",
            SELECT_TRANSACTION, where_clause
        );
        all_params.push(Box::new(limit));
        all_params.push(Box::new(offset));
        let params_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(params_refs.as_slice(), Self::row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(TransactionPage { transactions, total })
    }

    /// Rewrite a transaction's classification fields.
    ///
    /// Refuses to overwrite a row whose current source is `user` unless the
    /// new source is also `user`.
    pub fn update_classification(
        &self,
        tenant_id: &str,
        transaction_id: i64,
        classification: &Classification,
        needs_review: bool,
    ) -> Result<()> {
        let conn = self.conn()?;

        let current: Option<String> = conn
            .query_row(
                "SELECT classification_source FROM transactions WHERE tenant_id = ? AND id = ?",
                params![tenant_id, transaction_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))?;
        let current_source: ClassificationSource =
            current.parse().unwrap_or(ClassificationSource::Default);

        if current_source == ClassificationSource::User
            && classification.source != ClassificationSource::User
        {
            return Err(Error::UserEditRejected(format!(
                "transaction {} was classified by a user; {} may not overwrite it",
                transaction_id,
                classification.source.as_str()
            )));
        }

        conn.execute(
            r#"
            UPDATE transactions SET
                entity_code = ?, business_line_code = ?, accounting_category = ?,
                subcategory = ?, justification = ?, confidence = ?,
                classification_source = ?, needs_review = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE tenant_id = ? AND id = ?
            "#,
            params![
                classification.entity_code,
                classification.business_line_code,
                classification.accounting_category,
                classification.subcategory,
                classification.justification,
                classification.confidence,
                classification.source.as_str(),
                needs_review,
                tenant_id,
                transaction_id,
            ],
        )?;
        Ok(())
    }

    /// Apply a classification to every transaction matching the filter,
    /// atomically per row, skipping user-protected rows.
    ///
    /// Returns (updated, skipped) counts. Matching ids are collected before
    /// any write: updating while paginating would skip rows whenever the
    /// filter depends on a field being rewritten. Updates are then chunked
    /// so a large bulk edit never holds one long write.
    pub fn bulk_update_classification(
        &self,
        tenant_id: &str,
        filter: &TransactionFilter,
        classification: &Classification,
        needs_review: bool,
    ) -> Result<(usize, usize)> {
        const CHUNK: i64 = 500;

        let mut ids = Vec::new();
        let mut offset = 0i64;
        loop {
            let page = self.list_transactions(tenant_id, filter, CHUNK, offset)?;
            let fetched = page.transactions.len() as i64;
            ids.extend(page.transactions.into_iter().map(|t| t.id));
            if fetched < CHUNK {
                break;
            }
            offset += CHUNK;
        }

        let mut updated = 0usize;
        let mut skipped = 0usize;
        for id in ids {
            match self.update_classification(tenant_id, id, classification, needs_review) {
                Ok(()) => updated += 1,
                Err(Error::UserEditRejected(_)) => skipped += 1,
                Err(e) => return Err(e),
            }
        }

        Ok((updated, skipped))
    }

    /// Transactions with descriptions similar to the given one, by token
    /// overlap through the `transaction_tokens` index (bounded cost).
    ///
    /// Returns (transaction, jaccard similarity), best first.
    pub fn find_similar(
        &self,
        tenant_id: &str,
        description: &str,
        limit: i64,
    ) -> Result<Vec<(Transaction, f64)>> {
        let tokens = signal_tokens(description);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;

        let placeholders: Vec<&str> = tokens.iter().map(|_| "?").collect();
        // Candidates share at least one signal token; ranked by shared count.
        let sql = format!(
            r#"
            SELECT transaction_id, COUNT(*) AS hits FROM transaction_tokens
            WHERE tenant_id = ? AND token IN ({})
            GROUP BY transaction_id
            ORDER BY hits DESC
            LIMIT ?
            "#,
            placeholders.join(", ")
        );
        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&tenant_id];
        for t in &tokens {
            params_vec.push(t);
        }
        let candidate_cap = limit * 4;
        params_vec.push(&candidate_cap);

        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_vec.as_slice(), |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut out = Vec::new();
        for id in ids {
            if let Some(tx) = self.get_transaction(tenant_id, id)? {
                let sim = token_similarity(description, &tx.description);
                out.push((tx, sim));
            }
        }
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(limit as usize);
        Ok(out)
    }

    /// Archive a transaction (hide from lists)
    pub fn archive_transaction(&self, tenant_id: &str, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE transactions SET archived = 1, updated_at = CURRENT_TIMESTAMP WHERE tenant_id = ? AND id = ?",
            params![tenant_id, id],
        )?;
        Ok(())
    }

    /// Count transactions for a tenant
    pub fn count_transactions(&self, tenant_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE tenant_id = ?",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Helper to convert a row to Transaction
    /// Column order matches SELECT_TRANSACTION.
    pub(crate) fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
        let date_str: String = row.get(4)?;
        let amount_str: String = row.get(6)?;
        let source_str: String = row.get(21)?;
        let needs_review: i64 = row.get(22)?;
        let archived: i64 = row.get(23)?;
        let created_at: String = row.get(26)?;
        let updated_at: String = row.get(27)?;
        Ok(Transaction {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            raw_file_id: row.get(2)?,
            row_index_in_file: row.get(3)?,
            posted_date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").unwrap_or_default(),
            description: row.get(5)?,
            amount: amount_str.parse::<Decimal>().unwrap_or_default(),
            currency: row.get(7)?,
            account_identifier: row.get(8)?,
            origin: row.get(9)?,
            destination: row.get(10)?,
            reference: row.get(11)?,
            transaction_type: row.get(12)?,
            network: row.get(13)?,
            content_hash: row.get(14)?,
            entity_code: row.get(15)?,
            business_line_code: row.get(16)?,
            accounting_category: row.get(17)?,
            subcategory: row.get(18)?,
            justification: row.get(19)?,
            confidence: row.get(20)?,
            classification_source: source_str.parse().unwrap_or_default(),
            needs_review: needs_review != 0,
            archived: archived != 0,
            origin_display: row.get(24)?,
            destination_display: row.get(25)?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }
}

const SELECT_TRANSACTION: &str = r#"
SELECT t.id, t.tenant_id, t.raw_file_id, t.row_index_in_file, t.posted_date,
       t.description, t.amount, t.currency, t.account_identifier, t.origin,
       t.destination, t.reference, t.transaction_type, t.network, t.content_hash,
       t.entity_code, t.business_line_code, t.accounting_category, t.subcategory,
       t.justification, t.confidence, t.classification_source, t.needs_review,
       t.archived, t.origin_display, t.destination_display, t.created_at, t.updated_at
FROM transactions t"#;
