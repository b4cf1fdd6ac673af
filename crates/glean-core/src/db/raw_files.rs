//! Raw file registry and the parse-plan cache

use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{RawFile, RawFileStatus};
use crate::plan::ParsePlan;

impl Database {
    /// Register an uploaded file. Re-uploading identical bytes returns the
    /// existing row (whole-file dedupe on content hash).
    pub fn register_raw_file(
        &self,
        tenant_id: &str,
        filename: &str,
        blob_ref: &str,
        content_hash: &str,
        size_bytes: i64,
    ) -> Result<RawFile> {
        let conn = self.conn()?;

        let existing = conn
            .query_row(
                r#"
                SELECT id, tenant_id, filename, blob_ref, content_hash, size_bytes,
                       status, error, uploaded_at, updated_at
                FROM raw_files WHERE tenant_id = ? AND content_hash = ?
                "#,
                params![tenant_id, content_hash],
                Self::row_to_raw_file,
            )
            .optional()?;
        if let Some(file) = existing {
            return Ok(file);
        }

        conn.execute(
            r#"
            INSERT INTO raw_files (tenant_id, filename, blob_ref, content_hash, size_bytes)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![tenant_id, filename, blob_ref, content_hash, size_bytes],
        )?;
        let id = conn.last_insert_rowid();
        self.get_raw_file(tenant_id, id)?
            .ok_or_else(|| crate::error::Error::NotFound(format!("raw file {}", id)))
    }

    /// Get a raw file by id
    pub fn get_raw_file(&self, tenant_id: &str, id: i64) -> Result<Option<RawFile>> {
        let conn = self.conn()?;
        let file = conn
            .query_row(
                r#"
                SELECT id, tenant_id, filename, blob_ref, content_hash, size_bytes,
                       status, error, uploaded_at, updated_at
                FROM raw_files WHERE tenant_id = ? AND id = ?
                "#,
                params![tenant_id, id],
                Self::row_to_raw_file,
            )
            .optional()?;
        Ok(file)
    }

    /// List raw files for a tenant, newest first
    pub fn list_raw_files(&self, tenant_id: &str, limit: i64) -> Result<Vec<RawFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tenant_id, filename, blob_ref, content_hash, size_bytes,
                   status, error, uploaded_at, updated_at
            FROM raw_files WHERE tenant_id = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )?;
        let files = stmt
            .query_map(params![tenant_id, limit], Self::row_to_raw_file)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Move a raw file to a new status, optionally recording an error
    pub fn update_raw_file_status(
        &self,
        tenant_id: &str,
        id: i64,
        status: RawFileStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE raw_files
            SET status = ?, error = ?, updated_at = CURRENT_TIMESTAMP
            WHERE tenant_id = ? AND id = ?
            "#,
            params![status.as_str(), error, tenant_id, id],
        )?;
        Ok(())
    }

    fn row_to_raw_file(row: &rusqlite::Row) -> rusqlite::Result<RawFile> {
        let status_str: String = row.get(6)?;
        let uploaded_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;
        Ok(RawFile {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            filename: row.get(2)?,
            blob_ref: row.get(3)?,
            content_hash: row.get(4)?,
            size_bytes: row.get(5)?,
            status: status_str.parse().unwrap_or(RawFileStatus::Received),
            error: row.get(7)?,
            uploaded_at: parse_datetime(&uploaded_at),
            updated_at: parse_datetime(&updated_at),
        })
    }

    // ============================================
    // Parse-plan cache
    // ============================================

    /// Look up a cached plan for a header-region hash
    pub fn get_cached_plan(&self, tenant_id: &str, header_hash: &str) -> Result<Option<ParsePlan>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT plan FROM plan_cache WHERE tenant_id = ? AND header_hash = ?",
                params![tenant_id, header_hash],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    /// Cache a validated plan for a header-region hash
    pub fn cache_plan(&self, tenant_id: &str, header_hash: &str, plan: &ParsePlan) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(plan)?;
        conn.execute(
            r#"
            INSERT INTO plan_cache (tenant_id, header_hash, plan)
            VALUES (?, ?, ?)
            ON CONFLICT(tenant_id, header_hash) DO UPDATE SET plan = excluded.plan
            "#,
            params![tenant_id, header_hash, json],
        )?;
        Ok(())
    }
}
