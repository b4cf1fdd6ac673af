//! Ingest job sessions and rejected-row diagnostics

use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::RejectedRow;

/// State machine for an ingest job
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Analyzing,
    Ingesting,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Ingesting => "ingesting",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "analyzing" => Ok(Self::Analyzing),
            "ingesting" => Ok(Self::Ingesting),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted state of one ingest job
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestJobRecord {
    pub id: i64,
    pub tenant_id: String,
    pub raw_file_id: i64,
    pub state: JobState,
    pub rows_total: i64,
    pub rows_processed: i64,
    pub rows_accepted: i64,
    pub rows_duplicate: i64,
    pub rows_rejected: i64,
    /// Highest source row index committed so far; resume starts after it
    pub last_committed_row: i64,
    pub error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Database {
    /// Create a new ingest job row in `pending` state
    pub fn create_ingest_job(&self, tenant_id: &str, raw_file_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ingest_jobs (tenant_id, raw_file_id) VALUES (?, ?)",
            params![tenant_id, raw_file_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get an ingest job by id
    pub fn get_ingest_job(&self, tenant_id: &str, job_id: i64) -> Result<Option<IngestJobRecord>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("{} WHERE tenant_id = ? AND id = ?", SELECT_JOB),
                params![tenant_id, job_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// The most recent job for a raw file (used by resume)
    pub fn latest_job_for_file(
        &self,
        tenant_id: &str,
        raw_file_id: i64,
    ) -> Result<Option<IngestJobRecord>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!(
                    "{} WHERE tenant_id = ? AND raw_file_id = ? ORDER BY id DESC LIMIT 1",
                    SELECT_JOB
                ),
                params![tenant_id, raw_file_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Move a job to a new state
    pub fn update_job_state(
        &self,
        tenant_id: &str,
        job_id: i64,
        state: JobState,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        // finished_at only set on terminal transitions
        if state.is_terminal() {
            conn.execute(
                r#"
                UPDATE ingest_jobs SET state = ?, error = ?, finished_at = CURRENT_TIMESTAMP
                WHERE tenant_id = ? AND id = ?
                "#,
                params![state.as_str(), error, tenant_id, job_id],
            )?;
        } else {
            conn.execute(
                "UPDATE ingest_jobs SET state = ?, error = ? WHERE tenant_id = ? AND id = ?",
                params![state.as_str(), error, tenant_id, job_id],
            )?;
        }
        Ok(())
    }

    /// Commit a chunk's counters. `last_committed_row` is monotonically
    /// non-decreasing in source row index.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_job_progress(
        &self,
        tenant_id: &str,
        job_id: i64,
        rows_total: i64,
        rows_processed: i64,
        rows_accepted: i64,
        rows_duplicate: i64,
        rows_rejected: i64,
        last_committed_row: i64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE ingest_jobs SET
                rows_total = ?, rows_processed = ?, rows_accepted = ?,
                rows_duplicate = ?, rows_rejected = ?,
                last_committed_row = MAX(last_committed_row, ?)
            WHERE tenant_id = ? AND id = ?
            "#,
            params![
                rows_total,
                rows_processed,
                rows_accepted,
                rows_duplicate,
                rows_rejected,
                last_committed_row,
                tenant_id,
                job_id,
            ],
        )?;
        Ok(())
    }

    /// Record a rejected row with its reason
    pub fn record_rejected_row(
        &self,
        tenant_id: &str,
        job_id: i64,
        row_index_in_file: i64,
        reason: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO rejected_rows (tenant_id, job_id, row_index_in_file, reason)
            VALUES (?, ?, ?, ?)
            "#,
            params![tenant_id, job_id, row_index_in_file, reason],
        )?;
        Ok(())
    }

    /// Rejected-row diagnostics for a job
    pub fn list_rejected_rows(&self, tenant_id: &str, job_id: i64) -> Result<Vec<RejectedRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tenant_id, job_id, row_index_in_file, reason, created_at
            FROM rejected_rows WHERE tenant_id = ? AND job_id = ?
            ORDER BY row_index_in_file
            "#,
        )?;
        let rows = stmt
            .query_map(params![tenant_id, job_id], |row| {
                let created_at: String = row.get(5)?;
                Ok(RejectedRow {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    job_id: row.get(2)?,
                    row_index_in_file: row.get(3)?,
                    reason: row.get(4)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<IngestJobRecord> {
        let state_str: String = row.get(3)?;
        let started_at: String = row.get(11)?;
        let finished_at: Option<String> = row.get(12)?;
        Ok(IngestJobRecord {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            raw_file_id: row.get(2)?,
            state: state_str.parse().unwrap_or(JobState::Pending),
            rows_total: row.get(4)?,
            rows_processed: row.get(5)?,
            rows_accepted: row.get(6)?,
            rows_duplicate: row.get(7)?,
            rows_rejected: row.get(8)?,
            last_committed_row: row.get(9)?,
            error: row.get(10)?,
            started_at: parse_datetime(&started_at),
            finished_at: finished_at.map(|s| parse_datetime(&s)),
        })
    }
}

const SELECT_JOB: &str = r#"
SELECT id, tenant_id, raw_file_id, state, rows_total, rows_processed,
       rows_accepted, rows_duplicate, rows_rejected, last_committed_row,
       error, started_at, finished_at
FROM ingest_jobs"#;
