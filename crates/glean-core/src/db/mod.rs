//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `tenants` - Tenants, legal entities, business lines, categories, settings
//! - `accounts` - Account map (bank accounts and wallets)
//! - `raw_files` - Uploaded file registry and the parse-plan cache
//! - `patterns` - Pattern Store with its inverted token index
//! - `transactions` - Transaction Store (ledger) and similarity index
//! - `corrections` - Correction log and pattern suggestions
//! - `jobs` - Ingest job sessions and rejected-row diagnostics
//!
//! Every table carries a tenant id and every query filters on it; the store
//! interface is where multi-tenant isolation is enforced.

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::{Error, Result};

mod accounts;
mod corrections;
mod jobs;
mod patterns;
mod raw_files;
mod tenants;
mod transactions;

pub use jobs::{IngestJobRecord, JobState};
pub use transactions::{TransactionFilter, TransactionPage, UpsertOutcome};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable for database encryption key
pub const DB_KEY_ENV: &str = "GLEAN_DB_KEY";

/// Derive an encryption key from a passphrase using Argon2
///
/// Uses a fixed application salt so the same passphrase always produces the same key,
/// regardless of database path. This allows moving/renaming/restoring the database freely.
fn derive_key(passphrase: &str) -> Result<String> {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};

    // Fixed application salt - changing this would invalidate all existing encrypted databases
    const APP_SALT: &[u8; 16] = b"glean-salt-v1-fx";

    let salt = SaltString::encode_b64(APP_SALT)
        .map_err(|e| Error::Encryption(format!("Failed to create salt: {}", e)))?;

    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;

    let hash_str = hash
        .hash
        .ok_or_else(|| Error::Encryption("No hash output".to_string()))?;
    Ok(hex::encode(hash_str.as_bytes()))
}

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Create a new database connection pool with encryption
    ///
    /// Requires `GLEAN_DB_KEY` environment variable to be set.
    /// The database will be encrypted using SQLCipher with a key derived
    /// from the passphrase via Argon2.
    ///
    /// Returns an error if `GLEAN_DB_KEY` is not set. Use `new_unencrypted()`
    /// for development/testing without encryption.
    pub fn new(path: &str) -> Result<Self> {
        let encryption_key = std::env::var(DB_KEY_ENV).ok();
        match encryption_key {
            Some(key) => Self::new_with_key(path, Some(&key)),
            None => Err(Error::Encryption(format!(
                "Database encryption required. Set {} environment variable with your passphrase, \
                or use --no-encrypt for unencrypted databases (not recommended for production).",
                DB_KEY_ENV
            ))),
        }
    }

    /// Create a new unencrypted database connection pool
    ///
    /// WARNING: This creates an unencrypted database. Only use for development
    /// or testing. For production, use `new()` with `GLEAN_DB_KEY` set.
    pub fn new_unencrypted(path: &str) -> Result<Self> {
        Self::new_with_key(path, None)
    }

    /// Create a new database with an explicit encryption key
    pub fn new_with_key(path: &str, passphrase: Option<&str>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);

        let pool = if let Some(pass) = passphrase {
            let key = derive_key(pass)?;
            let key_pragma = format!("PRAGMA key = 'x\"{}\"';", key);

            // Use with_init to set the key on every new connection
            let manager = manager.with_init(move |conn| {
                conn.execute_batch(&key_pragma)?;
                Ok(())
            });

            Pool::builder().max_size(10).build(manager)?
        } else {
            Pool::builder().max_size(10).build(manager)?
        };

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a scratch database (for testing)
    ///
    /// Note: Uses a temporary file rather than `:memory:` because SQLCipher
    /// has issues with in-memory databases in the connection pool.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = format!(
            "{}/glean_test_{}_{}.db",
            std::env::temp_dir().display(),
            std::process::id(),
            id
        );

        let _ = std::fs::remove_file(&path);

        Self::new_unencrypted(&path)
    }

    /// Check if the database is encrypted
    pub fn is_encrypted(&self) -> Result<bool> {
        let conn = self.conn()?;
        // SQLCipher sets cipher_version if encryption is active
        let result: rusqlite::Result<String> =
            conn.query_row("PRAGMA cipher_version;", [], |row| row.get(0));
        Ok(result.is_ok() && std::env::var(DB_KEY_ENV).is_ok())
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Enable foreign keys
            PRAGMA foreign_keys = ON;

            -- Performance pragmas for local storage (SSD/M.2 recommended)
            -- WAL mode: better concurrency, readers don't block writers
            PRAGMA journal_mode = WAL;

            -- Cache size: ~8MB (2000 pages * 4KB default page size)
            PRAGMA cache_size = 2000;

            -- Synchronous NORMAL: good balance of safety and performance
            PRAGMA synchronous = NORMAL;

            -- Store temp tables in memory (faster for complex queries)
            PRAGMA temp_store = MEMORY;

            -- Tenants
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                industry TEXT,
                default_currency TEXT NOT NULL DEFAULT 'USD',
                fiscal_year_end TEXT,
                settings TEXT,                             -- JSON TenantSettings, NULL = defaults
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Legal entities (per-tenant chart of entities)
            CREATE TABLE IF NOT EXISTS legal_entities (
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                code TEXT NOT NULL,
                display_name TEXT NOT NULL,
                legal_name TEXT,
                entity_type TEXT,
                base_currency TEXT NOT NULL DEFAULT 'USD',
                active BOOLEAN DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (tenant_id, code)
            );

            -- Business lines (profit centers)
            CREATE TABLE IF NOT EXISTS business_lines (
                tenant_id TEXT NOT NULL,
                entity_code TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                is_default BOOLEAN DEFAULT 0,
                color TEXT,
                active BOOLEAN DEFAULT 1,
                PRIMARY KEY (tenant_id, entity_code, code),
                FOREIGN KEY (tenant_id, entity_code) REFERENCES legal_entities(tenant_id, code)
            );

            -- Accounting categories (per-tenant enumeration the classifier
            -- validates LLM output against)
            CREATE TABLE IF NOT EXISTS categories (
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                name TEXT NOT NULL,
                active BOOLEAN DEFAULT 1,
                PRIMARY KEY (tenant_id, name)
            );

            -- Accounts (known funding sources: bank accounts and wallets)
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                kind TEXT NOT NULL,                        -- bank, wallet
                identifier TEXT NOT NULL,                  -- as entered
                identifier_norm TEXT NOT NULL,             -- lowercased/trimmed for lookup
                display_name TEXT,
                entity_code TEXT NOT NULL,
                business_line_code TEXT,
                default_category TEXT,
                default_subcategory TEXT,
                role TEXT,                                 -- e.g. mining (receiving wallets)
                active BOOLEAN DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(tenant_id, identifier_norm)
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_tenant ON accounts(tenant_id, active);

            -- Raw files (one row per physical upload)
            CREATE TABLE IF NOT EXISTS raw_files (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                filename TEXT NOT NULL,
                blob_ref TEXT NOT NULL,
                content_hash TEXT NOT NULL,                -- whole-file hash
                size_bytes INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'received',   -- received, analyzed, ingested, partially_ingested, failed
                error TEXT,
                uploaded_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(tenant_id, content_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_raw_files_tenant ON raw_files(tenant_id, status);

            -- Parse-plan cache keyed by the header region of the file, so
            -- re-uploading the same format reuses the prior plan
            CREATE TABLE IF NOT EXISTS plan_cache (
                tenant_id TEXT NOT NULL,
                header_hash TEXT NOT NULL,
                plan TEXT NOT NULL,                        -- JSON ParsePlan
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (tenant_id, header_hash)
            );

            -- Transactions (the tenant-scoped ledger)
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                raw_file_id INTEGER NOT NULL REFERENCES raw_files(id),
                row_index_in_file INTEGER NOT NULL,
                posted_date DATE NOT NULL,
                description TEXT NOT NULL,
                amount TEXT NOT NULL,                      -- canonical Decimal string, scale 8
                currency TEXT NOT NULL,
                account_identifier TEXT,
                origin TEXT,
                destination TEXT,
                reference TEXT,
                transaction_type TEXT,
                network TEXT,
                content_hash TEXT NOT NULL,
                entity_code TEXT,
                business_line_code TEXT,
                accounting_category TEXT,
                subcategory TEXT,
                justification TEXT,
                confidence REAL NOT NULL DEFAULT 0,
                classification_source TEXT NOT NULL DEFAULT 'default',
                needs_review BOOLEAN DEFAULT 0,
                archived BOOLEAN DEFAULT 0,
                origin_display TEXT,
                destination_display TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(tenant_id, content_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(tenant_id, posted_date DESC);
            CREATE INDEX IF NOT EXISTS idx_transactions_entity ON transactions(tenant_id, entity_code);
            CREATE INDEX IF NOT EXISTS idx_transactions_review ON transactions(tenant_id, needs_review);
            CREATE INDEX IF NOT EXISTS idx_transactions_file ON transactions(tenant_id, raw_file_id, row_index_in_file);

            -- Normalized-token index over transaction descriptions; powers
            -- find_similar with bounded cost
            CREATE TABLE IF NOT EXISTS transaction_tokens (
                tenant_id TEXT NOT NULL,
                token TEXT NOT NULL,
                transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                PRIMARY KEY (tenant_id, token, transaction_id)
            );

            -- Patterns (the Pattern Store)
            CREATE TABLE IF NOT EXISTS patterns (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                kind TEXT NOT NULL,                        -- account_map, substring, regex, token_bag, entity_signature
                body TEXT NOT NULL,                        -- normalized rule body
                signature TEXT,                            -- JSON EntitySignature (entity_signature kind)
                entity_code TEXT,
                business_line_code TEXT,
                category TEXT,
                subcategory TEXT,
                confidence REAL NOT NULL,
                occurrence_count INTEGER NOT NULL DEFAULT 0,
                last_seen_at DATETIME,
                source TEXT NOT NULL,                      -- seed, user_correction, llm_extraction
                active BOOLEAN DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(tenant_id, kind, body)
            );

            CREATE INDEX IF NOT EXISTS idx_patterns_match ON patterns(tenant_id, kind, entity_code);
            CREATE INDEX IF NOT EXISTS idx_patterns_seen ON patterns(tenant_id, last_seen_at DESC);

            -- Inverted token index over pattern bodies; candidate lookup for
            -- match_description stays sub-linear in the pattern count.
            -- Patterns with no literal tokens are indexed under '*'.
            CREATE TABLE IF NOT EXISTS pattern_tokens (
                tenant_id TEXT NOT NULL,
                token TEXT NOT NULL,
                pattern_id INTEGER NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
                PRIMARY KEY (tenant_id, token, pattern_id)
            );

            -- Corrections (one row per user edit of a classification field;
            -- never deleted)
            CREATE TABLE IF NOT EXISTS corrections (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                field TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT,
                user_id TEXT NOT NULL,
                reason TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_corrections_tenant ON corrections(tenant_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_corrections_tx ON corrections(tenant_id, transaction_id);

            -- Pattern suggestions awaiting two-pass validation
            CREATE TABLE IF NOT EXISTS pattern_suggestions (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                status TEXT NOT NULL DEFAULT 'pending',    -- pending, validated_pass_one, validated_pass_two, approved, rejected
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                signature TEXT,                            -- JSON EntitySignature
                entity_code TEXT NOT NULL,
                category TEXT,
                subcategory TEXT,
                occurrence_count INTEGER NOT NULL DEFAULT 0,
                first_seen DATE,
                last_seen DATE,
                frequency_class TEXT,
                amount_cv REAL,
                correction_count INTEGER NOT NULL DEFAULT 0,
                rejection_reason TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_suggestions_tenant ON pattern_suggestions(tenant_id, status);

            -- Ingest jobs (session state; powers job_status and resume)
            CREATE TABLE IF NOT EXISTS ingest_jobs (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                raw_file_id INTEGER NOT NULL REFERENCES raw_files(id),
                state TEXT NOT NULL DEFAULT 'pending',     -- pending, analyzing, ingesting, completed, cancelled, failed
                rows_total INTEGER NOT NULL DEFAULT 0,
                rows_processed INTEGER NOT NULL DEFAULT 0,
                rows_accepted INTEGER NOT NULL DEFAULT 0,
                rows_duplicate INTEGER NOT NULL DEFAULT 0,
                rows_rejected INTEGER NOT NULL DEFAULT 0,
                last_committed_row INTEGER NOT NULL DEFAULT -1,
                error TEXT,
                started_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                finished_at DATETIME
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON ingest_jobs(tenant_id, state);
            CREATE INDEX IF NOT EXISTS idx_jobs_file ON ingest_jobs(tenant_id, raw_file_id);

            -- Rejected-row diagnostics
            CREATE TABLE IF NOT EXISTS rejected_rows (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                job_id INTEGER NOT NULL REFERENCES ingest_jobs(id) ON DELETE CASCADE,
                row_index_in_file INTEGER NOT NULL,
                reason TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_rejected_job ON rejected_rows(tenant_id, job_id);

            -- Security-category events (e.g. requests without tenant context)
            CREATE TABLE IF NOT EXISTS security_events (
                id INTEGER PRIMARY KEY,
                tenant_id TEXT,
                category TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_security_events_cat ON security_events(category, created_at DESC);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
