//! Account map operations (bank accounts and crypto wallets)

use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{Account, AccountKind};
use crate::text::normalize_identifier;

impl Database {
    /// Create an account mapping an identifier to an entity/line
    #[allow(clippy::too_many_arguments)]
    pub fn create_account(
        &self,
        tenant_id: &str,
        kind: AccountKind,
        identifier: &str,
        display_name: Option<&str>,
        entity_code: &str,
        business_line_code: Option<&str>,
        default_category: Option<&str>,
        default_subcategory: Option<&str>,
        role: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO accounts (
                tenant_id, kind, identifier, identifier_norm, display_name,
                entity_code, business_line_code, default_category, default_subcategory, role
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                tenant_id,
                kind.as_str(),
                identifier,
                normalize_identifier(identifier),
                display_name,
                entity_code,
                business_line_code,
                default_category,
                default_subcategory,
                role,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up an active account by identifier (case-insensitive)
    pub fn find_account(&self, tenant_id: &str, identifier: &str) -> Result<Option<Account>> {
        let conn = self.conn()?;
        let account = conn
            .query_row(
                r#"
                SELECT id, tenant_id, kind, identifier, display_name, entity_code,
                       business_line_code, default_category, default_subcategory, role,
                       active, created_at
                FROM accounts
                WHERE tenant_id = ? AND identifier_norm = ? AND active = 1
                "#,
                params![tenant_id, normalize_identifier(identifier)],
                Self::row_to_account,
            )
            .optional()?;
        Ok(account)
    }

    /// List a tenant's accounts
    pub fn list_accounts(&self, tenant_id: &str, include_inactive: bool) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let sql = if include_inactive {
            r#"
            SELECT id, tenant_id, kind, identifier, display_name, entity_code,
                   business_line_code, default_category, default_subcategory, role,
                   active, created_at
            FROM accounts WHERE tenant_id = ? ORDER BY id
            "#
        } else {
            r#"
            SELECT id, tenant_id, kind, identifier, display_name, entity_code,
                   business_line_code, default_category, default_subcategory, role,
                   active, created_at
            FROM accounts WHERE tenant_id = ? AND active = 1 ORDER BY id
            "#
        };
        let mut stmt = conn.prepare(sql)?;
        let accounts = stmt
            .query_map(params![tenant_id], Self::row_to_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    /// Deactivate an account (soft)
    pub fn deactivate_account(&self, tenant_id: &str, account_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE accounts SET active = 0 WHERE tenant_id = ? AND id = ?",
            params![tenant_id, account_id],
        )?;
        Ok(())
    }

    fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
        let kind_str: String = row.get(2)?;
        let active: i64 = row.get(10)?;
        let created_at: String = row.get(11)?;
        Ok(Account {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            kind: kind_str.parse().unwrap_or(AccountKind::Bank),
            identifier: row.get(3)?,
            display_name: row.get(4)?,
            entity_code: row.get(5)?,
            business_line_code: row.get(6)?,
            default_category: row.get(7)?,
            default_subcategory: row.get(8)?,
            role: row.get(9)?,
            active: active != 0,
            created_at: parse_datetime(&created_at),
        })
    }
}
