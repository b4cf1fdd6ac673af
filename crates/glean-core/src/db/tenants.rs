//! Tenant, legal entity, business line, category, and settings operations

use rusqlite::{params, OptionalExtension};

use super::{parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::{BusinessLine, LegalEntity, SecurityEvent, Tenant};
use crate::settings::TenantSettings;

impl Database {
    /// Create a tenant. Fails if the id is already taken.
    pub fn create_tenant(
        &self,
        id: &str,
        display_name: &str,
        industry: Option<&str>,
        default_currency: &str,
        fiscal_year_end: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO tenants (id, display_name, industry, default_currency, fiscal_year_end)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![id, display_name, industry, default_currency, fiscal_year_end],
        )?;
        Ok(())
    }

    /// Get a tenant by id
    pub fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn()?;
        let tenant = conn
            .query_row(
                r#"
                SELECT id, display_name, industry, default_currency, fiscal_year_end, created_at
                FROM tenants WHERE id = ?
                "#,
                params![id],
                |row| {
                    let created_at: String = row.get(5)?;
                    Ok(Tenant {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        industry: row.get(2)?,
                        default_currency: row.get(3)?,
                        fiscal_year_end: row.get(4)?,
                        created_at: parse_datetime(&created_at),
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    /// List all tenants
    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, display_name, industry, default_currency, fiscal_year_end, created_at
            FROM tenants ORDER BY id
            "#,
        )?;
        let tenants = stmt
            .query_map([], |row| {
                let created_at: String = row.get(5)?;
                Ok(Tenant {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    industry: row.get(2)?,
                    default_currency: row.get(3)?,
                    fiscal_year_end: row.get(4)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tenants)
    }

    /// Load a tenant's settings, falling back to defaults where unset
    pub fn tenant_settings(&self, tenant_id: &str) -> Result<TenantSettings> {
        let conn = self.conn()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT settings FROM tenants WHERE id = ?",
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Err(Error::NotFound(format!("tenant {}", tenant_id))),
            Some(None) => Ok(TenantSettings::default()),
            Some(Some(json)) => Ok(serde_json::from_str(&json)?),
        }
    }

    /// Persist a tenant's settings
    pub fn update_tenant_settings(&self, tenant_id: &str, settings: &TenantSettings) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(settings)?;
        let updated = conn.execute(
            "UPDATE tenants SET settings = ? WHERE id = ?",
            params![json, tenant_id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("tenant {}", tenant_id)));
        }
        Ok(())
    }

    // ============================================
    // Legal entities and business lines
    // ============================================

    /// Create a legal entity for a tenant
    pub fn create_legal_entity(
        &self,
        tenant_id: &str,
        code: &str,
        display_name: &str,
        legal_name: Option<&str>,
        entity_type: Option<&str>,
        base_currency: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO legal_entities (tenant_id, code, display_name, legal_name, entity_type, base_currency)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![tenant_id, code, display_name, legal_name, entity_type, base_currency],
        )?;
        Ok(())
    }

    /// List a tenant's active legal entities
    pub fn list_legal_entities(&self, tenant_id: &str) -> Result<Vec<LegalEntity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tenant_id, code, display_name, legal_name, entity_type, base_currency, active, created_at
            FROM legal_entities
            WHERE tenant_id = ? AND active = 1
            ORDER BY code
            "#,
        )?;
        let entities = stmt
            .query_map(params![tenant_id], |row| {
                let active: i64 = row.get(6)?;
                let created_at: String = row.get(7)?;
                Ok(LegalEntity {
                    tenant_id: row.get(0)?,
                    code: row.get(1)?,
                    display_name: row.get(2)?,
                    legal_name: row.get(3)?,
                    entity_type: row.get(4)?,
                    base_currency: row.get(5)?,
                    active: active != 0,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    /// Codes of a tenant's active legal entities (the classifier's enumeration)
    pub fn list_entity_codes(&self, tenant_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT code FROM legal_entities WHERE tenant_id = ? AND active = 1 ORDER BY code",
        )?;
        let codes = stmt
            .query_map(params![tenant_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(codes)
    }

    /// Create a business line under a legal entity
    pub fn create_business_line(
        &self,
        tenant_id: &str,
        entity_code: &str,
        code: &str,
        name: &str,
        is_default: bool,
        color: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO business_lines (tenant_id, entity_code, code, name, is_default, color)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![tenant_id, entity_code, code, name, is_default, color],
        )?;
        Ok(())
    }

    /// List business lines for an entity
    pub fn list_business_lines(&self, tenant_id: &str, entity_code: &str) -> Result<Vec<BusinessLine>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tenant_id, entity_code, code, name, is_default, color, active
            FROM business_lines
            WHERE tenant_id = ? AND entity_code = ? AND active = 1
            ORDER BY code
            "#,
        )?;
        let lines = stmt
            .query_map(params![tenant_id, entity_code], |row| {
                let is_default: i64 = row.get(4)?;
                let active: i64 = row.get(6)?;
                Ok(BusinessLine {
                    tenant_id: row.get(0)?,
                    entity_code: row.get(1)?,
                    code: row.get(2)?,
                    name: row.get(3)?,
                    is_default: is_default != 0,
                    color: row.get(5)?,
                    active: active != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(lines)
    }

    /// Default business line for an entity, if one is marked
    pub fn default_business_line(&self, tenant_id: &str, entity_code: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let code: Option<String> = conn
            .query_row(
                r#"
                SELECT code FROM business_lines
                WHERE tenant_id = ? AND entity_code = ? AND is_default = 1 AND active = 1
                LIMIT 1
                "#,
                params![tenant_id, entity_code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(code)
    }

    /// Whether the tenant has at least one entity with a default business line.
    ///
    /// The classifier refuses to produce non-default output for a tenant
    /// whose chart is not seeded.
    pub fn has_seeded_chart(&self, tenant_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM legal_entities e
            JOIN business_lines b ON b.tenant_id = e.tenant_id AND b.entity_code = e.code
            WHERE e.tenant_id = ? AND e.active = 1 AND b.is_default = 1 AND b.active = 1
            "#,
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Base currency of the tenant's first active entity, used as the
    /// currency default during enrichment
    pub fn default_base_currency(&self, tenant_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let currency: Option<String> = conn
            .query_row(
                r#"
                SELECT base_currency FROM legal_entities
                WHERE tenant_id = ? AND active = 1
                ORDER BY created_at, code LIMIT 1
                "#,
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(currency)
    }

    // ============================================
    // Accounting categories
    // ============================================

    /// Add an accounting category to the tenant's enumeration
    pub fn add_category(&self, tenant_id: &str, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO categories (tenant_id, name) VALUES (?, ?)",
            params![tenant_id, name],
        )?;
        Ok(())
    }

    /// List the tenant's active accounting categories
    pub fn list_categories(&self, tenant_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM categories WHERE tenant_id = ? AND active = 1 ORDER BY name")?;
        let names = stmt
            .query_map(params![tenant_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    // ============================================
    // Security events
    // ============================================

    /// Persist a security-category event
    pub fn record_security_event(
        &self,
        tenant_id: Option<&str>,
        category: &str,
        message: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO security_events (tenant_id, category, message) VALUES (?, ?, ?)",
            params![tenant_id, category, message],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List security events, newest first
    pub fn list_security_events(&self, category: Option<&str>, limit: i64) -> Result<Vec<SecurityEvent>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id, tenant_id, category, message, created_at FROM security_events WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(cat) = category {
            sql.push_str(" AND category = ?");
            params_vec.push(Box::new(cat.to_string()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        params_vec.push(Box::new(limit));

        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_refs.as_slice(), |row| {
                let created_at: String = row.get(4)?;
                Ok(SecurityEvent {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    category: row.get(2)?,
                    message: row.get(3)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }
}
