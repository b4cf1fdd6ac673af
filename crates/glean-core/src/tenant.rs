//! Tenant context resolution
//!
//! Every core operation starts here: the caller-supplied tenant id is bound
//! and verified, and an absent or unknown tenant fails loudly with
//! `MissingTenant`. There is no environment-based defaulting and no dev
//! fallback, anywhere, ever. Test fixtures create their tenants explicitly.

use tracing::error;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::Tenant;

/// Security-event category for tenant resolution failures
pub const SECURITY_CATEGORY_TENANT: &str = "tenant_resolution";

/// Resolve the acting tenant for an operation.
///
/// An empty or whitespace id, or an id with no tenant row, is a
/// `MissingTenant` error; a security-category event is logged and persisted
/// before returning.
pub fn resolve_tenant(db: &Database, tenant_id: &str) -> Result<Tenant> {
    let trimmed = tenant_id.trim();
    if trimmed.is_empty() {
        return deny(db, None, "operation invoked without a tenant id");
    }

    match db.get_tenant(trimmed)? {
        Some(tenant) => Ok(tenant),
        None => deny(
            db,
            Some(trimmed),
            &format!("operation invoked for unknown tenant '{}'", trimmed),
        ),
    }
}

fn deny(db: &Database, tenant_id: Option<&str>, message: &str) -> Result<Tenant> {
    error!(tenant = tenant_id.unwrap_or("<none>"), "{}", message);
    if let Err(e) = db.record_security_event(tenant_id, SECURITY_CATEGORY_TENANT, message) {
        // The security log must never mask the original failure
        error!("Failed to persist security event: {}", e);
    }
    Err(Error::MissingTenant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tenant_is_missing() {
        let db = Database::in_memory().unwrap();
        let err = resolve_tenant(&db, "").unwrap_err();
        assert!(matches!(err, Error::MissingTenant));

        let err = resolve_tenant(&db, "   ").unwrap_err();
        assert!(matches!(err, Error::MissingTenant));
    }

    #[test]
    fn test_unknown_tenant_is_missing() {
        let db = Database::in_memory().unwrap();
        let err = resolve_tenant(&db, "nobody").unwrap_err();
        assert!(matches!(err, Error::MissingTenant));
    }

    #[test]
    fn test_denial_writes_security_event() {
        let db = Database::in_memory().unwrap();
        let _ = resolve_tenant(&db, "ghost");
        let events = db
            .list_security_events(Some(SECURITY_CATEGORY_TENANT), 10)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tenant_id.as_deref(), Some("ghost"));
    }

    #[test]
    fn test_known_tenant_resolves() {
        let db = Database::in_memory().unwrap();
        db.create_tenant("acme", "Acme Corp", None, "USD", None).unwrap();
        let tenant = resolve_tenant(&db, "acme").unwrap();
        assert_eq!(tenant.id, "acme");
        assert_eq!(tenant.display_name, "Acme Corp");
    }
}
