//! Tenant, chart, category, and account administration commands

use anyhow::Result;

use glean_core::models::AccountKind;
use glean_core::Database;

pub fn cmd_tenants_list(db: &Database) -> Result<()> {
    let tenants = db.list_tenants()?;
    if tenants.is_empty() {
        println!("No tenants. Create one with: glean tenants add <id> <name>");
        return Ok(());
    }
    println!("{:<12} {:<30} {:<8} {}", "ID", "NAME", "CCY", "INDUSTRY");
    for t in tenants {
        println!(
            "{:<12} {:<30} {:<8} {}",
            t.id,
            t.display_name,
            t.default_currency,
            t.industry.unwrap_or_default()
        );
    }
    Ok(())
}

pub fn cmd_tenants_add(
    db: &Database,
    id: &str,
    name: &str,
    industry: Option<&str>,
    currency: &str,
) -> Result<()> {
    db.create_tenant(id, name, industry, currency, None)?;
    println!("Created tenant {} ({})", id, name);
    println!("Next: seed the chart with `glean -t {} entities add <code> <name>`", id);
    Ok(())
}

pub fn cmd_entities_list(db: &Database, tenant: &str) -> Result<()> {
    let entities = db.list_legal_entities(tenant)?;
    if entities.is_empty() {
        println!("No legal entities for tenant {}", tenant);
        return Ok(());
    }
    println!("{:<8} {:<30} {:<6} LINES", "CODE", "NAME", "CCY");
    for e in entities {
        let lines = db.list_business_lines(tenant, &e.code)?;
        let line_list: Vec<String> = lines
            .iter()
            .map(|l| {
                if l.is_default {
                    format!("{}*", l.code)
                } else {
                    l.code.clone()
                }
            })
            .collect();
        println!(
            "{:<8} {:<30} {:<6} {}",
            e.code,
            e.display_name,
            e.base_currency,
            line_list.join(", ")
        );
    }
    Ok(())
}

pub fn cmd_entities_add(
    db: &Database,
    tenant: &str,
    code: &str,
    name: &str,
    currency: &str,
) -> Result<()> {
    db.create_legal_entity(tenant, code, name, None, None, currency)?;
    println!("Created entity {} ({}) for tenant {}", code, name, tenant);
    println!(
        "The classifier stays on default output until the entity has a default business line: \
         `glean -t {} entities add-line {} <code> <name> --default`",
        tenant, code
    );
    Ok(())
}

pub fn cmd_entities_add_line(
    db: &Database,
    tenant: &str,
    entity: &str,
    code: &str,
    name: &str,
    default: bool,
) -> Result<()> {
    db.create_business_line(tenant, entity, code, name, default, None)?;
    println!(
        "Created business line {} under {}{}",
        code,
        entity,
        if default { " (default)" } else { "" }
    );
    Ok(())
}

pub fn cmd_categories_list(db: &Database, tenant: &str) -> Result<()> {
    let categories = db.list_categories(tenant)?;
    if categories.is_empty() {
        println!("No categories for tenant {}", tenant);
        return Ok(());
    }
    for c in categories {
        println!("{}", c);
    }
    Ok(())
}

pub fn cmd_categories_add(db: &Database, tenant: &str, name: &str) -> Result<()> {
    db.add_category(tenant, name)?;
    println!("Added category {}", name);
    Ok(())
}

pub fn cmd_accounts_list(db: &Database, tenant: &str) -> Result<()> {
    let accounts = db.list_accounts(tenant, false)?;
    if accounts.is_empty() {
        println!("No accounts for tenant {}", tenant);
        return Ok(());
    }
    println!(
        "{:<5} {:<7} {:<26} {:<8} {:<10} {}",
        "ID", "KIND", "IDENTIFIER", "ENTITY", "ROLE", "NAME"
    );
    for a in accounts {
        println!(
            "{:<5} {:<7} {:<26} {:<8} {:<10} {}",
            a.id,
            a.kind.as_str(),
            a.identifier,
            a.entity_code,
            a.role.unwrap_or_default(),
            a.display_name.unwrap_or_default()
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_accounts_add(
    db: &Database,
    tenant: &str,
    kind: &str,
    identifier: &str,
    entity: &str,
    line: Option<&str>,
    category: Option<&str>,
    role: Option<&str>,
    name: Option<&str>,
) -> Result<()> {
    let kind: AccountKind = kind
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let id = db.create_account(
        tenant, kind, identifier, name, entity, line, category, None, role,
    )?;
    println!("Created account {} mapping {} -> {}", id, identifier, entity);
    Ok(())
}
