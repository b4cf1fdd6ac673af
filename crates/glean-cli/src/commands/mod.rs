//! Command implementations

mod admin;
mod import;
mod transactions;

pub use admin::*;
pub use import::*;
pub use transactions::*;

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use glean_core::{Database, GleanCore, LlmClient, LocalBlobStore};

use crate::cli::Cli;

/// Open the database, encrypted unless --no-encrypt was passed
pub fn open_db(cli: &Cli) -> Result<Database> {
    let db = if cli.no_encrypt {
        Database::new_unencrypted(&cli.db)?
    } else {
        Database::new(&cli.db)?
    };
    Ok(db)
}

/// Assemble the full core (database, blob store, LLM client)
pub fn open_core(cli: &Cli) -> Result<GleanCore> {
    let db = open_db(cli)?;
    let blob = Arc::new(LocalBlobStore::default_location()?);
    let llm = LlmClient::from_env().ok_or_else(|| {
        anyhow!(
            "No LLM backend configured. Set LLM_HOST (and optionally LLM_MODEL), \
             or LLM_BACKEND=mock for offline testing."
        )
    })?;
    Ok(GleanCore::new(db, blob, llm))
}

/// The acting tenant, from --tenant only. There is no environment fallback
/// and no default: a missing tenant is an error here, before any core call.
pub fn require_tenant(cli: &Cli) -> Result<String> {
    cli.tenant
        .clone()
        .filter(|t| !t.trim().is_empty())
        .context("This command is tenant-scoped; pass --tenant <ID>")
}

pub fn cmd_init(cli: &Cli) -> Result<()> {
    let db = open_db(cli)?;
    println!("Database initialized at {}", db.path());
    if cli.no_encrypt {
        println!("WARNING: database is unencrypted");
    }
    Ok(())
}
