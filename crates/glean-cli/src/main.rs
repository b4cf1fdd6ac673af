//! Glean CLI - transaction intake and classification pipeline
//!
//! Usage:
//!   glean init                                Initialize database
//!   glean tenants add acme "Acme Corp"        Onboard a tenant
//!   glean -t acme import --file export.csv    Analyze, ingest, classify
//!   glean -t acme transactions list           Inspect the ledger
//!   glean -t acme correct 42 --entity DMP     Teach the classifier

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match &cli.command {
        Commands::Init => commands::cmd_init(&cli),
        Commands::Tenants { action } => {
            let db = commands::open_db(&cli)?;
            match action {
                None | Some(TenantsAction::List) => commands::cmd_tenants_list(&db),
                Some(TenantsAction::Add {
                    id,
                    name,
                    industry,
                    currency,
                }) => commands::cmd_tenants_add(&db, id, name, industry.as_deref(), currency),
            }
        }
        Commands::Entities { action } => {
            let db = commands::open_db(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            match action {
                None | Some(EntitiesAction::List) => commands::cmd_entities_list(&db, &tenant),
                Some(EntitiesAction::Add { code, name, currency }) => {
                    commands::cmd_entities_add(&db, &tenant, code, name, currency)
                }
                Some(EntitiesAction::AddLine {
                    entity,
                    code,
                    name,
                    default,
                }) => commands::cmd_entities_add_line(&db, &tenant, entity, code, name, *default),
            }
        }
        Commands::Categories { action } => {
            let db = commands::open_db(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            match action {
                None | Some(CategoriesAction::List) => commands::cmd_categories_list(&db, &tenant),
                Some(CategoriesAction::Add { name }) => {
                    commands::cmd_categories_add(&db, &tenant, name)
                }
            }
        }
        Commands::Accounts { action } => {
            let db = commands::open_db(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            match action {
                None | Some(AccountsAction::List) => commands::cmd_accounts_list(&db, &tenant),
                Some(AccountsAction::Add {
                    kind,
                    identifier,
                    entity,
                    line,
                    category,
                    role,
                    name,
                }) => commands::cmd_accounts_add(
                    &db,
                    &tenant,
                    kind,
                    identifier,
                    entity,
                    line.as_deref(),
                    category.as_deref(),
                    role.as_deref(),
                    name.as_deref(),
                ),
            }
        }
        Commands::Submit { file } => {
            let core = commands::open_core(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            commands::cmd_submit(&core, &tenant, file)
        }
        Commands::Import { file, file_id } => {
            let core = commands::open_core(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            commands::cmd_import(&core, &tenant, file.as_deref(), *file_id).await
        }
        Commands::Resume { file_id } => {
            let core = commands::open_core(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            commands::cmd_resume(&core, &tenant, *file_id).await
        }
        Commands::Jobs { action } => {
            let core = commands::open_core(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            match action {
                JobsAction::Status { job_id } => commands::cmd_job_status(&core, &tenant, *job_id),
                JobsAction::Rejected { job_id } => {
                    commands::cmd_job_rejected(&core, &tenant, *job_id)
                }
            }
        }
        Commands::Transactions { action } => {
            let core = commands::open_core(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            match action {
                None => commands::cmd_transactions_list(&core, &tenant, 20, false, None),
                Some(TransactionsAction::List {
                    limit,
                    needs_review,
                    search,
                }) => commands::cmd_transactions_list(
                    &core,
                    &tenant,
                    *limit,
                    *needs_review,
                    search.as_deref(),
                ),
                Some(TransactionsAction::Show { transaction_id }) => {
                    commands::cmd_transactions_show(&core, &tenant, *transaction_id)
                }
            }
        }
        Commands::Correct {
            transaction_id,
            entity,
            line,
            category,
            subcategory,
            justification,
            user,
        } => {
            let core = commands::open_core(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            commands::cmd_correct(
                &core,
                &tenant,
                *transaction_id,
                entity.clone(),
                line.clone(),
                category.clone(),
                subcategory.clone(),
                justification.clone(),
                user,
            )
            .await
        }
        Commands::Patterns { action } => {
            let core = commands::open_core(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            match action {
                None => commands::cmd_patterns_list(&core, &tenant, None, None),
                Some(PatternsAction::List { kind, entity }) => {
                    commands::cmd_patterns_list(&core, &tenant, kind.as_deref(), entity.as_deref())
                }
                Some(PatternsAction::Deactivate { pattern_id, user }) => {
                    commands::cmd_patterns_deactivate(&core, &tenant, *pattern_id, user)
                }
            }
        }
        Commands::Suggestions { status } => {
            let db = commands::open_db(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            commands::cmd_suggestions(&db, &tenant, status.as_deref())
        }
        Commands::Status => {
            let db = commands::open_db(&cli)?;
            let tenant = commands::require_tenant(&cli)?;
            commands::cmd_status(&db, &tenant)
        }
    }
}
