//! CLI argument definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "glean")]
#[command(about = "Multi-tenant transaction intake and classification pipeline")]
#[command(version)]
pub struct Cli {
    /// Path to the database file
    #[arg(long, global = true, default_value = "glean.db")]
    pub db: String,

    /// Acting tenant id. Required for every tenant-scoped command; there is
    /// no default and no fallback.
    #[arg(short, long, global = true)]
    pub tenant: Option<String>,

    /// Use an unencrypted database (not recommended for production)
    #[arg(long, global = true)]
    pub no_encrypt: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Tenant administration
    Tenants {
        #[command(subcommand)]
        action: Option<TenantsAction>,
    },

    /// Legal entities and business lines for the acting tenant
    Entities {
        #[command(subcommand)]
        action: Option<EntitiesAction>,
    },

    /// Accounting categories for the acting tenant
    Categories {
        #[command(subcommand)]
        action: Option<CategoriesAction>,
    },

    /// Known funding sources (bank accounts and wallets)
    Accounts {
        #[command(subcommand)]
        action: Option<AccountsAction>,
    },

    /// Upload a statement file without ingesting it
    Submit {
        /// Path to the statement file
        #[arg(long)]
        file: String,
    },

    /// Upload (if needed) and ingest a statement file
    Import {
        /// Path to the statement file
        #[arg(long, conflicts_with = "file_id")]
        file: Option<String>,
        /// Previously submitted raw file id
        #[arg(long)]
        file_id: Option<i64>,
    },

    /// Resume a partially ingested file
    Resume {
        /// Raw file id to resume
        #[arg(long)]
        file_id: i64,
    },

    /// Ingest job inspection
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Transaction queries
    Transactions {
        #[command(subcommand)]
        action: Option<TransactionsAction>,
    },

    /// Correct a transaction's classification (feeds the learning loop)
    Correct {
        /// Transaction id
        transaction_id: i64,
        /// Target entity code
        #[arg(long)]
        entity: Option<String>,
        /// Target business line code
        #[arg(long)]
        line: Option<String>,
        /// Target accounting category
        #[arg(long)]
        category: Option<String>,
        /// Target subcategory
        #[arg(long)]
        subcategory: Option<String>,
        /// Free-text justification
        #[arg(long)]
        justification: Option<String>,
        /// Acting user id recorded on the correction
        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Pattern store inspection and administration
    Patterns {
        #[command(subcommand)]
        action: Option<PatternsAction>,
    },

    /// Pattern suggestions awaiting or past validation
    Suggestions {
        /// Filter by status (pending, approved, rejected, ...)
        #[arg(long)]
        status: Option<String>,
    },

    /// Overview of the acting tenant's data
    Status,
}

#[derive(Subcommand)]
pub enum TenantsAction {
    /// List tenants
    List,
    /// Create a tenant
    Add {
        /// Opaque tenant id (short string)
        id: String,
        /// Display name
        name: String,
        /// Industry tag
        #[arg(long)]
        industry: Option<String>,
        /// Default currency
        #[arg(long, default_value = "USD")]
        currency: String,
    },
}

#[derive(Subcommand)]
pub enum EntitiesAction {
    /// List legal entities
    List,
    /// Create a legal entity
    Add {
        /// Short code (e.g. DMP)
        code: String,
        /// Display name
        name: String,
        /// Base currency
        #[arg(long, default_value = "USD")]
        currency: String,
    },
    /// Create a business line under an entity
    AddLine {
        /// Owning entity code
        entity: String,
        /// Line code
        code: String,
        /// Line name
        name: String,
        /// Mark as the entity's default line
        #[arg(long)]
        default: bool,
    },
}

#[derive(Subcommand)]
pub enum CategoriesAction {
    /// List categories
    List,
    /// Add a category to the tenant's enumeration
    Add {
        /// Category name
        name: String,
    },
}

#[derive(Subcommand)]
pub enum AccountsAction {
    /// List accounts
    List,
    /// Register an account mapping
    Add {
        /// Account kind: bank or wallet
        kind: String,
        /// Identifier (masked number suffix or wallet address)
        identifier: String,
        /// Mapped entity code
        entity: String,
        /// Mapped business line code
        #[arg(long)]
        line: Option<String>,
        /// Default accounting category for matched rows
        #[arg(long)]
        category: Option<String>,
        /// Role tag (e.g. mining for receiving wallets)
        #[arg(long)]
        role: Option<String>,
        /// Friendly display name
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum JobsAction {
    /// Show a job's progress
    Status {
        /// Job id
        job_id: i64,
    },
    /// Show a job's rejected-row diagnostics
    Rejected {
        /// Job id
        job_id: i64,
    },
}

#[derive(Subcommand)]
pub enum TransactionsAction {
    /// List transactions
    List {
        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Only rows flagged for review
        #[arg(long)]
        needs_review: bool,
        /// Substring search over descriptions
        #[arg(long)]
        search: Option<String>,
    },
    /// Show one transaction in full
    Show {
        /// Transaction id
        transaction_id: i64,
    },
}

#[derive(Subcommand)]
pub enum PatternsAction {
    /// List patterns
    List {
        /// Filter by kind (substring, regex, token_bag, entity_signature, account_map)
        #[arg(long)]
        kind: Option<String>,
        /// Filter by entity code
        #[arg(long)]
        entity: Option<String>,
    },
    /// Soft-deactivate a pattern
    Deactivate {
        /// Pattern id
        pattern_id: i64,
        /// Acting user id
        #[arg(long, default_value = "cli")]
        user: String,
    },
}
