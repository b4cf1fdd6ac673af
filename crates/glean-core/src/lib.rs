//! Glean Core Library
//!
//! Multi-tenant transaction intake and classification pipeline:
//! - Tenant context resolution with no fallback, ever
//! - Pattern Store of tenant classification rules and learned signatures
//! - LLM-driven format analysis producing declarative parse plans
//! - Ingestion engine with content-hash dedupe and enrichment
//! - Layered classifier (account map, patterns, signatures, LLM, default)
//! - Reinforcement engine turning user corrections into validated patterns
//! - Transaction Store with user-edit protection
//! - Pipeline coordinator with progress, cancellation, and resume

pub mod analyzer;
pub mod api;
pub mod blob;
pub mod classify;
pub mod db;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod plan;
pub mod prompts;
pub mod reinforce;
pub mod settings;
pub mod tenant;
pub mod text;

/// Test utilities including the mock LLM server
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use api::{ClassificationPatch, GleanCore};
pub use blob::{BlobStore, LocalBlobStore};
pub use db::{Database, JobState, TransactionFilter, TransactionPage, UpsertOutcome};
pub use error::{Error, Result};
pub use llm::{LlmBackend, LlmClient, LlmService, MockBackend, ModelRouter, TaskType};
pub use pipeline::{JobHandle, JobProgress, PipelineCoordinator};
pub use plan::{CleaningRule, ParsePlan};
pub use prompts::{Prompt, PromptId, PromptLibrary};
pub use reinforce::{ReinforcementEngine, ReinforcementOutcome};
pub use settings::TenantSettings;
