//! Pluggable LLM backend abstraction
//!
//! The LLM is an oracle, not an authority: every response is validated
//! against a strict JSON schema, and classification output is additionally
//! checked against the tenant's enumerated entities and categories at the
//! call site.
//!
//! # Architecture
//!
//! - `LlmBackend` trait: defines the interface for the four call sites
//!   (analyze, classify, extract, validate)
//! - `LlmClient` enum: concrete wrapper providing Clone + compile-time
//!   dispatch
//! - `LlmService`: the shared, rate-limited entry point jobs actually use;
//!   enforces the per-tenant concurrency ceiling, the global pool, and
//!   retry with backoff + jitter
//!
//! # Configuration
//!
//! Environment variables:
//! - `LLM_BACKEND`: Backend to use (http, mock). Default: http
//! - `LLM_HOST`: Generate-endpoint base URL (required for http backend)
//! - `LLM_MODEL`: Default model name (default: llama3.2)

mod http;
mod limiter;
mod mock;
pub mod parsing;
pub mod router;
pub mod types;

pub use http::HttpBackend;
pub use limiter::{backoff_delay, LlmLimiter, LlmPermit};
pub use mock::MockBackend;
#[cfg(any(test, feature = "test-utils"))]
pub(crate) use mock::plan_from_sample;
pub use router::{ModelRouter, RouterConfig, TaskConfig, TaskType};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::EntitySignature;
use crate::plan::ParsePlan;

/// Trait defining the interface for all LLM backends
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Produce a parse plan from a bounded sample of a raw file
    async fn analyze_format(
        &self,
        sample: &str,
        row_count: usize,
        feedback: Option<&str>,
    ) -> Result<ParsePlan>;

    /// Classify one canonical row against the tenant's chart
    async fn classify_transaction(&self, request: &ClassifyRequest) -> Result<LlmClassification>;

    /// Extract an entity-signature pattern from corrected descriptions
    async fn extract_signature(
        &self,
        entity_code: &str,
        descriptions: &[String],
    ) -> Result<EntitySignature>;

    /// Validate a pattern suggestion (Pass 1, or Pass 2 when enriched)
    async fn validate_suggestion(&self, request: &ValidationRequest) -> Result<ValidationVerdict>;

    /// Check if the backend is available
    async fn health_check(&self) -> bool;

    /// Get the model name (for logging)
    fn model(&self) -> &str;

    /// Get the host URL (for logging)
    fn host(&self) -> &str;
}

/// Concrete LLM client enum
///
/// Provides Clone and compile-time dispatch without Box<dyn> overhead.
#[derive(Clone)]
pub enum LlmClient {
    /// HTTP backend (Ollama-compatible generate endpoint)
    Http(HttpBackend),
    /// Mock backend for testing
    Mock(MockBackend),
}

impl LlmClient {
    /// Create an LLM client from environment variables
    ///
    /// Returns None if the required environment variables are not set.
    pub fn from_env() -> Option<Self> {
        let backend = std::env::var("LLM_BACKEND").unwrap_or_else(|_| "http".to_string());
        match backend.to_lowercase().as_str() {
            "http" | "ollama" => HttpBackend::from_env().map(LlmClient::Http),
            "mock" => Some(LlmClient::Mock(MockBackend::new())),
            _ => {
                warn!(backend = %backend, "Unknown LLM_BACKEND, falling back to http");
                HttpBackend::from_env().map(LlmClient::Http)
            }
        }
    }

    /// Create an HTTP backend directly
    pub fn http(host: &str, model: &str) -> Self {
        LlmClient::Http(HttpBackend::new(host, model))
    }

    /// Create a mock backend for testing
    pub fn mock() -> Self {
        LlmClient::Mock(MockBackend::new())
    }
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn analyze_format(
        &self,
        sample: &str,
        row_count: usize,
        feedback: Option<&str>,
    ) -> Result<ParsePlan> {
        match self {
            LlmClient::Http(b) => b.analyze_format(sample, row_count, feedback).await,
            LlmClient::Mock(b) => b.analyze_format(sample, row_count, feedback).await,
        }
    }

    async fn classify_transaction(&self, request: &ClassifyRequest) -> Result<LlmClassification> {
        match self {
            LlmClient::Http(b) => b.classify_transaction(request).await,
            LlmClient::Mock(b) => b.classify_transaction(request).await,
        }
    }

    async fn extract_signature(
        &self,
        entity_code: &str,
        descriptions: &[String],
    ) -> Result<EntitySignature> {
        match self {
            LlmClient::Http(b) => b.extract_signature(entity_code, descriptions).await,
            LlmClient::Mock(b) => b.extract_signature(entity_code, descriptions).await,
        }
    }

    async fn validate_suggestion(&self, request: &ValidationRequest) -> Result<ValidationVerdict> {
        match self {
            LlmClient::Http(b) => b.validate_suggestion(request).await,
            LlmClient::Mock(b) => b.validate_suggestion(request).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            LlmClient::Http(b) => b.health_check().await,
            LlmClient::Mock(b) => b.health_check().await,
        }
    }

    fn model(&self) -> &str {
        match self {
            LlmClient::Http(b) => b.model(),
            LlmClient::Mock(b) => b.model(),
        }
    }

    fn host(&self) -> &str {
        match self {
            LlmClient::Http(b) => b.host(),
            LlmClient::Mock(b) => b.host(),
        }
    }
}

/// Transient-failure retries before giving up on a call
const MAX_RETRIES: u32 = 2;

/// The shared, rate-limited LLM entry point.
///
/// Every job goes through one `LlmService`; the limiter makes excess calls
/// wait rather than fail, and transient failures are retried with backoff
/// and jitter before surfacing `LlmUnavailable`.
#[derive(Clone)]
pub struct LlmService {
    client: LlmClient,
    limiter: Arc<LlmLimiter>,
}

impl LlmService {
    pub fn new(client: LlmClient) -> Self {
        Self {
            client,
            limiter: Arc::new(LlmLimiter::default()),
        }
    }

    pub fn with_limiter(client: LlmClient, limiter: LlmLimiter) -> Self {
        Self {
            client,
            limiter: Arc::new(limiter),
        }
    }

    pub fn client(&self) -> &LlmClient {
        &self.client
    }

    pub async fn analyze_format(
        &self,
        tenant_id: &str,
        sample: &str,
        row_count: usize,
        feedback: Option<&str>,
    ) -> Result<ParsePlan> {
        let _permit = self.limiter.acquire(tenant_id).await;
        self.retrying(|| self.client.analyze_format(sample, row_count, feedback))
            .await
    }

    pub async fn classify_transaction(
        &self,
        tenant_id: &str,
        request: &ClassifyRequest,
    ) -> Result<LlmClassification> {
        let _permit = self.limiter.acquire(tenant_id).await;
        self.retrying(|| self.client.classify_transaction(request)).await
    }

    pub async fn extract_signature(
        &self,
        tenant_id: &str,
        entity_code: &str,
        descriptions: &[String],
    ) -> Result<EntitySignature> {
        let _permit = self.limiter.acquire(tenant_id).await;
        self.retrying(|| self.client.extract_signature(entity_code, descriptions))
            .await
    }

    pub async fn validate_suggestion(
        &self,
        tenant_id: &str,
        request: &ValidationRequest,
    ) -> Result<ValidationVerdict> {
        let _permit = self.limiter.acquire(tenant_id).await;
        self.retrying(|| self.client.validate_suggestion(request)).await
    }

    /// Retry transient failures; invalid responses are never retried, the
    /// caller decides how to degrade.
    async fn retrying<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(Error::LlmUnavailable(msg)) if attempt < MAX_RETRIES => {
                    let delay = backoff_delay(attempt);
                    warn!(attempt, %msg, "LLM call failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
