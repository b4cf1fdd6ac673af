//! HTTP backend implementation
//!
//! Client for an Ollama-compatible generate endpoint. Uses the model router
//! for task-based model selection and the prompt library for customizable
//! prompts. Each call carries the router's per-task timeout; a timed-out or
//! unreachable service surfaces as `LlmUnavailable`, which callers treat as
//! recoverable.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::EntitySignature;
use crate::plan::ParsePlan;
use crate::prompts::{PromptId, PromptLibrary};

use super::parsing::{
    parse_classification_response, parse_plan_response, parse_signature_response,
    parse_verdict_response,
};
use super::router::{ModelRouter, TaskType};
use super::types::{ClassifyRequest, LlmClassification, ValidationRequest, ValidationVerdict};
use super::LlmBackend;

/// HTTP backend with model router integration
pub struct HttpBackend {
    http_client: Client,
    base_url: String,
    router: Arc<RwLock<ModelRouter>>,
    default_model: String,
    prompts: Arc<RwLock<PromptLibrary>>,
}

impl Clone for HttpBackend {
    fn clone(&self) -> Self {
        Self {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            router: self.router.clone(),
            default_model: self.default_model.clone(),
            prompts: self.prompts.clone(),
        }
    }
}

impl HttpBackend {
    /// Create a new HTTP backend
    pub fn new(base_url: &str, default_model: &str) -> Self {
        let router = ModelRouter::new().unwrap_or_default();
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            router: Arc::new(RwLock::new(router)),
            default_model: default_model.to_string(),
            prompts: Arc::new(RwLock::new(PromptLibrary::new())),
        }
    }

    /// Create with a custom router
    pub fn with_router(base_url: &str, default_model: &str, router: ModelRouter) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            router: Arc::new(RwLock::new(router)),
            default_model: default_model.to_string(),
            prompts: Arc::new(RwLock::new(PromptLibrary::new())),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("LLM_HOST").ok()?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "llama3.2".to_string());
        Some(Self::new(&host, &model))
    }

    /// Render a prompt's user section with variables
    fn render(&self, id: PromptId, vars: &HashMap<&str, &str>) -> Result<String> {
        let mut prompts = self
            .prompts
            .write()
            .map_err(|_| Error::InvalidData("Failed to acquire prompt library lock".into()))?;
        let template = prompts.get(id)?;
        Ok(template.render_user(vars))
    }

    /// Issue one generate call under the task's model and timeout
    async fn generate(&self, task: TaskType, prompt: String) -> Result<String> {
        let (model, timeout) = {
            let router = self
                .router
                .read()
                .map_err(|_| Error::InvalidData("Failed to acquire router lock".into()))?;
            // A task-specific override wins; otherwise the backend's model
            let model = router
                .config()
                .tasks
                .get(task.as_str())
                .and_then(|t| t.model.clone())
                .unwrap_or_else(|| self.default_model.clone());
            (model, router.timeout_for_task(task))
        };

        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
        };

        let send = self
            .http_client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send();

        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| {
                Error::LlmUnavailable(format!(
                    "{} call timed out after {:?}",
                    task.as_str(),
                    timeout
                ))
            })?
            .map_err(|e| Error::LlmUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::LlmUnavailable(format!(
                "{} returned status {}",
                self.base_url,
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::LlmInvalidResponse(e.to_string()))?;
        debug!(task = task.as_str(), "LLM response: {}", body.response);
        Ok(body.response)
    }
}

/// Request to the generate endpoint
#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
}

/// Response from the generate endpoint
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl LlmBackend for HttpBackend {
    async fn analyze_format(
        &self,
        sample: &str,
        row_count: usize,
        feedback: Option<&str>,
    ) -> Result<ParsePlan> {
        let row_count_str = row_count.to_string();
        let mut vars = HashMap::new();
        vars.insert("sample", sample);
        vars.insert("row_count", row_count_str.as_str());
        if let Some(fb) = feedback {
            vars.insert("feedback", fb);
        }
        let prompt = self.render(PromptId::AnalyzeFormat, &vars)?;
        let response = self.generate(TaskType::Analyze, prompt).await?;
        parse_plan_response(&response)
    }

    async fn classify_transaction(&self, request: &ClassifyRequest) -> Result<LlmClassification> {
        let entities = request.entities.join(", ");
        let categories = request.categories.join(", ");
        let recent = request.recent_patterns.join("\n");

        let mut vars = HashMap::new();
        vars.insert("description", request.description.as_str());
        vars.insert("amount", request.amount.as_str());
        vars.insert("currency", request.currency.as_str());
        vars.insert("entities", entities.as_str());
        vars.insert("categories", categories.as_str());
        if let Some(ref origin) = request.origin {
            vars.insert("origin", origin.as_str());
        }
        if let Some(ref destination) = request.destination {
            vars.insert("destination", destination.as_str());
        }
        if let Some(ref account) = request.account_identifier {
            vars.insert("account_identifier", account.as_str());
        }
        if !recent.is_empty() {
            vars.insert("recent_patterns", recent.as_str());
        }

        let prompt = self.render(PromptId::ClassifyTransaction, &vars)?;
        let response = self.generate(TaskType::Classify, prompt).await?;
        parse_classification_response(&response)
    }

    async fn extract_signature(
        &self,
        entity_code: &str,
        descriptions: &[String],
    ) -> Result<EntitySignature> {
        let listing = descriptions
            .iter()
            .map(|d| format!("- {}", d))
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars = HashMap::new();
        vars.insert("entity", entity_code);
        vars.insert("descriptions", listing.as_str());

        let prompt = self.render(PromptId::ExtractSignature, &vars)?;
        let response = self.generate(TaskType::Extract, prompt).await?;
        parse_signature_response(&response)
    }

    async fn validate_suggestion(&self, request: &ValidationRequest) -> Result<ValidationVerdict> {
        let matching = request
            .matching_samples
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n");
        let non_matching = request
            .non_matching_samples
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars = HashMap::new();
        vars.insert("entity", request.entity_code.as_str());
        vars.insert("kind", request.kind.as_str());
        vars.insert("body", request.body.as_str());
        vars.insert("matching_samples", matching.as_str());

        let response = match &request.enrichment {
            None => {
                vars.insert("non_matching_samples", non_matching.as_str());
                let prompt = self.render(PromptId::ValidatePattern, &vars)?;
                self.generate(TaskType::Validate, prompt).await?
            }
            Some(enr) => {
                let occurrence = enr.occurrence_count.to_string();
                let corrections = enr.correction_count.to_string();
                let cv = enr
                    .amount_cv
                    .map(|v| format!("{:.3}", v))
                    .unwrap_or_else(|| "unknown".to_string());
                vars.insert("rejection_reason", enr.rejection_reason.as_str());
                vars.insert("occurrence_count", occurrence.as_str());
                vars.insert("first_seen", enr.first_seen.as_str());
                vars.insert("last_seen", enr.last_seen.as_str());
                vars.insert("frequency_class", enr.frequency_class.as_str());
                vars.insert("amount_cv", cv.as_str());
                vars.insert("correction_count", corrections.as_str());
                let prompt = self.render(PromptId::ValidatePatternEnriched, &vars)?;
                self.generate(TaskType::Validate, prompt).await?
            }
        };

        parse_verdict_response(&response)
    }

    async fn health_check(&self) -> bool {
        match self
            .http_client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn model(&self) -> &str {
        &self.default_model
    }

    fn host(&self) -> &str {
        &self.base_url
    }
}
