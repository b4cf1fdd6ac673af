//! Test utilities for glean-core
//!
//! This module provides testing infrastructure including a mock LLM server
//! that speaks the generate-endpoint protocol, so integration tests can
//! exercise the real `HttpBackend` end to end and assert on call counts.

use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::llm::plan_from_sample;
use crate::text::signal_tokens;

/// Per-operation call counters, shared with the test body
#[derive(Default)]
pub struct MockLlmCounts {
    pub analyze: AtomicUsize,
    pub classify: AtomicUsize,
    pub extract: AtomicUsize,
    pub validate: AtomicUsize,
}

/// Mock LLM server for integration tests
pub struct MockLlmServer {
    addr: SocketAddr,
    counts: Arc<MockLlmCounts>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockLlmServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        let counts = Arc::new(MockLlmCounts::default());
        let app = Router::new()
            .route("/api/tags", get(handle_tags))
            .route("/api/generate", post(handle_generate))
            .with_state(counts.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            counts,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn analyze_calls(&self) -> usize {
        self.counts.analyze.load(Ordering::SeqCst)
    }

    pub fn classify_calls(&self) -> usize {
        self.counts.classify.load(Ordering::SeqCst)
    }

    pub fn extract_calls(&self) -> usize {
        self.counts.extract.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.counts.validate.load(Ordering::SeqCst)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockLlmServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tags endpoint response (health check)
async fn handle_tags() -> Json<TagsResponse> {
    Json(TagsResponse {
        models: vec![ModelInfo {
            name: "llama3.2:latest".to_string(),
            modified_at: "2024-01-01T00:00:00Z".to_string(),
            size: 4_000_000_000,
        }],
    })
}

/// Generate endpoint: detect the request type from the prompt shape.
/// These markers match the prompt files in prompts/*.md.
async fn handle_generate(
    State(counts): State<Arc<MockLlmCounts>>,
    Json(request): Json<GenerateRequest>,
) -> Json<GenerateResponse> {
    let prompt = &request.prompt;

    let response = if prompt.contains("Produce a") && prompt.contains("parse plan") {
        counts.analyze.fetch_add(1, Ordering::SeqCst);
        handle_analyze_mock(prompt)
    } else if prompt.contains("Classify this transaction.") {
        counts.classify.fetch_add(1, Ordering::SeqCst);
        handle_classify_mock(prompt)
    } else if prompt.contains("Extract a signature") {
        counts.extract.fetch_add(1, Ordering::SeqCst);
        handle_extract_mock(prompt)
    } else if prompt.contains("Given this evidence") {
        counts.validate.fetch_add(1, Ordering::SeqCst);
        handle_validate_pass2_mock(prompt)
    } else if prompt.contains("Would this rule correctly separate") {
        counts.validate.fetch_add(1, Ordering::SeqCst);
        handle_validate_pass1_mock(prompt)
    } else {
        // Unknown prompt shape: an empty body exercises the callers'
        // invalid-response handling
        String::new()
    };

    Json(GenerateResponse {
        model: request.model,
        response,
        done: true,
    })
}

/// Analyze: run the header heuristic over the sample block
fn handle_analyze_mock(prompt: &str) -> String {
    // The sample block follows the "Sample (N rows):" line; row indices in
    // the produced plan must line up with the block's own line numbering
    let sample = match prompt.find("rows):") {
        Some(pos) => prompt[pos..]
            .splitn(2, '\n')
            .nth(1)
            .unwrap_or("")
            .trim_start_matches('\n'),
        None => "",
    };
    match plan_from_sample(sample) {
        Ok(plan) => serde_json::to_string(&plan).unwrap(),
        Err(_) => r#"{"error": "no header found"}"#.to_string(),
    }
}

/// Classify: an entity code appearing in the description wins
fn handle_classify_mock(prompt: &str) -> String {
    let description = extract_quoted(prompt, "Description: \"").unwrap_or_default();
    let entities = extract_line(prompt, "Valid entity codes: ")
        .map(|l| {
            l.split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let categories = extract_line(prompt, "Valid accounting categories: ")
        .map(|l| {
            l.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let desc_upper = description.to_uppercase();
    match entities.iter().find(|e| desc_upper.contains(&e.to_uppercase())) {
        Some(entity) => format!(
            r#"{{"entity": "{}", "business_line": "", "category": "{}", "subcategory": "", "justification": "entity code in description", "confidence": 0.85, "reasoning": "mock"}}"#,
            entity,
            categories.first().cloned().unwrap_or_else(|| "Uncategorized".to_string())
        ),
        None => r#"{"entity": "", "business_line": "", "category": "Uncategorized", "subcategory": "", "justification": "no evidence", "confidence": 0.3, "reasoning": "mock"}"#.to_string(),
    }
}

/// Extract: tokens shared by every listed description become keywords
fn handle_extract_mock(prompt: &str) -> String {
    let descriptions: Vec<&str> = prompt
        .lines()
        .filter_map(|l| l.strip_prefix("- "))
        .collect();

    let mut common: Option<Vec<String>> = None;
    for desc in &descriptions {
        let tokens = signal_tokens(desc);
        common = Some(match common {
            None => tokens,
            Some(prev) => prev.into_iter().filter(|t| tokens.contains(t)).collect(),
        });
    }
    let keywords = common.unwrap_or_default();
    serde_json::to_string(&serde_json::json!({
        "company_names": [],
        "keywords": keywords,
        "bank_identifiers": [],
        "originator_hints": [],
        "payment_method_types": [],
    }))
    .unwrap()
}

/// Pass 1: reject bodies that are too short or hit a non-matching sample
fn handle_validate_pass1_mock(prompt: &str) -> String {
    let body = extract_line(prompt, "Body: ").unwrap_or_default();
    let body_upper = body.to_uppercase();

    let non_matching: Vec<&str> = prompt
        .split("must NOT match:")
        .nth(1)
        .unwrap_or("")
        .lines()
        .filter_map(|l| l.strip_prefix("- "))
        .collect();

    let too_short = body.trim().len() < 4;
    let hits = non_matching
        .iter()
        .any(|s| s.to_uppercase().contains(&body_upper));

    if too_short || hits {
        r#"{"approved": false, "reason": "pattern would over-match"}"#.to_string()
    } else {
        r#"{"approved": true, "reason": "separates samples cleanly"}"#.to_string()
    }
}

/// Pass 2: approve on recurrence or user conviction
fn handle_validate_pass2_mock(prompt: &str) -> String {
    let recurrence = extract_line(prompt, "Recurrence: ").unwrap_or_default();
    let conviction: i64 = extract_line(prompt, "Manual user classifications to this target: ")
        .and_then(|l| l.trim().parse().ok())
        .unwrap_or(0);

    if recurrence != "irregular" || conviction >= 15 {
        r#"{"approved": true, "reason": "recurrence and conviction support the rule"}"#.to_string()
    } else {
        r#"{"approved": false, "reason": "evidence too weak"}"#.to_string()
    }
}

/// Text after `marker` up to end of line
fn extract_line(prompt: &str, marker: &str) -> Option<String> {
    let start = prompt.find(marker)? + marker.len();
    let rest = &prompt[start..];
    let end = rest.find('\n').unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

/// Text after `marker` up to the closing quote
fn extract_quoted(prompt: &str, marker: &str) -> Option<String> {
    let start = prompt.find(marker)? + marker.len();
    let rest = &prompt[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

// Request/Response types for the mock server

#[derive(Debug, Serialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    name: String,
    modified_at: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[allow(dead_code)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    model: String,
    response: String,
    done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{HttpBackend, LlmBackend};

    #[tokio::test]
    async fn test_mock_server_health_check() {
        let server = MockLlmServer::start().await;
        let client = HttpBackend::new(&server.url(), "test-model");
        assert!(client.health_check().await);
    }

    #[tokio::test]
    async fn test_mock_server_analyze() {
        let server = MockLlmServer::start().await;
        let client = HttpBackend::new(&server.url(), "test-model");

        let sample = "junk\nDate,Description,Amount\n2024-01-01,TEST,1.00";
        let plan = client.analyze_format(sample, 3, None).await.unwrap();
        assert_eq!(plan.header_row_index, 1);
        assert_eq!(server.analyze_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_server_classify() {
        let server = MockLlmServer::start().await;
        let client = HttpBackend::new(&server.url(), "test-model");

        let request = crate::llm::ClassifyRequest {
            description: "DMP PAYOUT".to_string(),
            amount: "10".to_string(),
            currency: "USD".to_string(),
            entities: vec!["DMP".to_string()],
            categories: vec!["Revenue".to_string()],
            ..Default::default()
        };
        let cls = client.classify_transaction(&request).await.unwrap();
        assert_eq!(cls.entity.as_deref(), Some("DMP"));
        assert_eq!(cls.category, "Revenue");
        assert_eq!(server.classify_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_server_validate_pass1() {
        let server = MockLlmServer::start().await;
        let client = HttpBackend::new(&server.url(), "test-model");

        let request = crate::llm::ValidationRequest {
            entity_code: "DMP".to_string(),
            kind: "token_bag".to_string(),
            body: "EVERMINER".to_string(),
            matching_samples: vec!["EVERMINER PAYOUT".to_string()],
            non_matching_samples: vec!["OFFICE RENT".to_string()],
            enrichment: None,
        };
        let verdict = client.validate_suggestion(&request).await.unwrap();
        assert!(verdict.approved);
        assert_eq!(server.validate_calls(), 1);
    }
}
