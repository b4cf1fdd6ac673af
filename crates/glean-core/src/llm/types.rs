//! LLM backend request/response types
//!
//! These types are backend-agnostic and used across all LLM implementations.

use serde::{Deserialize, Serialize};

/// Context handed to the classification fallback
#[derive(Debug, Clone, Default)]
pub struct ClassifyRequest {
    pub description: String,
    pub amount: String,
    pub currency: String,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub account_identifier: Option<String>,
    /// The tenant's enumerated entity codes
    pub entities: Vec<String>,
    /// The tenant's enumerated accounting categories
    pub categories: Vec<String>,
    /// Short list of the tenant's most-applied recent patterns
    pub recent_patterns: Vec<String>,
}

/// Raw classification returned by the model, before enumeration validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmClassification {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub business_line: Option<String>,
    pub category: String,
    #[serde(default)]
    pub subcategory: String,
    #[serde(default)]
    pub justification: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Context for a suggestion validation call (Pass 1, and Pass 2 when
/// `enrichment` is present)
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub entity_code: String,
    pub kind: String,
    pub body: String,
    pub matching_samples: Vec<String>,
    pub non_matching_samples: Vec<String>,
    pub enrichment: Option<ValidationEnrichment>,
}

/// The extra evidence Pass 2 carries
#[derive(Debug, Clone)]
pub struct ValidationEnrichment {
    pub rejection_reason: String,
    pub occurrence_count: i64,
    pub first_seen: String,
    pub last_seen: String,
    pub frequency_class: String,
    pub amount_cv: Option<f64>,
    pub correction_count: i64,
}

/// Verdict of a validation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
}
