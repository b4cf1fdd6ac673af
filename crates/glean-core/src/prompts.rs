//! Prompt Library for LLM integration
//!
//! Prompts are loaded with a two-layer resolution:
//! 1. Check for override in data dir (~/.local/share/glean/prompts/overrides/)
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! This allows operators to customize prompts without modifying the source,
//! while automatically getting new default prompts on upgrade.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Embedded default prompts (compiled into binary)
mod defaults {
    pub const ANALYZE_FORMAT: &str = include_str!("../../../prompts/analyze_format.md");
    pub const CLASSIFY_TRANSACTION: &str = include_str!("../../../prompts/classify_transaction.md");
    pub const EXTRACT_SIGNATURE: &str = include_str!("../../../prompts/extract_signature.md");
    pub const VALIDATE_PATTERN: &str = include_str!("../../../prompts/validate_pattern.md");
    pub const VALIDATE_PATTERN_ENRICHED: &str =
        include_str!("../../../prompts/validate_pattern_enriched.md");
}

/// Known prompt IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptId {
    /// Produce a parse plan for a sampled raw file
    AnalyzeFormat,
    /// Classify one canonical row against the tenant's chart
    ClassifyTransaction,
    /// Extract an entity-signature pattern from corrected transactions
    ExtractSignature,
    /// Pass 1 syntactic/safety check of a pattern suggestion
    ValidatePattern,
    /// Pass 2 re-check with recurrence and conviction context
    ValidatePatternEnriched,
}

impl PromptId {
    /// Get the string identifier for this prompt
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalyzeFormat => "analyze_format",
            Self::ClassifyTransaction => "classify_transaction",
            Self::ExtractSignature => "extract_signature",
            Self::ValidatePattern => "validate_pattern",
            Self::ValidatePatternEnriched => "validate_pattern_enriched",
        }
    }

    /// Get all known prompt IDs
    pub fn all() -> &'static [PromptId] {
        &[
            Self::AnalyzeFormat,
            Self::ClassifyTransaction,
            Self::ExtractSignature,
            Self::ValidatePattern,
            Self::ValidatePatternEnriched,
        ]
    }

    /// Get the default embedded content for this prompt
    fn default_content(&self) -> &'static str {
        match self {
            Self::AnalyzeFormat => defaults::ANALYZE_FORMAT,
            Self::ClassifyTransaction => defaults::CLASSIFY_TRANSACTION,
            Self::ExtractSignature => defaults::EXTRACT_SIGNATURE,
            Self::ValidatePattern => defaults::VALIDATE_PATTERN,
            Self::ValidatePatternEnriched => defaults::VALIDATE_PATTERN_ENRICHED,
        }
    }
}

/// Prompt frontmatter metadata
#[derive(Debug, Clone, Deserialize)]
pub struct PromptMetadata {
    /// Unique identifier
    pub id: String,
    /// Version number for tracking changes
    pub version: u32,
    /// Task type for model routing (analyze, classify, extract, validate)
    pub task_type: String,
}

/// A loaded prompt with metadata and content
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Metadata from frontmatter
    pub metadata: PromptMetadata,
    /// The prompt content (system + user sections)
    pub content: String,
    /// Whether this came from an override file
    pub is_override: bool,
}

impl Prompt {
    /// Get the system section of the prompt
    pub fn system_section(&self) -> Option<&str> {
        extract_section(&self.content, "# System")
    }

    /// Get the user section of the prompt
    pub fn user_section(&self) -> Option<&str> {
        extract_section(&self.content, "# User")
    }

    /// Render the user section with template variables replaced.
    ///
    /// Mustache-style `{{var}}` replacement, plus `{{#if var}}...{{/if}}`
    /// conditional blocks dropped when the variable is absent.
    pub fn render_user(&self, vars: &HashMap<&str, &str>) -> String {
        let body = self.user_section().unwrap_or(&self.content);
        let mut result = remove_unmatched_conditionals(body, vars);
        for (key, value) in vars {
            let pattern = format!("{{{{{}}}}}", key);
            result = result.replace(&pattern, value);
        }
        result
    }
}

/// Prompt library for loading and caching prompts
pub struct PromptLibrary {
    /// Override directory path
    override_dir: Option<PathBuf>,
    /// Cached parsed prompts
    cache: HashMap<PromptId, Prompt>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptLibrary {
    /// Create a new prompt library with default paths
    pub fn new() -> Self {
        Self {
            override_dir: default_prompts_dir(),
            cache: HashMap::new(),
        }
    }

    /// Create a prompt library with no override directory (embedded only)
    pub fn embedded_only() -> Self {
        Self {
            override_dir: None,
            cache: HashMap::new(),
        }
    }

    /// Get a prompt by ID, loading from override or default
    pub fn get(&mut self, id: PromptId) -> Result<&Prompt> {
        if !self.cache.contains_key(&id) {
            let prompt = self.load(id)?;
            self.cache.insert(id, prompt);
        }
        Ok(self.cache.get(&id).unwrap())
    }

    /// Load a prompt (checking override first, then default)
    fn load(&self, id: PromptId) -> Result<Prompt> {
        if let Some(ref override_dir) = self.override_dir {
            let override_path = override_dir.join(format!("{}.md", id.as_str()));
            if override_path.exists() {
                let content = fs::read_to_string(&override_path).map_err(|e| {
                    Error::InvalidData(format!("Failed to read prompt override: {}", e))
                })?;
                let (metadata, body) = parse_prompt(&content)?;
                return Ok(Prompt {
                    metadata,
                    content: body,
                    is_override: true,
                });
            }
        }

        let content = id.default_content();
        let (metadata, body) = parse_prompt(content)?;
        Ok(Prompt {
            metadata,
            content: body,
            is_override: false,
        })
    }
}

/// Default prompts override directory under the platform data dir
fn default_prompts_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("glean").join("prompts").join("overrides"))
}

/// Split YAML frontmatter from the markdown body
fn parse_prompt(content: &str) -> Result<(PromptMetadata, String)> {
    let content = content.trim_start();
    let rest = content
        .strip_prefix("---")
        .ok_or_else(|| Error::InvalidData("Prompt missing frontmatter".to_string()))?;
    let end = rest
        .find("\n---")
        .ok_or_else(|| Error::InvalidData("Prompt frontmatter not terminated".to_string()))?;
    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim_start().to_string();

    let metadata: PromptMetadata = serde_yaml::from_str(frontmatter)
        .map_err(|e| Error::InvalidData(format!("Invalid prompt frontmatter: {}", e)))?;
    Ok((metadata, body))
}

/// Extract a `# Heading` section from the body
fn extract_section<'a>(content: &'a str, heading: &str) -> Option<&'a str> {
    let start = content.find(heading)? + heading.len();
    let rest = &content[start..];
    let end = rest.find("\n# ").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Drop `{{#if var}}...{{/if}}` blocks whose variable is not provided
fn remove_unmatched_conditionals(content: &str, vars: &HashMap<&str, &str>) -> String {
    let mut result = content.to_string();
    while let Some(start) = result.find("{{#if ") {
        let name_end = match result[start..].find("}}") {
            Some(e) => start + e,
            None => break,
        };
        let var_name = result[start + 6..name_end].trim().to_string();
        let block_end = match result[name_end..].find("{{/if}}") {
            Some(e) => name_end + e + 7,
            None => break,
        };
        if vars.contains_key(var_name.as_str()) {
            // Keep the inner content, drop the markers
            let inner = result[name_end + 2..block_end - 7].to_string();
            result.replace_range(start..block_end, &inner);
        } else {
            result.replace_range(start..block_end, "");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_defaults_parse() {
        let mut lib = PromptLibrary::embedded_only();
        for id in PromptId::all() {
            let prompt = lib.get(*id).unwrap();
            assert_eq!(prompt.metadata.id, id.as_str());
            assert!(prompt.user_section().is_some(), "{} has no User section", id.as_str());
        }
    }

    #[test]
    fn test_render_user_substitution() {
        let mut lib = PromptLibrary::embedded_only();
        let prompt = lib.get(PromptId::ClassifyTransaction).unwrap().clone();
        let mut vars = HashMap::new();
        vars.insert("description", "NETFLIX.COM");
        vars.insert("amount", "-15.99");
        vars.insert("currency", "USD");
        vars.insert("entities", "DMP, HLD");
        vars.insert("categories", "Revenue, Expenses");
        vars.insert("recent_patterns", "");
        let rendered = prompt.render_user(&vars);
        assert!(rendered.contains("NETFLIX.COM"));
        assert!(!rendered.contains("{{description}}"));
    }

    #[test]
    fn test_conditional_blocks() {
        let content = "Base. {{#if feedback}}Previous failure: {{feedback}}{{/if}} End.";
        let mut vars = HashMap::new();
        let stripped = remove_unmatched_conditionals(content, &vars);
        assert!(!stripped.contains("Previous failure"));

        vars.insert("feedback", "bad columns");
        let kept = remove_unmatched_conditionals(content, &vars);
        assert!(kept.contains("Previous failure"));
    }

    #[test]
    fn test_parse_prompt_frontmatter() {
        let content = "---\nid: test\nversion: 1\ntask_type: classify\n---\n# User\nHello";
        let (meta, body) = parse_prompt(content).unwrap();
        assert_eq!(meta.id, "test");
        assert_eq!(meta.version, 1);
        assert!(body.contains("Hello"));
    }
}
