//! Task-based model routing
//!
//! Routing is configured via `~/.config/glean/models.toml` (or the platform
//! equivalent):
//!
//! ```toml
//! [default]
//! model = "llama3.2"
//!
//! [tasks.analyze]
//! model = "qwen2.5-coder"
//! timeout_secs = 60
//!
//! [tasks.validate]
//! timeout_secs = 45
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// Default per-call timeout when neither the task config nor the tenant
/// settings override it
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// The LLM call sites, each potentially routed to a different model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Parse-plan production from a file sample
    Analyze,
    /// Transaction classification fallback
    Classify,
    /// Entity-signature extraction from corrections
    Extract,
    /// Pattern suggestion validation (both passes)
    Validate,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Classify => "classify",
            Self::Extract => "extract",
            Self::Validate => "validate",
        }
    }

    pub fn all() -> &'static [TaskType] {
        &[Self::Analyze, Self::Classify, Self::Extract, Self::Validate]
    }
}

/// Per-task overrides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DefaultSection {
    model: String,
    fallback_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RouterFile {
    default: DefaultSection,
    #[serde(default)]
    tasks: HashMap<String, TaskConfig>,
}

/// Resolved router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_model: String,
    pub fallback_model: Option<String>,
    pub tasks: HashMap<String, TaskConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_model: "llama3.2".to_string(),
            fallback_model: None,
            tasks: HashMap::new(),
        }
    }
}

/// Selects a model and timeout per task type
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    config: RouterConfig,
}

impl ModelRouter {
    /// Load the router from the platform config dir, falling back to
    /// defaults when no file exists
    pub fn new() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load the router from a specific TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: RouterFile = toml::from_str(&raw).map_err(|e| {
            crate::error::Error::InvalidData(format!("Invalid router config {}: {}", path.display(), e))
        })?;
        Ok(Self {
            config: RouterConfig {
                default_model: file.default.model,
                fallback_model: file.default.fallback_model,
                tasks: file.tasks,
            },
        })
    }

    /// Build a router around an explicit default model
    pub fn with_default_model(model: &str) -> Self {
        Self {
            config: RouterConfig {
                default_model: model.to_string(),
                ..RouterConfig::default()
            },
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The model to use for a task
    pub fn model_for_task(&self, task: TaskType) -> &str {
        self.config
            .tasks
            .get(task.as_str())
            .and_then(|t| t.model.as_deref())
            .unwrap_or(&self.config.default_model)
    }

    /// The per-call timeout for a task
    pub fn timeout_for_task(&self, task: TaskType) -> Duration {
        let secs = self
            .config
            .tasks
            .get(task.as_str())
            .and_then(|t| t.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }
}

fn config_path() -> Option<PathBuf> {
    let path = dirs::config_dir().map(|d| d.join("glean").join("models.toml"));
    if path.is_none() {
        warn!("No platform config dir; model router using defaults");
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_router() {
        let router = ModelRouter::default();
        assert_eq!(router.model_for_task(TaskType::Classify), "llama3.2");
        assert_eq!(
            router.timeout_for_task(TaskType::Classify),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_parse_router_file() {
        let toml_src = r#"
            [default]
            model = "llama3.2"
            fallback_model = "gemma3"

            [tasks.analyze]
            model = "qwen2.5-coder"
            timeout_secs = 60
        "#;
        let file: RouterFile = toml::from_str(toml_src).unwrap();
        let router = ModelRouter {
            config: RouterConfig {
                default_model: file.default.model,
                fallback_model: file.default.fallback_model,
                tasks: file.tasks,
            },
        };
        assert_eq!(router.model_for_task(TaskType::Analyze), "qwen2.5-coder");
        assert_eq!(router.model_for_task(TaskType::Validate), "llama3.2");
        assert_eq!(router.timeout_for_task(TaskType::Analyze), Duration::from_secs(60));
    }
}
