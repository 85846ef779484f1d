use crate::processors;
use anyhow::{Context, Result};
use flowsmith_core::{
    EventBus, ExecutionConfig, ExecutionEngine, ExecutionMode, NodeType, NodeTypeStatus,
    RetryPolicy, DEFAULT_PLAN_RETENTION,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub execution: ExecutionSection,

    #[serde(default)]
    pub node_types: NodeTypesSection,

    #[serde(default)]
    pub processors: ProcessorsSection,
}

/// Defaults applied when a request carries no execution config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retry: RetrySection,

    /// Finished executions kept for lookup; the oldest are dropped first
    #[serde(default = "default_retained_plans")]
    pub retained_plans: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Support levels reported to the validator, by node type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTypesSection {
    #[serde(default)]
    pub deprecated: Vec<NodeType>,

    #[serde(default)]
    pub experimental: Vec<NodeType>,

    /// Rejected by validation
    #[serde(default)]
    pub disabled: Vec<NodeType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorsSection {
    /// Answer every non-input/output node with its resolved config
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_retained_plans() -> usize {
    DEFAULT_PLAN_RETENTION
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_dry_run() -> bool {
    true
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_timeout_ms(),
            retry: RetrySection::default(),
            retained_plans: default_retained_plans(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for ProcessorsSection {
    fn default() -> Self {
        Self {
            dry_run: default_dry_run(),
        }
    }
}

impl ExecutionSection {
    pub fn to_execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            mode: self.mode,
            max_concurrency: self.max_concurrency,
            timeout_ms: self.timeout_ms,
            retry_policy: RetryPolicy {
                max_retries: self.retry.max_retries,
                retry_delay_ms: self.retry.retry_delay_ms,
                backoff_multiplier: self.retry.backoff_multiplier,
            },
        }
    }
}

impl NodeTypesSection {
    /// Status overrides in the order they are applied; later entries win
    pub fn overrides(&self) -> impl Iterator<Item = (NodeType, NodeTypeStatus)> + '_ {
        let deprecated = self
            .deprecated
            .iter()
            .map(|t| (*t, NodeTypeStatus::Deprecated));
        let experimental = self
            .experimental
            .iter()
            .map(|t| (*t, NodeTypeStatus::Experimental));
        let disabled = self
            .disabled
            .iter()
            .map(|t| (*t, NodeTypeStatus::Unsupported));
        deprecated.chain(experimental).chain(disabled)
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config
            .execution
            .to_execution_config()
            .validate()
            .context("Invalid [execution] section")?;

        Ok(config)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: ExecutionEngine,
    pub defaults: ExecutionConfig,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let event_bus = EventBus::new();

        event_bus
            .subscribe_all(|event| {
                tracing::debug!(
                    "Execution {} event: {}",
                    event.execution_id,
                    event.event_type()
                );
            })
            .detach();

        let registry = processors::build_registry(config);
        tracing::info!(
            "Registered processors for: {}",
            registry
                .registered_types()
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            engine: ExecutionEngine::new(event_bus, registry)
                .with_plan_retention(config.execution.retained_plans),
            defaults: config.execution.to_execution_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: ServerConfig = toml::from_str(
            r#"
            [execution]
            mode = "parallel"
            max_concurrency = 5
            timeout_ms = 60000
            retained_plans = 50

            [execution.retry]
            max_retries = 1
            retry_delay_ms = 250

            [node_types]
            deprecated = ["database"]
            disabled = ["gmail", "discord"]

            [processors]
            dry_run = false
            "#,
        )
        .unwrap();

        let execution = config.execution.to_execution_config();
        assert_eq!(execution.mode, ExecutionMode::Parallel);
        assert_eq!(execution.max_concurrency, 5);
        assert_eq!(execution.retry_policy.max_retries, 1);
        assert_eq!(execution.retry_policy.backoff_multiplier, 2.0);
        assert!(execution.validate().is_ok());
        assert!(!config.processors.dry_run);
        assert_eq!(config.execution.retained_plans, 50);

        let overrides: Vec<_> = config.node_types.overrides().collect();
        assert_eq!(
            overrides,
            vec![
                (NodeType::Database, NodeTypeStatus::Deprecated),
                (NodeType::Gmail, NodeTypeStatus::Unsupported),
                (NodeType::Discord, NodeTypeStatus::Unsupported),
            ]
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load(Path::new("does-not-exist/flowsmith.toml")).unwrap();
        assert_eq!(config.execution.to_execution_config(), ExecutionConfig::default());
        assert!(config.processors.dry_run);
        assert_eq!(config.execution.retained_plans, DEFAULT_PLAN_RETENTION);
    }

    #[test]
    fn test_out_of_bounds_defaults_are_rejected() {
        let path = std::env::temp_dir().join(format!(
            "flowsmith-config-test-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[execution]\ntimeout_ms = 10\n").unwrap();

        let result = ServerConfig::load(&path);
        std::fs::remove_file(&path).ok();

        let error = result.unwrap_err();
        assert!(format!("{:#}", error).contains("timeout must be at least 1000ms"));
    }
}
