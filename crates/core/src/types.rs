use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::workflow::condition::NodeCondition;
use crate::workflow::retry::RetryPolicy;

/// Unique identifier for one execution of a workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a node, stable for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Kind of work a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    DataInput,
    WebScraping,
    LlmTask,
    EmbeddingGenerator,
    SimilaritySearch,
    StructuredOutput,
    DataOutput,
    Database,
    Slack,
    Discord,
    Gmail,
}

impl NodeType {
    pub const ALL: [NodeType; 11] = [
        NodeType::DataInput,
        NodeType::WebScraping,
        NodeType::LlmTask,
        NodeType::EmbeddingGenerator,
        NodeType::SimilaritySearch,
        NodeType::StructuredOutput,
        NodeType::DataOutput,
        NodeType::Database,
        NodeType::Slack,
        NodeType::Discord,
        NodeType::Gmail,
    ];

    /// Functional category used by the validator
    pub fn role(self) -> NodeRole {
        match self {
            NodeType::DataInput => NodeRole::Input,
            NodeType::DataOutput => NodeRole::Output,
            _ => NodeRole::Processing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::DataInput => "dataInput",
            NodeType::WebScraping => "webScraping",
            NodeType::LlmTask => "llmTask",
            NodeType::EmbeddingGenerator => "embeddingGenerator",
            NodeType::SimilaritySearch => "similaritySearch",
            NodeType::StructuredOutput => "structuredOutput",
            NodeType::DataOutput => "dataOutput",
            NodeType::Database => "database",
            NodeType::Slack => "slack",
            NodeType::Discord => "discord",
            NodeType::Gmail => "gmail",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a node type within a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Input,
    Output,
    Processing,
}

/// Support level of a node type, as reported by a type registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTypeStatus {
    Supported,
    Deprecated,
    Experimental,
    Unsupported,
}

/// Typed configuration, one variant per node type.
///
/// String fields may carry `{{id.property}}` templates that are resolved
/// against upstream outputs right before the node runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "camelCase")]
pub enum NodeConfig {
    DataInput(DataInputConfig),
    WebScraping(WebScrapingConfig),
    LlmTask(LlmTaskConfig),
    EmbeddingGenerator(EmbeddingGeneratorConfig),
    SimilaritySearch(SimilaritySearchConfig),
    StructuredOutput(StructuredOutputConfig),
    DataOutput(DataOutputConfig),
    Database(DatabaseConfig),
    Slack(SlackConfig),
    Discord(DiscordConfig),
    Gmail(GmailConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataInputConfig {
    /// Test input fed into the workflow
    pub input: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebScrapingConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LlmTaskConfig {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmbeddingGeneratorConfig {
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimilaritySearchConfig {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StructuredOutputConfig {
    pub input: String,
    pub schema: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataOutputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub connection: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlackConfig {
    pub channel: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscordConfig {
    pub webhook_url: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GmailConfig {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::DataInput(_) => NodeType::DataInput,
            NodeConfig::WebScraping(_) => NodeType::WebScraping,
            NodeConfig::LlmTask(_) => NodeType::LlmTask,
            NodeConfig::EmbeddingGenerator(_) => NodeType::EmbeddingGenerator,
            NodeConfig::SimilaritySearch(_) => NodeType::SimilaritySearch,
            NodeConfig::StructuredOutput(_) => NodeType::StructuredOutput,
            NodeConfig::DataOutput(_) => NodeType::DataOutput,
            NodeConfig::Database(_) => NodeType::Database,
            NodeConfig::Slack(_) => NodeType::Slack,
            NodeConfig::Discord(_) => NodeType::Discord,
            NodeConfig::Gmail(_) => NodeType::Gmail,
        }
    }

    /// Required keys that are empty in this configuration
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        fn blank(value: &str) -> bool {
            value.trim().is_empty()
        }

        let checks: Vec<(&'static str, bool)> = match self {
            NodeConfig::DataInput(_) | NodeConfig::DataOutput(_) => vec![],
            NodeConfig::WebScraping(c) => vec![("url", blank(&c.url))],
            NodeConfig::LlmTask(c) => vec![("prompt", blank(&c.prompt))],
            NodeConfig::EmbeddingGenerator(c) => vec![("input", blank(&c.input))],
            NodeConfig::SimilaritySearch(c) => vec![("query", blank(&c.query))],
            NodeConfig::StructuredOutput(c) => vec![("schema", c.schema.is_null())],
            NodeConfig::Database(c) => vec![
                ("connection", blank(&c.connection)),
                ("query", blank(&c.query)),
            ],
            NodeConfig::Slack(c) => vec![("channel", blank(&c.channel)), ("message", blank(&c.message))],
            NodeConfig::Discord(c) => vec![
                ("webhookUrl", blank(&c.webhook_url)),
                ("message", blank(&c.message)),
            ],
            NodeConfig::Gmail(c) => vec![("to", blank(&c.to)), ("subject", blank(&c.subject))],
        };

        checks
            .into_iter()
            .filter(|(_, missing)| *missing)
            .map(|(field, _)| field)
            .collect()
    }
}

/// A typed unit of work in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "NodeRecord", into = "NodeRecord")]
pub struct Node {
    pub id: NodeId,
    /// Unique within a workflow; usable as an alias in templates
    pub label: String,
    pub config: NodeConfig,
    /// Only honoured in conditional mode
    pub condition: Option<NodeCondition>,
}

impl Node {
    pub fn new(id: impl Into<String>, label: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: NodeId::new(id),
            label: label.into(),
            config,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: NodeCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.config.node_type()
    }
}

/// Wire shape of a node as the editor sends it: `{id, type, label, config}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    id: NodeId,
    #[serde(rename = "type")]
    node_type: NodeType,
    label: String,
    #[serde(default)]
    config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<NodeCondition>,
}

impl TryFrom<NodeRecord> for Node {
    type Error = serde_json::Error;

    fn try_from(record: NodeRecord) -> Result<Self, Self::Error> {
        let payload = match record.config {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let config = serde_json::from_value(serde_json::json!({
            "type": record.node_type,
            "config": payload,
        }))?;

        Ok(Self {
            id: record.id,
            label: record.label,
            config,
            condition: record.condition,
        })
    }
}

impl From<Node> for NodeRecord {
    fn from(node: Node) -> Self {
        let node_type = node.node_type();
        let mut tagged = serde_json::to_value(&node.config).unwrap_or_default();
        let config = tagged
            .get_mut("config")
            .map(Value::take)
            .unwrap_or_default();

        Self {
            id: node.id,
            node_type,
            label: node.label,
            config,
            condition: node.condition,
        }
    }
}

/// Directed dependency: `target` waits for `source`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: NodeId::new(source),
            target: NodeId::new(target),
            source_handle: None,
            target_handle: None,
        }
    }
}

/// Immutable snapshot of a workflow graph for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphModel {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphModel {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Label → id table used to resolve template aliases
    pub fn alias_table(&self) -> HashMap<String, NodeId> {
        self.nodes
            .iter()
            .map(|n| (n.label.clone(), n.id.clone()))
            .collect()
    }
}

/// Per-node status machine: pending → running → success | failed | skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful node produced, as seen by templates downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutput {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: NodeStatus,
}

impl NodeOutput {
    pub fn success(output: Value, data: Option<Value>) -> Self {
        Self {
            output,
            data,
            error: None,
            status: NodeStatus::Success,
        }
    }
}

/// Live state of one node within an ExecutionPlan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionState {
    pub node_id: NodeId,
    pub label: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<NodeOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl NodeExecutionState {
    pub fn pending(node: &Node) -> Self {
        Self {
            node_id: node.id.clone(),
            label: node.label.clone(),
            node_type: node.node_type(),
            status: NodeStatus::Pending,
            outputs: None,
            error: None,
            skip_reason: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// Scheduling policy for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_timeout_ms() -> u64 {
    300_000
}

/// Execution configuration surface accepted from callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Run-level timeout in milliseconds
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_timeout_ms(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check the bounds callers must respect
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency < 1 {
            return Err(ConfigError::MaxConcurrency(self.max_concurrency));
        }
        if self.timeout_ms < 1000 {
            return Err(ConfigError::Timeout(self.timeout_ms));
        }
        if self.retry_policy.retry_delay_ms < 100 {
            return Err(ConfigError::RetryDelay(self.retry_policy.retry_delay_ms));
        }
        if !(self.retry_policy.backoff_multiplier >= 1.0) {
            return Err(ConfigError::BackoffMultiplier(
                self.retry_policy.backoff_multiplier,
            ));
        }
        Ok(())
    }

    /// Number of node invocations allowed in flight at once, capped at what
    /// the admission gate can hold
    pub fn effective_concurrency(&self) -> usize {
        match self.mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel | ExecutionMode::Conditional => {
                self.max_concurrency.clamp(1, Semaphore::MAX_PERMITS)
            }
        }
    }
}

/// Overall status of an ExecutionPlan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PlanStatus::Pending | PlanStatus::Running)
    }
}

/// One concrete run of a graph with live per-node state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub id: ExecutionId,
    pub graph: Arc<GraphModel>,
    pub config: ExecutionConfig,
    /// Node states in topological order
    pub nodes: Vec<NodeExecutionState>,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPlan {
    pub fn node(&self, id: &NodeId) -> Option<&NodeExecutionState> {
        self.nodes.iter().find(|n| &n.node_id == id)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    pub fn completed_nodes(&self) -> usize {
        self.count(NodeStatus::Success)
    }

    pub fn failed_nodes(&self) -> usize {
        self.count(NodeStatus::Failed)
    }

    pub fn skipped_nodes(&self) -> usize {
        self.count(NodeStatus::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_wire_format_roundtrip() {
        let json = serde_json::json!({
            "id": "n1",
            "type": "webScraping",
            "label": "Scraper",
            "config": { "url": "{{input.output}}", "selector": "h1" }
        });

        let node: Node = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(node.node_type(), NodeType::WebScraping);
        match &node.config {
            NodeConfig::WebScraping(c) => {
                assert_eq!(c.url, "{{input.output}}");
                assert_eq!(c.selector.as_deref(), Some("h1"));
            }
            other => panic!("Unexpected config: {:?}", other),
        }

        assert_eq!(serde_json::to_value(&node).unwrap(), json);
    }

    #[test]
    fn test_node_without_config_uses_defaults() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "id": "out",
            "type": "dataOutput",
            "label": "Output"
        }))
        .unwrap();

        assert_eq!(node.config, NodeConfig::DataOutput(DataOutputConfig::default()));
    }

    #[test]
    fn test_missing_required_fields() {
        let config = NodeConfig::Database(DatabaseConfig {
            connection: "postgres://localhost".to_string(),
            query: "  ".to_string(),
            operation: None,
        });
        assert_eq!(config.missing_required_fields(), vec!["query"]);

        let config = NodeConfig::DataInput(DataInputConfig::default());
        assert!(config.missing_required_fields().is_empty());
    }

    #[test]
    fn test_execution_config_defaults_and_bounds() {
        let config: ExecutionConfig = serde_json::from_value(serde_json::json!({
            "mode": "parallel",
            "maxConcurrency": 4
        }))
        .unwrap();

        assert_eq!(config.mode, ExecutionMode::Parallel);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.timeout_ms, 300_000);
        assert!(config.validate().is_ok());

        let too_short = ExecutionConfig {
            timeout_ms: 500,
            ..ExecutionConfig::default()
        };
        assert_eq!(too_short.validate(), Err(ConfigError::Timeout(500)));

        let no_workers = ExecutionConfig {
            max_concurrency: 0,
            ..ExecutionConfig::default()
        };
        assert!(no_workers.validate().is_err());
    }

    #[test]
    fn test_sequential_mode_runs_one_at_a_time() {
        let config = ExecutionConfig {
            max_concurrency: 8,
            ..ExecutionConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
        assert_eq!(
            config.with_mode(ExecutionMode::Parallel).effective_concurrency(),
            8
        );
    }

    #[test]
    fn test_huge_max_concurrency_is_capped() {
        let config = ExecutionConfig {
            mode: ExecutionMode::Parallel,
            max_concurrency: usize::MAX,
            ..ExecutionConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_concurrency(), Semaphore::MAX_PERMITS);
    }
}
