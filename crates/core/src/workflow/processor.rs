use crate::error::ProcessorError;
use crate::types::{ExecutionId, NodeConfig, NodeId, NodeOutput, NodeType, NodeTypeStatus};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a processor gets for one attempt of one node
#[derive(Debug, Clone)]
pub struct ProcessorRequest {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub label: String,
    /// Configuration with every template already resolved
    pub config: NodeConfig,
    /// Outputs of the node's direct predecessors
    pub upstream: HashMap<NodeId, NodeOutput>,
    /// 1-based attempt number
    pub attempt: u32,
    /// Fired when the run times out or is cancelled
    pub cancel: CancellationToken,
}

/// Successful result of a processor call
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutput {
    pub output: Value,
    pub data: Option<Value>,
}

impl ProcessorOutput {
    pub fn new(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Executes the work of one node type
#[async_trait]
pub trait NodeProcessor: Send + Sync {
    async fn execute(&self, request: ProcessorRequest) -> Result<ProcessorOutput, ProcessorError>;
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> NodeProcessor for FnProcessor<F>
where
    F: Fn(ProcessorRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProcessorOutput, ProcessorError>> + Send + 'static,
{
    async fn execute(&self, request: ProcessorRequest) -> Result<ProcessorOutput, ProcessorError> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a processor
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn NodeProcessor>
where
    F: Fn(ProcessorRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProcessorOutput, ProcessorError>> + Send + 'static,
{
    Arc::new(FnProcessor(f))
}

/// Reports how well each node type is supported
pub trait NodeTypeRegistry: Send + Sync {
    fn status(&self, node_type: NodeType) -> NodeTypeStatus;

    /// Supported alternatives to suggest for an unusable type
    fn similar_types(&self, node_type: NodeType) -> Vec<NodeType>;
}

/// Maps node types to processors and their support status
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<NodeType, Arc<dyn NodeProcessor>>,
    statuses: HashMap<NodeType, NodeTypeStatus>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: NodeType, processor: Arc<dyn NodeProcessor>) {
        self.register_with_status(node_type, processor, NodeTypeStatus::Supported);
    }

    pub fn register_with_status(
        &mut self,
        node_type: NodeType,
        processor: Arc<dyn NodeProcessor>,
        status: NodeTypeStatus,
    ) {
        tracing::debug!("Registered processor for {} ({:?})", node_type, status);
        self.processors.insert(node_type, processor);
        self.statuses.insert(node_type, status);
    }

    /// Override the reported status of a type without touching its processor
    pub fn set_status(&mut self, node_type: NodeType, status: NodeTypeStatus) {
        self.statuses.insert(node_type, status);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeProcessor>> {
        self.processors.get(&node_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<NodeType> {
        let mut types: Vec<NodeType> = self.processors.keys().copied().collect();
        types.sort();
        types
    }
}

impl NodeTypeRegistry for ProcessorRegistry {
    fn status(&self, node_type: NodeType) -> NodeTypeStatus {
        match self.statuses.get(&node_type) {
            Some(status) => *status,
            None if self.processors.contains_key(&node_type) => NodeTypeStatus::Supported,
            None => NodeTypeStatus::Unsupported,
        }
    }

    fn similar_types(&self, node_type: NodeType) -> Vec<NodeType> {
        NodeType::ALL
            .into_iter()
            .filter(|candidate| {
                *candidate != node_type
                    && candidate.role() == node_type.role()
                    && self.processors.contains_key(candidate)
                    && self.status(*candidate) == NodeTypeStatus::Supported
            })
            .collect()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.registered_types())
            .field("statuses", &self.statuses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataInputConfig;
    use serde_json::json;

    fn echo() -> Arc<dyn NodeProcessor> {
        processor_fn(|request: ProcessorRequest| async move {
            Ok::<_, ProcessorError>(ProcessorOutput::new(json!(request.label)))
        })
    }

    #[tokio::test]
    async fn test_processor_fn_executes() {
        let processor = echo();
        let output = processor
            .execute(ProcessorRequest {
                execution_id: ExecutionId::new(),
                node_id: NodeId::new("n1"),
                label: "Input".to_string(),
                config: NodeConfig::DataInput(DataInputConfig::default()),
                upstream: HashMap::new(),
                attempt: 1,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();

        assert_eq!(output, ProcessorOutput::new("Input"));
    }

    #[test]
    fn test_registry_statuses() {
        let mut registry = ProcessorRegistry::new();
        registry.register(NodeType::LlmTask, echo());
        registry.register(NodeType::WebScraping, echo());
        registry.register_with_status(NodeType::Database, echo(), NodeTypeStatus::Deprecated);

        assert_eq!(registry.status(NodeType::LlmTask), NodeTypeStatus::Supported);
        assert_eq!(registry.status(NodeType::Database), NodeTypeStatus::Deprecated);
        assert_eq!(registry.status(NodeType::Gmail), NodeTypeStatus::Unsupported);

        registry.set_status(NodeType::WebScraping, NodeTypeStatus::Experimental);
        assert_eq!(registry.status(NodeType::WebScraping), NodeTypeStatus::Experimental);
    }

    #[test]
    fn test_similar_types_share_role() {
        let mut registry = ProcessorRegistry::new();
        registry.register(NodeType::LlmTask, echo());
        registry.register(NodeType::Slack, echo());
        registry.register(NodeType::DataInput, echo());
        registry.register_with_status(NodeType::Database, echo(), NodeTypeStatus::Deprecated);

        let similar = registry.similar_types(NodeType::Gmail);
        assert_eq!(similar, vec![NodeType::LlmTask, NodeType::Slack]);
    }
}
