pub mod condition;
pub mod dag;
pub mod executor;
pub mod processor;
pub mod retry;
pub mod validator;

pub use condition::{NodeCondition, UpstreamOutputs};
pub use dag::WorkflowDag;
pub use executor::{ExecutionEngine, PreparedExecution, DEFAULT_PLAN_RETENTION};
pub use processor::{
    processor_fn, NodeProcessor, NodeTypeRegistry, ProcessorOutput, ProcessorRegistry,
    ProcessorRequest,
};
pub use retry::RetryPolicy;
pub use validator::{GraphStats, GraphValidator, IssueCode, ValidationIssue, ValidationReport};
