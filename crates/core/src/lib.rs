// Core engine for Flowsmith workflow graphs

pub mod error;
pub mod events;
pub mod template;
pub mod types;
pub mod workflow;

pub use error::{ConfigError, EngineError, ProcessorError};
pub use events::{EventBus, EventPayload, EventType, ExecutionEvent, Subscription};
pub use types::*;
pub use workflow::{
    ExecutionEngine, GraphValidator, NodeProcessor, NodeTypeRegistry, PreparedExecution,
    ProcessorOutput, ProcessorRegistry, ProcessorRequest, RetryPolicy, ValidationReport,
    DEFAULT_PLAN_RETENTION,
};
