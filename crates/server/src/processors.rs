// Built-in processors so a graph can run against its test input without external services

use crate::config::ServerConfig;
use flowsmith_core::workflow::processor_fn;
use flowsmith_core::{
    NodeConfig, NodeRole, NodeType, ProcessorError, ProcessorOutput, ProcessorRegistry,
    ProcessorRequest,
};
use serde_json::{json, Map, Value};

/// Registry wired from the `[processors]` and `[node_types]` sections
pub fn build_registry(config: &ServerConfig) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();

    registry.register(
        NodeType::DataInput,
        processor_fn(|request: ProcessorRequest| async move { data_input(request) }),
    );
    registry.register(
        NodeType::DataOutput,
        processor_fn(|request: ProcessorRequest| async move { data_output(request) }),
    );

    if config.processors.dry_run {
        for node_type in NodeType::ALL {
            if node_type.role() == NodeRole::Processing {
                registry.register(
                    node_type,
                    processor_fn(|request: ProcessorRequest| async move { dry_run(request) }),
                );
            }
        }
    }

    for (node_type, status) in config.node_types.overrides() {
        registry.set_status(node_type, status);
    }

    registry
}

/// Emit the configured test input
fn data_input(request: ProcessorRequest) -> Result<ProcessorOutput, ProcessorError> {
    match request.config {
        NodeConfig::DataInput(config) => Ok(ProcessorOutput::new(config.input)),
        other => Err(unexpected_config(NodeType::DataInput, &other)),
    }
}

/// Collect upstream outputs, keyed by node id
fn data_output(request: ProcessorRequest) -> Result<ProcessorOutput, ProcessorError> {
    let NodeConfig::DataOutput(config) = &request.config else {
        return Err(unexpected_config(NodeType::DataOutput, &request.config));
    };

    let mut ids: Vec<_> = request.upstream.keys().collect();
    ids.sort();

    let mut collected = Map::new();
    for id in &ids {
        if let Some(output) = request.upstream.get(*id) {
            collected.insert(id.to_string(), output.output.clone());
        }
    }

    let output = match config.format.as_deref() {
        Some("text") => Value::String(
            collected
                .values()
                .map(|value| match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Some("json") | None => match collected.len() {
            1 => collected.values().next().cloned().unwrap_or(Value::Null),
            _ => Value::Object(collected.clone()),
        },
        Some(other) => {
            return Err(ProcessorError::InvalidConfig(format!(
                "Unknown output format '{}'",
                other
            )))
        }
    };

    Ok(ProcessorOutput::new(output).with_data(Value::Object(collected)))
}

/// Echo the resolved configuration instead of calling the real service
fn dry_run(request: ProcessorRequest) -> Result<ProcessorOutput, ProcessorError> {
    let node_type = request.config.node_type();
    let tagged = serde_json::to_value(&request.config)
        .map_err(|e| ProcessorError::InvalidConfig(e.to_string()))?;
    let config = tagged.get("config").cloned().unwrap_or(Value::Null);

    tracing::debug!("Dry run of {} node {}", node_type, request.label);

    Ok(ProcessorOutput::new(config).with_data(json!({
        "dryRun": true,
        "nodeType": node_type,
        "attempt": request.attempt,
    })))
}

fn unexpected_config(expected: NodeType, config: &NodeConfig) -> ProcessorError {
    ProcessorError::InvalidConfig(format!(
        "Expected {} config, got {}",
        expected,
        config.node_type()
    ))
}
