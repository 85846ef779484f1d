use super::condition::UpstreamOutputs;
use super::dag::WorkflowDag;
use super::processor::{
    NodeProcessor, NodeTypeRegistry, ProcessorOutput, ProcessorRegistry, ProcessorRequest,
};
use super::retry::RetryPolicy;
use super::validator::{GraphValidator, ValidationReport};
use crate::error::{EngineError, ProcessorError};
use crate::events::{EventBus, EventPayload, ExecutionEvent};
use crate::template::{CompiledConfig, ResolutionScope};
use crate::types::{
    ExecutionConfig, ExecutionId, ExecutionMode, ExecutionPlan, GraphModel, NodeConfig,
    NodeExecutionState, NodeId, NodeOutput, NodeStatus, PlanStatus,
};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A validated plan that has not started running yet.
///
/// Obtained from [`ExecutionEngine::prepare`]; the execution id is fixed here,
/// so callers can subscribe to its events before calling [`ExecutionEngine::run`].
pub struct PreparedExecution {
    plan: ExecutionPlan,
    dag: WorkflowDag,
    templates: HashMap<NodeId, CompiledConfig>,
    aliases: HashMap<String, NodeId>,
    report: ValidationReport,
}

impl PreparedExecution {
    pub fn id(&self) -> ExecutionId {
        self.plan.id
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Validation result, including any warnings
    pub fn validation(&self) -> &ValidationReport {
        &self.report
    }
}

/// Finished plans kept for lookup unless configured otherwise
pub const DEFAULT_PLAN_RETENTION: usize = 1000;

/// Latest snapshot of every known plan; the oldest finished ones go first
struct PlanStore {
    plans: HashMap<ExecutionId, ExecutionPlan>,
    finished: VecDeque<ExecutionId>,
    retention: usize,
}

impl PlanStore {
    fn new(retention: usize) -> Self {
        Self {
            plans: HashMap::new(),
            finished: VecDeque::new(),
            retention,
        }
    }

    fn update(&mut self, plan: ExecutionPlan) {
        self.plans.insert(plan.id, plan);
    }

    /// Store a terminal plan and evict beyond the retention limit
    fn finish(&mut self, plan: ExecutionPlan) {
        let id = plan.id;
        let newly_finished = self
            .plans
            .insert(id, plan)
            .map_or(true, |previous| !previous.status.is_terminal());
        if newly_finished {
            self.finished.push_back(id);
        }

        while self.finished.len() > self.retention {
            let Some(evicted) = self.finished.pop_front() else {
                break;
            };
            self.plans.remove(&evicted);
            tracing::debug!("Evicted finished execution {}", evicted);
        }
    }
}

/// Runs workflow graphs: validation, scheduling, retries and progress events
#[derive(Clone)]
pub struct ExecutionEngine {
    event_bus: EventBus,
    processors: Arc<ProcessorRegistry>,
    type_registry: Arc<dyn NodeTypeRegistry>,
    // Track active runs for cancellation
    active_runs: Arc<RwLock<HashMap<ExecutionId, CancellationToken>>>,
    plans: Arc<RwLock<PlanStore>>,
}

impl ExecutionEngine {
    pub fn new(event_bus: EventBus, processors: ProcessorRegistry) -> Self {
        let processors = Arc::new(processors);
        let type_registry: Arc<dyn NodeTypeRegistry> = processors.clone();

        Self {
            event_bus,
            processors,
            type_registry,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
            plans: Arc::new(RwLock::new(PlanStore::new(DEFAULT_PLAN_RETENTION))),
        }
    }

    /// Keep at most `retention` finished plans; running ones are never evicted
    pub fn with_plan_retention(mut self, retention: usize) -> Self {
        self.plans = Arc::new(RwLock::new(PlanStore::new(retention)));
        self
    }

    /// Use a separate registry for node type support levels
    pub fn with_type_registry(mut self, registry: Arc<dyn NodeTypeRegistry>) -> Self {
        self.type_registry = registry;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn validate(&self, graph: &GraphModel) -> ValidationReport {
        GraphValidator::new(self.type_registry.as_ref()).validate(graph)
    }

    /// Validate a graph and build its execution plan
    pub async fn prepare(
        &self,
        graph: GraphModel,
        config: ExecutionConfig,
    ) -> Result<PreparedExecution, EngineError> {
        let id = ExecutionId::new();
        let report = self.validate(&graph);

        if !report.is_valid {
            let messages: Vec<&str> = report.errors.iter().map(|e| e.message.as_str()).collect();
            tracing::warn!(
                "Rejected workflow for execution {}: {}",
                id,
                messages.join("; ")
            );
            self.event_bus.publish(ExecutionEvent::new(
                id,
                EventPayload::ExecutionError {
                    error: format!("Workflow validation failed: {}", messages.join("; ")),
                    node_id: report.errors.iter().find_map(|e| e.node_id.clone()),
                },
            ));
            return Err(EngineError::Validation(Box::new(report)));
        }

        for warning in &report.warnings {
            tracing::warn!("Workflow warning for execution {}: {}", id, warning.message);
        }

        let dag = WorkflowDag::from_graph(&graph)?;

        let mut templates = HashMap::new();
        for node in &graph.nodes {
            let compiled = CompiledConfig::compile(&node.config).map_err(|e| {
                EngineError::Graph(format!("Failed to compile config of node {}: {}", node.id, e))
            })?;
            if compiled.has_variables() {
                templates.insert(node.id.clone(), compiled);
            }
        }

        let nodes = dag
            .topological_order()
            .iter()
            .filter_map(|node_id| graph.node(node_id))
            .map(NodeExecutionState::pending)
            .collect();

        let plan = ExecutionPlan {
            id,
            graph: Arc::new(graph),
            config,
            nodes,
            status: PlanStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
        };
        let aliases = plan.graph.alias_table();

        self.plans.write().await.update(plan.clone());

        Ok(PreparedExecution {
            plan,
            dag,
            templates,
            aliases,
            report,
        })
    }

    /// Run a prepared plan to completion
    pub async fn run(&self, prepared: PreparedExecution) -> ExecutionPlan {
        let id = prepared.id();
        let fallback = prepared.plan.clone();
        let cancel = CancellationToken::new();
        self.active_runs.write().await.insert(id, cancel.clone());

        let engine = self.clone();
        let driver =
            tokio::spawn(async move { RunDriver::new(&engine, prepared, cancel).drive().await });
        let plan = match driver.await {
            Ok(plan) => plan,
            Err(e) => self.abandon(fallback, e).await,
        };

        self.active_runs.write().await.remove(&id);
        plan
    }

    /// Close out a run whose driver died without reporting a plan
    async fn abandon(&self, fallback: ExecutionPlan, error: JoinError) -> ExecutionPlan {
        let reason = if error.is_panic() {
            format!("Execution driver panicked: {}", panic_message(error))
        } else {
            format!("Execution driver stopped: {}", error)
        };
        tracing::error!("Execution {}: {}", fallback.id, reason);

        let mut plan = self
            .plans
            .read()
            .await
            .plans
            .get(&fallback.id)
            .cloned()
            .unwrap_or(fallback);
        let now = Utc::now();
        for state in plan.nodes.iter_mut().filter(|s| !s.status.is_terminal()) {
            if state.status == NodeStatus::Running {
                state.status = NodeStatus::Failed;
                state.error = Some(reason.clone());
            } else {
                state.status = NodeStatus::Skipped;
                state.skip_reason = Some(reason.clone());
            }
            state.completed_at = Some(now);
        }
        plan.status = PlanStatus::Failed;
        plan.error = Some(reason.clone());
        plan.completed_at = Some(now);

        self.plans.write().await.finish(plan.clone());
        self.event_bus.publish(ExecutionEvent::new(
            plan.id,
            EventPayload::ExecutionError {
                error: reason,
                node_id: None,
            },
        ));
        let total_duration_ms = match plan.started_at {
            Some(started) => (now - started).num_milliseconds().max(0) as u64,
            None => 0,
        };
        self.event_bus.publish(ExecutionEvent::new(
            plan.id,
            EventPayload::ExecutionComplete {
                status: plan.status,
                completed_nodes: plan.completed_nodes(),
                failed_nodes: plan.failed_nodes(),
                skipped_nodes: plan.skipped_nodes(),
                total_duration_ms,
            },
        ));
        plan
    }

    /// Validate, plan and run a graph
    pub async fn execute(
        &self,
        graph: GraphModel,
        config: ExecutionConfig,
    ) -> Result<ExecutionPlan, EngineError> {
        let prepared = self.prepare(graph, config).await?;
        Ok(self.run(prepared).await)
    }

    /// Cancel a running execution
    pub async fn cancel(&self, id: ExecutionId) -> Result<(), EngineError> {
        let active_runs = self.active_runs.read().await;

        if let Some(cancel) = active_runs.get(&id) {
            cancel.cancel();
            tracing::info!("Cancellation signal sent for execution {}", id);
            Ok(())
        } else {
            Err(EngineError::NotActive(id))
        }
    }

    pub async fn is_active(&self, id: ExecutionId) -> bool {
        self.active_runs.read().await.contains_key(&id)
    }

    /// Latest known state of an execution
    pub async fn get_plan(&self, id: ExecutionId) -> Option<ExecutionPlan> {
        self.plans.read().await.plans.get(&id).cloned()
    }

    /// All known executions, most recently started first
    pub async fn list_plans(&self) -> Vec<ExecutionPlan> {
        let mut plans: Vec<ExecutionPlan> =
            self.plans.read().await.plans.values().cloned().collect();
        plans.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        plans
    }
}

/// What woke the driver up
enum Wake {
    Cancelled,
    TimedOut,
    Joined(Option<Result<NodeResult, JoinError>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    TimedOut,
    Cancelled,
}

enum Readiness {
    Waiting,
    Ready,
    Skip(String),
}

/// Final report of one node task
struct NodeResult {
    node_id: NodeId,
    attempts: u32,
    elapsed: Duration,
    result: Result<ProcessorOutput, ProcessorError>,
}

/// Single driver of one run; the only writer of node states and outputs
struct RunDriver {
    plan: ExecutionPlan,
    dag: WorkflowDag,
    templates: HashMap<NodeId, CompiledConfig>,
    aliases: HashMap<String, NodeId>,
    positions: HashMap<NodeId, usize>,
    outputs: HashMap<NodeId, NodeOutput>,
    event_bus: EventBus,
    processors: Arc<ProcessorRegistry>,
    plans: Arc<RwLock<PlanStore>>,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: JoinSet<NodeResult>,
    /// Attempts started so far, by plan position, for nodes still in flight
    attempt_counts: HashMap<usize, Arc<AtomicU32>>,
    halted: bool,
}

impl RunDriver {
    fn new(engine: &ExecutionEngine, prepared: PreparedExecution, cancel: CancellationToken) -> Self {
        let PreparedExecution {
            plan,
            dag,
            templates,
            aliases,
            ..
        } = prepared;

        let positions = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, state)| (state.node_id.clone(), i))
            .collect();
        let gate = Arc::new(Semaphore::new(plan.config.effective_concurrency()));

        Self {
            plan,
            dag,
            templates,
            aliases,
            positions,
            outputs: HashMap::new(),
            event_bus: engine.event_bus.clone(),
            processors: engine.processors.clone(),
            plans: engine.plans.clone(),
            gate,
            cancel,
            tasks: JoinSet::new(),
            attempt_counts: HashMap::new(),
            halted: false,
        }
    }

    async fn drive(mut self) -> ExecutionPlan {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.plan.config.timeout_ms);
        let deadline = started + timeout;

        self.plan.status = PlanStatus::Running;
        self.plan.started_at = Some(Utc::now());
        tracing::info!(
            "Starting execution {}: {} nodes, mode={:?}",
            self.plan.id,
            self.plan.nodes.len(),
            self.plan.config.mode
        );
        self.publish(EventPayload::ExecutionStart {
            total_nodes: self.plan.nodes.len(),
            mode: self.plan.config.mode,
        });

        let outcome = loop {
            self.schedule_ready();
            self.snapshot().await;

            if self.tasks.is_empty() {
                break Outcome::Finished;
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::TimedOut,
                joined = self.tasks.join_next() => Wake::Joined(joined),
            };

            match wake {
                Wake::Cancelled => break Outcome::Cancelled,
                Wake::TimedOut => break Outcome::TimedOut,
                Wake::Joined(Some(Ok(result))) => self.finish_node(result),
                Wake::Joined(Some(Err(e))) => {
                    tracing::error!("Node task of execution {} failed: {}", self.plan.id, e);
                }
                Wake::Joined(None) => {}
            }
        };

        match outcome {
            Outcome::Finished => {
                self.settle("Node task ended without reporting a result", "Execution ended");
                let failed = self.plan.failed_nodes();
                if failed == 0 {
                    self.plan.status = PlanStatus::Completed;
                } else {
                    self.plan.status = PlanStatus::Failed;
                    self.plan.error = Some(format!("{} node(s) failed", failed));
                }
            }
            Outcome::TimedOut => {
                // Let processors observe the deadline, but do not abort them.
                self.cancel.cancel();
                self.tasks.detach_all();
                let error = format!("Execution timed out after {}ms", timeout.as_millis());
                tracing::warn!("Execution {}: {}", self.plan.id, error);
                self.settle(&error, "Execution timed out");
                self.plan.status = PlanStatus::TimedOut;
                self.plan.error = Some(error.clone());
                self.publish(EventPayload::ExecutionError {
                    error,
                    node_id: None,
                });
            }
            Outcome::Cancelled => {
                self.tasks.detach_all();
                tracing::warn!("Execution {} cancelled", self.plan.id);
                self.settle("Execution cancelled", "Execution cancelled");
                self.plan.status = PlanStatus::Cancelled;
                self.plan.error = Some("Execution cancelled".to_string());
            }
        }

        let total_duration = started.elapsed();
        self.plan.completed_at = Some(Utc::now());
        // Stored as terminal before execution:complete goes out.
        self.plans.write().await.finish(self.plan.clone());
        self.publish(EventPayload::ExecutionComplete {
            status: self.plan.status,
            completed_nodes: self.plan.completed_nodes(),
            failed_nodes: self.plan.failed_nodes(),
            skipped_nodes: self.plan.skipped_nodes(),
            total_duration_ms: total_duration.as_millis() as u64,
        });
        tracing::info!(
            "Execution {} finished with status {:?} in {}ms ({} completed, {} failed, {} skipped)",
            self.plan.id,
            self.plan.status,
            total_duration.as_millis(),
            self.plan.completed_nodes(),
            self.plan.failed_nodes(),
            self.plan.skipped_nodes()
        );

        self.plan
    }

    /// Launch or skip every node whose predecessors are terminal, until
    /// nothing changes or the admission gate is full
    fn schedule_ready(&mut self) {
        loop {
            let mut progressed = false;

            for position in 0..self.plan.nodes.len() {
                if self.plan.nodes[position].status != NodeStatus::Pending {
                    continue;
                }
                if self.halted {
                    self.skip(position, "Execution halted after an earlier failure".to_string());
                    progressed = true;
                    continue;
                }

                let node_id = self.plan.nodes[position].node_id.clone();
                match self.readiness(&node_id) {
                    Readiness::Waiting => {}
                    Readiness::Skip(reason) => {
                        self.skip(position, reason);
                        progressed = true;
                    }
                    Readiness::Ready => {
                        if !self.condition_holds(&node_id) {
                            self.skip(position, "Condition not met".to_string());
                            progressed = true;
                            continue;
                        }
                        let Ok(permit) = self.gate.clone().try_acquire_owned() else {
                            return;
                        };
                        self.launch(position, permit);
                        progressed = true;
                    }
                }
            }

            if !progressed {
                return;
            }
        }
    }

    fn readiness(&self, node_id: &NodeId) -> Readiness {
        let upstream: Vec<&NodeExecutionState> = self
            .dag
            .predecessors(node_id)
            .iter()
            .filter_map(|id| self.state(id))
            .collect();

        if upstream.iter().any(|s| !s.status.is_terminal()) {
            return Readiness::Waiting;
        }

        if self.plan.config.mode == ExecutionMode::Conditional {
            if let Some(failed) = upstream.iter().find(|s| s.status == NodeStatus::Failed) {
                return Readiness::Skip(format!("Upstream node '{}' failed", failed.label));
            }
            if !upstream.is_empty() && upstream.iter().all(|s| s.status == NodeStatus::Skipped) {
                return Readiness::Skip("All upstream nodes were skipped".to_string());
            }
            return Readiness::Ready;
        }

        match upstream.iter().find(|s| s.status != NodeStatus::Success) {
            Some(blocking) => Readiness::Skip(format!(
                "Upstream node '{}' {}",
                blocking.label, blocking.status
            )),
            None => Readiness::Ready,
        }
    }

    /// Conditions only gate nodes in conditional mode
    fn condition_holds(&self, node_id: &NodeId) -> bool {
        if self.plan.config.mode != ExecutionMode::Conditional {
            return true;
        }
        let Some(condition) = self
            .plan
            .graph
            .node(node_id)
            .and_then(|node| node.condition.as_ref())
        else {
            return true;
        };

        let mut upstream = UpstreamOutputs::new();
        for id in self.dag.predecessors(node_id) {
            if let (Some(state), Some(output)) = (self.state(&id), self.outputs.get(&id)) {
                upstream.insert(id.clone(), state.label.clone(), output.clone());
            }
        }
        condition.evaluate(&upstream)
    }

    fn launch(&mut self, position: usize, permit: OwnedSemaphorePermit) {
        let graph = Arc::clone(&self.plan.graph);
        let node_id = self.plan.nodes[position].node_id.clone();
        let Some(node) = graph.node(&node_id) else {
            self.fail_unstarted(
                position,
                ProcessorError::InvalidConfig(format!("Node {} is not in the graph", node_id)),
            );
            return;
        };

        let config = match self.templates.get(&node_id) {
            Some(compiled) => compiled
                .resolve(&ResolutionScope::new(&self.outputs, Some(&self.aliases)))
                .map_err(|e| ProcessorError::InvalidConfig(e.to_string())),
            None => Ok(node.config.clone()),
        };
        let config: NodeConfig = match config {
            Ok(config) => config,
            Err(error) => {
                self.fail_unstarted(position, error);
                return;
            }
        };

        let Some(processor) = self.processors.get(node.node_type()) else {
            self.fail_unstarted(position, ProcessorError::MissingProcessor(node.node_type()));
            return;
        };

        let upstream: HashMap<NodeId, NodeOutput> = self
            .dag
            .predecessors(&node_id)
            .into_iter()
            .filter_map(|id| self.outputs.get(&id).cloned().map(|output| (id, output)))
            .collect();

        let state = &mut self.plan.nodes[position];
        state.status = NodeStatus::Running;
        state.started_at = Some(Utc::now());
        tracing::debug!("Launching node {} ({})", state.label, state.node_type);

        let attempts = Arc::new(AtomicU32::new(0));
        self.attempt_counts.insert(position, attempts.clone());

        let task = NodeTask {
            execution_id: self.plan.id,
            node_id,
            label: state.label.clone(),
            config,
            upstream,
            processor,
            retry: self.plan.config.retry_policy.clone(),
            event_bus: self.event_bus.clone(),
            cancel: self.cancel.clone(),
            attempts,
        };

        self.tasks.spawn(async move {
            let _permit = permit;
            task.run().await
        });
    }

    fn finish_node(&mut self, result: NodeResult) {
        let Some(&position) = self.positions.get(&result.node_id) else {
            return;
        };
        let elapsed_ms = result.elapsed.as_millis() as u64;
        self.attempt_counts.remove(&position);

        let state = &mut self.plan.nodes[position];
        state.attempts = result.attempts;
        state.completed_at = Some(Utc::now());
        state.duration_ms = Some(elapsed_ms);
        let label = state.label.clone();

        match result.result {
            Ok(processed) => {
                let output = NodeOutput::success(processed.output, processed.data);
                state.status = NodeStatus::Success;
                state.outputs = Some(output.clone());
                self.outputs.insert(result.node_id.clone(), output);
                tracing::info!("Node {} completed in {}ms", label, elapsed_ms);

                let finished = self.plan.nodes.iter().filter(|s| s.status.is_terminal()).count();
                let message = format!("{}/{} nodes finished", finished, self.plan.nodes.len());
                self.publish(EventPayload::NodeProgress {
                    node_id: result.node_id.clone(),
                    node_label: label.clone(),
                    progress: 1.0,
                    message: Some(message),
                });
                self.publish(EventPayload::NodeComplete {
                    node_id: result.node_id,
                    node_label: label,
                    status: NodeStatus::Success,
                    duration_ms: elapsed_ms,
                    attempts: result.attempts,
                    error: None,
                });
            }
            Err(error) => {
                let error = error.to_string();
                state.status = NodeStatus::Failed;
                state.error = Some(error.clone());
                tracing::error!(
                    "Node {} failed after {} attempt(s): {}",
                    label,
                    result.attempts,
                    error
                );
                if self.plan.config.mode == ExecutionMode::Sequential {
                    self.halted = true;
                }

                self.publish(EventPayload::NodeComplete {
                    node_id: result.node_id,
                    node_label: label,
                    status: NodeStatus::Failed,
                    duration_ms: elapsed_ms,
                    attempts: result.attempts,
                    error: Some(error),
                });
            }
        }
    }

    /// Fail a node that never reached its processor
    fn fail_unstarted(&mut self, position: usize, error: ProcessorError) {
        let state = &mut self.plan.nodes[position];
        let error = error.to_string();
        state.status = NodeStatus::Failed;
        state.error = Some(error.clone());
        state.completed_at = Some(Utc::now());
        tracing::error!("Node {} could not be started: {}", state.label, error);

        let payload = EventPayload::NodeComplete {
            node_id: state.node_id.clone(),
            node_label: state.label.clone(),
            status: NodeStatus::Failed,
            duration_ms: 0,
            attempts: 0,
            error: Some(error),
        };
        if self.plan.config.mode == ExecutionMode::Sequential {
            self.halted = true;
        }
        self.publish(payload);
    }

    fn skip(&mut self, position: usize, reason: String) {
        let state = &mut self.plan.nodes[position];
        state.status = NodeStatus::Skipped;
        state.completed_at = Some(Utc::now());
        tracing::info!("Skipping node {}: {}", state.label, reason);

        let payload = EventPayload::NodeComplete {
            node_id: state.node_id.clone(),
            node_label: state.label.clone(),
            status: NodeStatus::Skipped,
            duration_ms: 0,
            attempts: 0,
            error: None,
        };
        state.skip_reason = Some(reason);
        self.publish(payload);
    }

    /// Close out every node still open when the run stops
    fn settle(&mut self, running_error: &str, skip_reason: &str) {
        for position in 0..self.plan.nodes.len() {
            let status = self.plan.nodes[position].status;
            match status {
                NodeStatus::Running => {
                    let attempts = self
                        .attempt_counts
                        .get(&position)
                        .map_or(0, |count| count.load(Ordering::SeqCst));
                    let state = &mut self.plan.nodes[position];
                    state.attempts = attempts;
                    state.status = NodeStatus::Failed;
                    state.error = Some(running_error.to_string());
                    state.completed_at = Some(Utc::now());
                    let payload = EventPayload::NodeComplete {
                        node_id: state.node_id.clone(),
                        node_label: state.label.clone(),
                        status: NodeStatus::Failed,
                        duration_ms: 0,
                        attempts: state.attempts,
                        error: Some(running_error.to_string()),
                    };
                    self.publish(payload);
                }
                NodeStatus::Pending => self.skip(position, skip_reason.to_string()),
                _ => {}
            }
        }
    }

    fn state(&self, node_id: &NodeId) -> Option<&NodeExecutionState> {
        self.positions
            .get(node_id)
            .map(|&position| &self.plan.nodes[position])
    }

    fn publish(&self, payload: EventPayload) {
        self.event_bus
            .publish(ExecutionEvent::new(self.plan.id, payload));
    }

    async fn snapshot(&self) {
        self.plans.write().await.update(self.plan.clone());
    }
}

/// One node's attempts, run off the driver
struct NodeTask {
    execution_id: ExecutionId,
    node_id: NodeId,
    label: String,
    config: NodeConfig,
    upstream: HashMap<NodeId, NodeOutput>,
    processor: Arc<dyn NodeProcessor>,
    retry: RetryPolicy,
    event_bus: EventBus,
    cancel: CancellationToken,
    attempts: Arc<AtomicU32>,
}

impl NodeTask {
    async fn run(self) -> NodeResult {
        let started = Instant::now();
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            self.publish(EventPayload::NodeStart {
                node_id: self.node_id.clone(),
                node_label: self.label.clone(),
                attempt,
            });

            match self.attempt(attempt).await {
                Ok(output) => break Ok(output),
                Err(error)
                    if error.is_retryable()
                        && !self.cancel.is_cancelled()
                        && self.retry.should_retry(attempt) =>
                {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Node {} attempt {} failed, retrying in {}ms: {}",
                        self.label,
                        attempt,
                        delay.as_millis(),
                        error
                    );
                    self.publish(EventPayload::NodeProgress {
                        node_id: self.node_id.clone(),
                        node_label: self.label.clone(),
                        progress: attempt as f32
                            / self.retry.max_retries.saturating_add(1) as f32,
                        message: Some(format!(
                            "Attempt {} failed: {}; retrying in {}ms",
                            attempt,
                            error,
                            delay.as_millis()
                        )),
                    });

                    tokio::select! {
                        _ = self.cancel.cancelled() => break Err(ProcessorError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => break Err(error),
            }
        };

        NodeResult {
            node_id: self.node_id,
            attempts: attempt,
            elapsed: started.elapsed(),
            result,
        }
    }

    /// Run the processor on its own task so a panic fails only this attempt
    async fn attempt(&self, attempt: u32) -> Result<ProcessorOutput, ProcessorError> {
        let request = ProcessorRequest {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            label: self.label.clone(),
            config: self.config.clone(),
            upstream: self.upstream.clone(),
            attempt,
            cancel: self.cancel.clone(),
        };
        let processor = Arc::clone(&self.processor);

        match tokio::spawn(async move { processor.execute(request).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ProcessorError::failed(format!(
                "Processor panicked: {}",
                panic_message(e)
            ))),
            Err(e) => Err(ProcessorError::failed(e.to_string())),
        }
    }

    fn publish(&self, payload: EventPayload) {
        self.event_bus
            .publish(ExecutionEvent::new(self.execution_id, payload));
    }
}

fn panic_message(error: JoinError) -> String {
    let panic = error.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
