use super::processor::NodeTypeRegistry;
use crate::template::CompiledConfig;
use crate::types::{Edge, GraphModel, NodeId, NodeRole, NodeTypeStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Machine-readable kind of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    EmptyWorkflow,
    DuplicateNodeId,
    DuplicateLabel,
    MissingEdgeSource,
    MissingEdgeTarget,
    OrphanNode,
    OrphanNodes,
    MissingInputNode,
    MissingOutputNode,
    Cycle,
    UnsupportedNodeType,
    DeprecatedNodeType,
    ExperimentalNodeType,
    MissingConfigField,
    UnknownTemplateReference,
}

/// One error or warning produced by the validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
            edge_id: None,
            suggestion: None,
        }
    }

    fn node(mut self, node_id: &NodeId) -> Self {
        self.node_id = Some(node_id.clone());
        self
    }

    fn edge(mut self, edge_id: &str) -> Self {
        self.edge_id = Some(edge_id.to_string());
        self
    }

    fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Display counters for a validated graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub input_nodes: usize,
    pub output_nodes: usize,
}

/// Outcome of validating a graph; never an error by itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub stats: GraphStats,
}

impl ValidationReport {
    pub fn has_code(&self, code: IssueCode) -> bool {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .any(|issue| issue.code == code)
    }
}

/// Checks structural invariants of a graph before it is scheduled
pub struct GraphValidator<'a> {
    registry: &'a dyn NodeTypeRegistry,
}

impl<'a> GraphValidator<'a> {
    pub fn new(registry: &'a dyn NodeTypeRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(&self, graph: &GraphModel) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let stats = GraphStats {
            total_nodes: graph.nodes.len(),
            total_edges: graph.edges.len(),
            input_nodes: count_role(graph, NodeRole::Input),
            output_nodes: count_role(graph, NodeRole::Output),
        };

        if graph.nodes.is_empty() {
            errors.push(
                ValidationIssue::new(IssueCode::EmptyWorkflow, "Workflow has no nodes")
                    .suggest("Add a data input node and a data output node"),
            );
            return finish(errors, warnings, stats);
        }

        check_uniqueness(graph, &mut errors);
        check_edges(graph, &mut errors);
        check_orphans(graph, &mut errors, &mut warnings);

        if stats.input_nodes == 0 {
            errors.push(
                ValidationIssue::new(IssueCode::MissingInputNode, "Workflow has no input node")
                    .suggest("Add a dataInput node to feed the workflow"),
            );
        }
        if stats.output_nodes == 0 {
            errors.push(
                ValidationIssue::new(IssueCode::MissingOutputNode, "Workflow has no output node")
                    .suggest("Add a dataOutput node to collect the results"),
            );
        }

        for cycle in find_cycles(graph) {
            let mut path: Vec<&str> = Vec::with_capacity(cycle.len() + 1);
            if let Some(first) = cycle.first() {
                path.push(first.source.as_str());
            }
            path.extend(cycle.iter().map(|edge| edge.target.as_str()));
            let edge_ids: Vec<&str> = cycle.iter().map(|edge| edge.id.as_str()).collect();

            let mut issue = ValidationIssue::new(
                IssueCode::Cycle,
                format!(
                    "Circular dependency: {} (edges {})",
                    path.join(" -> "),
                    edge_ids.join(", ")
                ),
            )
            .suggest("Remove one of the edges to break the cycle");
            if let Some(first) = cycle.first() {
                issue = issue.node(&first.source).edge(&first.id);
            }
            errors.push(issue);
        }

        self.check_node_types(graph, &mut errors, &mut warnings);
        check_configs(graph, &mut errors, &mut warnings);

        let report = finish(errors, warnings, stats);
        tracing::debug!(
            "Validated workflow: {} nodes, {} errors, {} warnings",
            report.stats.total_nodes,
            report.errors.len(),
            report.warnings.len()
        );
        report
    }

    fn check_node_types(
        &self,
        graph: &GraphModel,
        errors: &mut Vec<ValidationIssue>,
        warnings: &mut Vec<ValidationIssue>,
    ) {
        for node in &graph.nodes {
            let node_type = node.node_type();
            let alternatives = || {
                self.registry
                    .similar_types(node_type)
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };

            match self.registry.status(node_type) {
                NodeTypeStatus::Supported => {}
                NodeTypeStatus::Unsupported => {
                    let mut issue = ValidationIssue::new(
                        IssueCode::UnsupportedNodeType,
                        format!("Node '{}' uses unsupported type {}", node.label, node_type),
                    )
                    .node(&node.id);
                    let similar = alternatives();
                    if !similar.is_empty() {
                        issue = issue.suggest(format!("Use one of: {}", similar));
                    }
                    errors.push(issue);
                }
                NodeTypeStatus::Deprecated => {
                    let similar = alternatives();
                    let suggestion = if similar.is_empty() {
                        "Migrate to a supported node type".to_string()
                    } else {
                        format!("Migrate to one of: {}", similar)
                    };
                    warnings.push(
                        ValidationIssue::new(
                            IssueCode::DeprecatedNodeType,
                            format!("Node '{}' uses deprecated type {}", node.label, node_type),
                        )
                        .node(&node.id)
                        .suggest(suggestion),
                    );
                }
                NodeTypeStatus::Experimental => {
                    warnings.push(
                        ValidationIssue::new(
                            IssueCode::ExperimentalNodeType,
                            format!("Node '{}' uses experimental type {}", node.label, node_type),
                        )
                        .node(&node.id),
                    );
                }
            }
        }
    }
}

fn finish(
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    stats: GraphStats,
) -> ValidationReport {
    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        stats,
    }
}

fn count_role(graph: &GraphModel, role: NodeRole) -> usize {
    graph
        .nodes
        .iter()
        .filter(|n| n.node_type().role() == role)
        .count()
}

fn check_uniqueness(graph: &GraphModel, errors: &mut Vec<ValidationIssue>) {
    let mut ids = HashSet::new();
    let mut labels = HashSet::new();

    for node in &graph.nodes {
        if !ids.insert(&node.id) {
            errors.push(
                ValidationIssue::new(
                    IssueCode::DuplicateNodeId,
                    format!("Duplicate node id {}", node.id),
                )
                .node(&node.id),
            );
        }
        if !labels.insert(node.label.as_str()) {
            errors.push(
                ValidationIssue::new(
                    IssueCode::DuplicateLabel,
                    format!("Duplicate node label '{}'", node.label),
                )
                .node(&node.id)
                .suggest("Give every node a unique label so templates can refer to it"),
            );
        }
    }
}

fn check_edges(graph: &GraphModel, errors: &mut Vec<ValidationIssue>) {
    let ids: HashSet<&NodeId> = graph.nodes.iter().map(|n| &n.id).collect();

    for edge in &graph.edges {
        if !ids.contains(&edge.source) {
            errors.push(
                ValidationIssue::new(
                    IssueCode::MissingEdgeSource,
                    format!("Edge {} references missing source node {}", edge.id, edge.source),
                )
                .edge(&edge.id),
            );
        }
        if !ids.contains(&edge.target) {
            errors.push(
                ValidationIssue::new(
                    IssueCode::MissingEdgeTarget,
                    format!("Edge {} references missing target node {}", edge.id, edge.target),
                )
                .edge(&edge.id),
            );
        }
    }
}

fn check_orphans(
    graph: &GraphModel,
    errors: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<ValidationIssue>,
) {
    let connected: HashSet<&NodeId> = graph
        .edges
        .iter()
        .flat_map(|edge| [&edge.source, &edge.target])
        .collect();
    let orphans: Vec<_> = graph
        .nodes
        .iter()
        .filter(|n| !connected.contains(&n.id))
        .collect();

    match orphans.as_slice() {
        [] => {}
        [orphan] => warnings.push(
            ValidationIssue::new(
                IssueCode::OrphanNode,
                format!("Node '{}' is not connected to any other node", orphan.label),
            )
            .node(&orphan.id),
        ),
        many => {
            let labels: Vec<&str> = many.iter().map(|n| n.label.as_str()).collect();
            errors.push(
                ValidationIssue::new(
                    IssueCode::OrphanNodes,
                    format!(
                        "{} nodes are not connected: {}",
                        many.len(),
                        labels.join(", ")
                    ),
                )
                .suggest("Connect the nodes or remove the unused ones"),
            );
        }
    }
}

fn check_configs(
    graph: &GraphModel,
    errors: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<ValidationIssue>,
) {
    let known: HashSet<&str> = graph
        .nodes
        .iter()
        .flat_map(|n| [n.id.as_str(), n.label.as_str()])
        .collect();

    for node in &graph.nodes {
        for field in node.config.missing_required_fields() {
            errors.push(
                ValidationIssue::new(
                    IssueCode::MissingConfigField,
                    format!("Node '{}' is missing required field '{}'", node.label, field),
                )
                .node(&node.id),
            );
        }

        let Ok(compiled) = CompiledConfig::compile(&node.config) else {
            continue;
        };
        let mut reported = HashSet::new();
        for path in compiled.variables() {
            let identifier = path.identifier.as_str();
            if !known.contains(identifier) && reported.insert(identifier.to_string()) {
                warnings.push(
                    ValidationIssue::new(
                        IssueCode::UnknownTemplateReference,
                        format!(
                            "Node '{}' references unknown node '{}' in {{{{{}}}}}",
                            node.label, identifier, path
                        ),
                    )
                    .node(&node.id)
                    .suggest("The placeholder will be passed through unresolved"),
                );
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Directed cycles as edge sequences, found by DFS with a recursion stack
fn find_cycles(graph: &GraphModel) -> Vec<Vec<&Edge>> {
    let mut adjacency: HashMap<&str, Vec<&Edge>> = HashMap::new();
    for edge in &graph.edges {
        adjacency.entry(edge.source.as_str()).or_default().push(edge);
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    // Depth in `path` at which a node on the recursion stack was entered
    let mut entered: HashMap<&str, usize> = HashMap::new();
    let mut cycles = Vec::new();

    for start in &graph.nodes {
        let start = start.id.as_str();
        if marks.contains_key(start) {
            continue;
        }

        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        let mut path: Vec<&Edge> = Vec::new();
        marks.insert(start, Mark::Visiting);
        entered.insert(start, 0);

        while let Some(&(node, next)) = stack.last() {
            let outgoing = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);

            let Some(edge) = outgoing.get(next).copied() else {
                marks.insert(node, Mark::Done);
                entered.remove(node);
                stack.pop();
                path.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            let target = edge.target.as_str();
            match marks.get(target) {
                Some(Mark::Visiting) => {
                    let from = entered.get(target).copied().unwrap_or(0);
                    let mut cycle = path[from..].to_vec();
                    cycle.push(edge);
                    cycles.push(cycle);
                }
                Some(Mark::Done) => {}
                None => {
                    path.push(edge);
                    marks.insert(target, Mark::Visiting);
                    entered.insert(target, path.len());
                    stack.push((target, 0));
                }
            }
        }
    }

    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    struct StaticRegistry(HashMap<NodeType, NodeTypeStatus>);

    impl StaticRegistry {
        fn all_supported() -> Self {
            Self(HashMap::new())
        }
    }

    impl NodeTypeRegistry for StaticRegistry {
        fn status(&self, node_type: NodeType) -> NodeTypeStatus {
            self.0
                .get(&node_type)
                .copied()
                .unwrap_or(NodeTypeStatus::Supported)
        }

        fn similar_types(&self, node_type: NodeType) -> Vec<NodeType> {
            match node_type {
                NodeType::Discord => vec![NodeType::Slack],
                _ => vec![],
            }
        }
    }

    fn input(id: &str) -> Node {
        Node::new(id, format!("Input {}", id), NodeConfig::DataInput(DataInputConfig::default()))
    }

    fn output(id: &str) -> Node {
        Node::new(id, format!("Output {}", id), NodeConfig::DataOutput(DataOutputConfig::default()))
    }

    fn llm(id: &str, prompt: &str) -> Node {
        Node::new(
            id,
            format!("LLM {}", id),
            NodeConfig::LlmTask(LlmTaskConfig {
                prompt: prompt.to_string(),
                ..Default::default()
            }),
        )
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<Edge> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (s, t))| Edge::new(format!("e{}", i + 1), *s, *t))
            .collect()
    }

    fn validate(graph: &GraphModel) -> ValidationReport {
        GraphValidator::new(&StaticRegistry::all_supported()).validate(graph)
    }

    #[test]
    fn test_valid_linear_workflow() {
        let graph = GraphModel::new(
            vec![input("in"), llm("llm", "Summarize {{in.output}}"), output("out")],
            edges(&[("in", "llm"), ("llm", "out")]),
        );

        let report = validate(&graph);
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(
            report.stats,
            GraphStats {
                total_nodes: 3,
                total_edges: 2,
                input_nodes: 1,
                output_nodes: 1,
            }
        );
    }

    #[test]
    fn test_cycle_is_reported_with_edge_sequence() {
        let graph = GraphModel::new(
            vec![input("in"), llm("a", "x"), llm("b", "y"), output("out")],
            edges(&[("in", "a"), ("a", "b"), ("b", "a"), ("b", "out")]),
        );

        let report = validate(&graph);
        assert!(!report.is_valid);
        let cycle = report
            .errors
            .iter()
            .find(|e| e.code == IssueCode::Cycle)
            .unwrap();
        assert!(cycle.message.contains("a -> b -> a"), "{}", cycle.message);
        assert!(cycle.message.contains("e2, e3"));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let graph = GraphModel::new(
            vec![input("in"), llm("a", "x"), output("out")],
            edges(&[("in", "a"), ("a", "a"), ("a", "out")]),
        );

        let report = validate(&graph);
        assert!(report.has_code(IssueCode::Cycle));
        assert!(!report.is_valid);
    }

    #[test]
    fn test_single_orphan_is_tolerated() {
        let graph = GraphModel::new(
            vec![input("in"), llm("a", "x"), output("out")],
            edges(&[("in", "a")]),
        );

        let report = validate(&graph);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, IssueCode::OrphanNode);
        assert_eq!(report.warnings[0].node_id, Some(NodeId::new("out")));
    }

    #[test]
    fn test_multiple_orphans_are_an_error() {
        let graph = GraphModel::new(
            vec![input("in"), llm("a", "x"), llm("b", "y"), output("out")],
            edges(&[("in", "out")]),
        );

        let report = validate(&graph);
        assert!(!report.is_valid);
        let orphans = report
            .errors
            .iter()
            .find(|e| e.code == IssueCode::OrphanNodes)
            .unwrap();
        assert!(orphans.message.contains("LLM a, LLM b"));
    }

    #[test]
    fn test_edges_to_missing_nodes() {
        let graph = GraphModel::new(
            vec![input("in"), output("out")],
            edges(&[("in", "out"), ("ghost", "out"), ("in", "nowhere")]),
        );

        let report = validate(&graph);
        assert!(!report.is_valid);
        let missing: Vec<_> = report
            .errors
            .iter()
            .map(|e| (e.code, e.edge_id.clone()))
            .collect();
        assert_eq!(
            missing,
            vec![
                (IssueCode::MissingEdgeSource, Some("e2".to_string())),
                (IssueCode::MissingEdgeTarget, Some("e3".to_string())),
            ]
        );
    }

    #[test]
    fn test_missing_input_and_output_roles() {
        let graph = GraphModel::new(vec![llm("a", "x"), llm("b", "y")], edges(&[("a", "b")]));

        let report = validate(&graph);
        assert!(report.has_code(IssueCode::MissingInputNode));
        assert!(report.has_code(IssueCode::MissingOutputNode));
        assert!(report.errors.iter().all(|e| e.suggestion.is_some()));
    }

    #[test]
    fn test_empty_workflow() {
        let report = validate(&GraphModel::default());
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, IssueCode::EmptyWorkflow);
    }

    #[test]
    fn test_node_type_support_levels() {
        let registry = StaticRegistry(HashMap::from([
            (NodeType::Discord, NodeTypeStatus::Unsupported),
            (NodeType::Database, NodeTypeStatus::Deprecated),
            (NodeType::LlmTask, NodeTypeStatus::Experimental),
        ]));
        let discord = Node::new(
            "d",
            "Notify",
            NodeConfig::Discord(DiscordConfig {
                webhook_url: "https://discord.test/hook".to_string(),
                message: "done".to_string(),
            }),
        );
        let database = Node::new(
            "db",
            "Store",
            NodeConfig::Database(DatabaseConfig {
                connection: "postgres://localhost".to_string(),
                query: "select 1".to_string(),
                operation: None,
            }),
        );
        let graph = GraphModel::new(
            vec![input("in"), llm("a", "x"), database, discord, output("out")],
            edges(&[("in", "a"), ("a", "db"), ("db", "d"), ("d", "out")]),
        );

        let report = GraphValidator::new(&registry).validate(&graph);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, IssueCode::UnsupportedNodeType);
        assert_eq!(report.errors[0].suggestion.as_deref(), Some("Use one of: slack"));

        let codes: Vec<_> = report.warnings.iter().map(|w| w.code).collect();
        assert_eq!(
            codes,
            vec![IssueCode::ExperimentalNodeType, IssueCode::DeprecatedNodeType]
        );
        assert!(report.warnings[1].suggestion.is_some());
    }

    #[test]
    fn test_missing_required_config() {
        let scraper = Node::new(
            "s",
            "Scraper",
            NodeConfig::WebScraping(WebScrapingConfig::default()),
        );
        let graph = GraphModel::new(
            vec![input("in"), scraper, output("out")],
            edges(&[("in", "s"), ("s", "out")]),
        );

        let report = validate(&graph);
        assert!(!report.is_valid);
        assert_eq!(report.errors[0].code, IssueCode::MissingConfigField);
        assert!(report.errors[0].message.contains("'url'"));
    }

    #[test]
    fn test_template_references_by_id_and_label() {
        let graph = GraphModel::new(
            vec![
                input("in"),
                llm("a", "{{Input in.output}} and {{in}}"),
                llm("b", "{{a.output}} {{ghost.data}} {{ghost.output}}"),
                output("out"),
            ],
            edges(&[("in", "a"), ("a", "b"), ("b", "out")]),
        );

        let report = validate(&graph);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, IssueCode::UnknownTemplateReference);
        assert_eq!(report.warnings[0].node_id, Some(NodeId::new("b")));
    }

    #[test]
    fn test_duplicate_labels_and_ids() {
        let mut twin = llm("a", "y");
        twin.label = "LLM a".to_string();
        let graph = GraphModel::new(
            vec![input("in"), llm("a", "x"), twin, output("out")],
            edges(&[("in", "a"), ("a", "out")]),
        );

        let report = validate(&graph);
        assert!(report.has_code(IssueCode::DuplicateNodeId));
        assert!(report.has_code(IssueCode::DuplicateLabel));
    }
}
