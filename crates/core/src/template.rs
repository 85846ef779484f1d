// Variable substitution between nodes: `{{id.property}}` templates

use crate::types::{NodeConfig, NodeId, NodeOutput};
use serde_json::Value;
use std::collections::HashMap;

/// Reference parsed out of a `{{ ... }}` placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablePath {
    /// Node id or label alias
    pub identifier: String,
    /// `None` references the whole output
    pub property: Option<String>,
}

impl VariablePath {
    fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains('{') || trimmed.contains('}') {
            return None;
        }

        match trimmed.split_once('.') {
            Some((identifier, property)) => {
                let identifier = identifier.trim();
                let property = property.trim();
                if identifier.is_empty() || property.is_empty() {
                    return None;
                }
                Some(Self {
                    identifier: identifier.to_string(),
                    property: Some(property.to_string()),
                })
            }
            None => Some(Self {
                identifier: trimmed.to_string(),
                property: None,
            }),
        }
    }
}

impl std::fmt::Display for VariablePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{}.{}", self.identifier, property),
            None => f.write_str(&self.identifier),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Variable { raw: String, path: VariablePath },
}

/// A template string parsed once and rendered many times
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CompiledTemplate {
    pub fn compile(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            let after_open = &rest[start + 2..];
            let Some(end) = after_open.find("}}") else {
                break;
            };
            let inner = &after_open[..end];

            // An earlier `{{` without its own `}}` is plain text.
            if let Some(nested) = inner.rfind("{{") {
                literal.push_str(&rest[..start + 2 + nested]);
                rest = &rest[start + 2 + nested..];
                continue;
            }

            literal.push_str(&rest[..start]);
            let raw = &rest[start..start + end + 4];
            match VariablePath::parse(inner) {
                Some(path) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Variable {
                        raw: raw.to_string(),
                        path,
                    });
                }
                None => literal.push_str(raw),
            }
            rest = &after_open[end + 2..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            source: text.to_string(),
            segments,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_variables(&self) -> bool {
        self.variables().next().is_some()
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariablePath> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable { path, .. } => Some(path),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every reference; unresolved ones are kept verbatim
    pub fn render(&self, scope: &ResolutionScope<'_>) -> String {
        let mut rendered = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Variable { raw, path } => match scope.resolve(path) {
                    Some(value) => rendered.push_str(&value),
                    None => {
                        tracing::warn!("Unresolved template reference {} left unchanged", raw);
                        rendered.push_str(raw);
                    }
                },
            }
        }
        rendered
    }
}

/// Outputs and aliases a template is resolved against
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScope<'a> {
    outputs: &'a HashMap<NodeId, NodeOutput>,
    aliases: Option<&'a HashMap<String, NodeId>>,
}

impl<'a> ResolutionScope<'a> {
    pub fn new(
        outputs: &'a HashMap<NodeId, NodeOutput>,
        aliases: Option<&'a HashMap<String, NodeId>>,
    ) -> Self {
        Self { outputs, aliases }
    }

    /// Literal node id first, then the label alias table
    pub fn lookup(&self, identifier: &str) -> Option<&'a NodeOutput> {
        self.outputs
            .get(&NodeId::new(identifier))
            .or_else(|| {
                self.aliases
                    .and_then(|aliases| aliases.get(identifier))
                    .and_then(|id| self.outputs.get(id))
            })
    }

    pub fn resolve(&self, path: &VariablePath) -> Option<String> {
        let output = self.lookup(&path.identifier)?;

        match path.property.as_deref() {
            None | Some("output") => stringify(&output.output),
            Some("data") => output.data.as_ref().and_then(stringify),
            Some("error") => output.error.clone(),
            Some("status") => Some(output.status.as_str().to_string()),
            Some(nested) => {
                let record = serde_json::to_value(output).ok()?;
                lookup_path(&record, nested).and_then(stringify)
            }
        }
    }
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve all `{{...}}` references in `template`
pub fn substitute(
    template: &str,
    outputs: &HashMap<NodeId, NodeOutput>,
    aliases: Option<&HashMap<String, NodeId>>,
) -> String {
    CompiledTemplate::compile(template).render(&ResolutionScope::new(outputs, aliases))
}

/// All referenced paths, in order of first appearance
pub fn extract_variables(template: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for path in CompiledTemplate::compile(template).variables() {
        let path = path.to_string();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

pub fn has_variables(template: &str) -> bool {
    CompiledTemplate::compile(template).has_variables()
}

/// Result of checking a template's references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableCheck {
    pub is_valid: bool,
    pub missing_nodes: Vec<String>,
}

/// Check that every referenced node has produced an output
pub fn validate_variables(
    template: &str,
    outputs: &HashMap<NodeId, NodeOutput>,
    aliases: Option<&HashMap<String, NodeId>>,
) -> VariableCheck {
    let scope = ResolutionScope::new(outputs, aliases);
    let mut missing_nodes: Vec<String> = Vec::new();

    for path in CompiledTemplate::compile(template).variables() {
        if scope.lookup(&path.identifier).is_none() && !missing_nodes.contains(&path.identifier) {
            missing_nodes.push(path.identifier.clone());
        }
    }

    VariableCheck {
        is_valid: missing_nodes.is_empty(),
        missing_nodes,
    }
}

/// A node configuration with every templated string pre-compiled
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    base: Value,
    templates: Vec<(String, CompiledTemplate)>,
}

impl CompiledConfig {
    pub fn compile(config: &NodeConfig) -> Result<Self, serde_json::Error> {
        let base = serde_json::to_value(config)?;
        let mut templates = Vec::new();
        collect_templates(&base, String::new(), &mut templates);
        Ok(Self { base, templates })
    }

    pub fn has_variables(&self) -> bool {
        !self.templates.is_empty()
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariablePath> {
        self.templates.iter().flat_map(|(_, t)| t.variables())
    }

    /// Render every templated field and rebuild the typed config
    pub fn resolve(&self, scope: &ResolutionScope<'_>) -> Result<NodeConfig, serde_json::Error> {
        let mut value = self.base.clone();
        for (pointer, template) in &self.templates {
            if let Some(slot) = value.pointer_mut(pointer) {
                *slot = Value::String(template.render(scope));
            }
        }
        serde_json::from_value(value)
    }
}

fn collect_templates(value: &Value, pointer: String, out: &mut Vec<(String, CompiledTemplate)>) {
    match value {
        Value::String(text) => {
            let template = CompiledTemplate::compile(text);
            if template.has_variables() {
                out.push((pointer, template));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_templates(item, format!("{}/{}", pointer, i), out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_templates(item, format!("{}/{}", pointer, escaped), out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LlmTaskConfig, NodeStatus};
    use serde_json::json;

    fn outputs() -> HashMap<NodeId, NodeOutput> {
        let mut outputs = HashMap::new();
        outputs.insert(
            NodeId::new("a"),
            NodeOutput::success(json!("x"), Some(json!({"title": "Hello", "items": [1, 2]}))),
        );
        outputs.insert(NodeId::new("n2"), NodeOutput::success(json!(42), None));
        outputs
    }

    #[test]
    fn test_substitute_output() {
        assert_eq!(substitute("{{a.output}}", &outputs(), None), "x");
        assert_eq!(substitute("Value: {{ a }}!", &outputs(), None), "Value: x!");
        assert_eq!(substitute("{{n2.output}}", &outputs(), None), "42");
    }

    #[test]
    fn test_missing_reference_left_unchanged() {
        let empty = HashMap::new();
        assert_eq!(
            substitute("{{missing.output}}", &empty, None),
            "{{missing.output}}"
        );
        assert_eq!(substitute("{{a.error}}", &outputs(), None), "{{a.error}}");
        assert_eq!(substitute("{{a.nope}}", &outputs(), None), "{{a.nope}}");
    }

    #[test]
    fn test_known_and_nested_properties() {
        let out = outputs();
        assert_eq!(substitute("{{a.status}}", &out, None), "success");
        let data: Value = serde_json::from_str(&substitute("{{a.data}}", &out, None)).unwrap();
        assert_eq!(data, json!({"title": "Hello", "items": [1, 2]}));
        assert_eq!(substitute("{{a.data.title}}", &out, None), "Hello");
        assert_eq!(substitute("{{a.data.items.1}}", &out, None), "2");
    }

    #[test]
    fn test_alias_resolution_prefers_node_id() {
        let out = outputs();
        let mut aliases = HashMap::new();
        aliases.insert("Scraper".to_string(), NodeId::new("a"));
        aliases.insert("n2".to_string(), NodeId::new("a"));

        assert_eq!(substitute("{{Scraper.output}}", &out, Some(&aliases)), "x");
        // `n2` is a real node id, so the alias is ignored.
        assert_eq!(substitute("{{n2.output}}", &out, Some(&aliases)), "42");
    }

    #[test]
    fn test_malformed_placeholders_are_literal() {
        let out = outputs();
        assert_eq!(substitute("{{}} and {{ }}", &out, None), "{{}} and {{ }}");
        assert_eq!(substitute("open {{a.output", &out, None), "open {{a.output");
        assert_eq!(substitute("x {{ {{a}} y", &out, None), "x {{ x y");
        assert_eq!(substitute("{{a.}}", &out, None), "{{a.}}");
    }

    #[test]
    fn test_extract_and_has_variables() {
        let text = "Summarize {{scraper.output}} for {{ user }} and {{scraper.output}}";
        assert_eq!(extract_variables(text), vec!["scraper.output", "user"]);
        assert!(has_variables(text));
        assert!(!has_variables("no templates here"));
    }

    #[test]
    fn test_validate_variables() {
        let out = outputs();
        let check = validate_variables("{{a.output}} {{b.output}} {{b.data}}", &out, None);
        assert!(!check.is_valid);
        assert_eq!(check.missing_nodes, vec!["b"]);

        assert!(validate_variables("{{a}}", &out, None).is_valid);
    }

    #[test]
    fn test_compiled_config_resolution() {
        let config = NodeConfig::LlmTask(LlmTaskConfig {
            prompt: "Title: {{a.data.title}} / {{ghost.output}}".to_string(),
            model: Some("small".to_string()),
            ..Default::default()
        });

        let compiled = CompiledConfig::compile(&config).unwrap();
        assert!(compiled.has_variables());
        assert_eq!(compiled.variables().count(), 2);

        let out = outputs();
        let resolved = compiled.resolve(&ResolutionScope::new(&out, None)).unwrap();
        match resolved {
            NodeConfig::LlmTask(c) => {
                assert_eq!(c.prompt, "Title: Hello / {{ghost.output}}");
                assert_eq!(c.model.as_deref(), Some("small"));
            }
            other => panic!("Unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_status_of_failed_output_record() {
        let mut out = HashMap::new();
        out.insert(
            NodeId::new("f"),
            NodeOutput {
                output: Value::Null,
                data: None,
                error: Some("bad gateway".to_string()),
                status: NodeStatus::Failed,
            },
        );
        assert_eq!(substitute("{{f.error}} ({{f.status}})", &out, None), "bad gateway (failed)");
        assert_eq!(substitute("{{f}}", &out, None), "{{f}}");
    }
}
