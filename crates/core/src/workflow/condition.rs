use crate::types::{NodeId, NodeOutput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outputs of a node's direct predecessors, addressable by id or label
#[derive(Debug, Clone, Default)]
pub struct UpstreamOutputs {
    entries: Vec<(NodeId, String, NodeOutput)>,
}

impl UpstreamOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node_id: NodeId, label: impl Into<String>, output: NodeOutput) {
        self.entries.push((node_id, label.into(), output));
    }

    /// Look up by node id first, then by label
    pub fn get(&self, key: &str) -> Option<&NodeOutput> {
        self.entries
            .iter()
            .find(|(id, _, _)| id.as_str() == key)
            .or_else(|| self.entries.iter().find(|(_, label, _)| label == key))
            .map(|(_, _, output)| output)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &str, &NodeOutput)> {
        self.entries
            .iter()
            .map(|(id, label, output)| (id, label.as_str(), output))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat `key.property` view used by condition expressions
    fn context(&self) -> HashMap<String, String> {
        let mut context = HashMap::new();
        for (id, label, output) in &self.entries {
            for key in [id.as_str(), label.as_str()] {
                let output_text = text(&output.output);
                context.insert(key.to_string(), output_text.clone());
                context.insert(format!("{}.output", key), output_text);
                context.insert(format!("{}.status", key), output.status.as_str().to_string());
                if let Some(error) = &output.error {
                    context.insert(format!("{}.error", key), error.clone());
                }
                if let Some(data) = &output.data {
                    context.insert(format!("{}.data", key), text(data));
                    if let Value::Object(fields) = data {
                        for (field, value) in fields {
                            context.insert(format!("{}.data.{}", key, field), text(value));
                        }
                    }
                }
            }
        }
        context
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub type ConditionFn = Arc<dyn Fn(&UpstreamOutputs) -> bool + Send + Sync>;

/// Predicate deciding whether a node runs in conditional mode
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeCondition {
    /// Simple comparison such as `Classifier.output == spam`
    Expression(String),
    /// Arbitrary check over the predecessors' outputs
    #[serde(skip)]
    Predicate(ConditionFn),
}

impl NodeCondition {
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression(expression.into())
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&UpstreamOutputs) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    pub fn evaluate(&self, upstream: &UpstreamOutputs) -> bool {
        match self {
            NodeCondition::Predicate(predicate) => predicate(upstream),
            NodeCondition::Expression(expression) => {
                match evaluate_condition(expression, &upstream.context()) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!("Condition '{}' could not be evaluated: {}", expression, e);
                        false
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for NodeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeCondition::Expression(expression) => {
                f.debug_tuple("Expression").field(expression).finish()
            }
            NodeCondition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

// Two-character operators first so `>=` is not read as `>`.
const OPERATORS: [(&str, Operator); 6] = [
    ("==", Operator::Eq),
    ("!=", Operator::Ne),
    (">=", Operator::Ge),
    ("<=", Operator::Le),
    (">", Operator::Gt),
    ("<", Operator::Lt),
];

/// Simple condition evaluator.
/// Supports basic comparisons: ==, !=, >, <, >=, <= and bare key existence.
pub fn evaluate_condition(
    condition: &str,
    context: &HashMap<String, String>,
) -> anyhow::Result<bool> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Err(anyhow::anyhow!("Empty condition"));
    }

    let Some((left, right, operator)) = OPERATORS.iter().find_map(|(symbol, operator)| {
        condition
            .split_once(symbol)
            .map(|(left, right)| (left.trim(), right.trim(), *operator))
    }) else {
        // Support simple variable existence check
        return Ok(context.contains_key(condition));
    };

    if left.is_empty() || right.is_empty() {
        return Err(anyhow::anyhow!("Invalid condition format: {}", condition));
    }

    let left_val = operand(left, context);
    let right_val = operand(right, context);

    let result = match operator {
        Operator::Eq => left_val == right_val,
        Operator::Ne => left_val != right_val,
        ordering => {
            let cmp = match (left_val.parse::<f64>(), right_val.parse::<f64>()) {
                (Ok(l), Ok(r)) => l.partial_cmp(&r),
                _ => Some(left_val.cmp(right_val)),
            };
            let Some(cmp) = cmp else {
                return Ok(false);
            };
            match ordering {
                Operator::Ge => cmp.is_ge(),
                Operator::Le => cmp.is_le(),
                Operator::Gt => cmp.is_gt(),
                _ => cmp.is_lt(),
            }
        }
    };

    Ok(result)
}

/// Resolve a context key, else treat the token as a literal (quotes stripped)
fn operand<'a>(token: &'a str, context: &'a HashMap<String, String>) -> &'a str {
    if let Some(value) = context.get(token) {
        return value;
    }
    for quote in ['\'', '"'] {
        if let Some(inner) = token
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeStatus;
    use serde_json::json;

    fn upstream() -> UpstreamOutputs {
        let mut upstream = UpstreamOutputs::new();
        upstream.insert(
            NodeId::new("n1"),
            "Classifier",
            NodeOutput::success(json!("spam"), Some(json!({"score": 0.92}))),
        );
        upstream
    }

    /// A scraper that succeeded with structured data next to a mailer that failed
    fn scrape_and_mail() -> HashMap<String, String> {
        let mut upstream = UpstreamOutputs::new();
        upstream.insert(
            NodeId::new("scrape"),
            "Scraper",
            NodeOutput::success(json!(12), Some(json!({"title": "Pricing", "httpStatus": 200}))),
        );
        upstream.insert(
            NodeId::new("mail"),
            "Mailer",
            NodeOutput {
                output: Value::Null,
                data: None,
                error: Some("smtp down".to_string()),
                status: NodeStatus::Failed,
            },
        );
        upstream.context()
    }

    #[test]
    fn test_equality_against_output_fields() {
        let context = scrape_and_mail();

        assert!(evaluate_condition("Scraper.data.title == Pricing", &context).unwrap());
        assert!(!evaluate_condition("Scraper.data.title == Pricing page", &context).unwrap());
        assert!(evaluate_condition("scrape.status != failed", &context).unwrap());
        assert!(evaluate_condition("Mailer.error == 'smtp down'", &context).unwrap());
        assert!(evaluate_condition("mail.status == \"failed\"", &context).unwrap());
    }

    #[test]
    fn test_ordering_against_output_fields() {
        let context = scrape_and_mail();

        assert!(evaluate_condition("Scraper.output >= 12", &context).unwrap());
        assert!(evaluate_condition("Scraper.data.httpStatus < 300", &context).unwrap());
        assert!(!evaluate_condition("Scraper.output > 100", &context).unwrap());
        // Non-numeric sides compare as text.
        assert!(evaluate_condition("scrape.status > pending", &context).unwrap());
    }

    #[test]
    fn test_bare_key_checks_presence() {
        let context = scrape_and_mail();

        assert!(evaluate_condition("Mailer.error", &context).unwrap());
        assert!(!evaluate_condition("Scraper.error", &context).unwrap());
        assert!(evaluate_condition("Scraper.data.title ==", &context).is_err());
    }

    #[test]
    fn test_expression_over_upstream_outputs() {
        let upstream = upstream();

        assert!(NodeCondition::expression("Classifier.output == spam").evaluate(&upstream));
        assert!(NodeCondition::expression("n1.status == success").evaluate(&upstream));
        assert!(NodeCondition::expression("Classifier.data.score > 0.5").evaluate(&upstream));
        assert!(!NodeCondition::expression("n1 == ham").evaluate(&upstream));
        assert!(!NodeCondition::expression("!= broken").evaluate(&upstream));
    }

    #[test]
    fn test_predicate_condition() {
        let condition = NodeCondition::predicate(|upstream| {
            upstream
                .get("Classifier")
                .map(|o| o.output == json!("spam"))
                .unwrap_or(false)
        });
        assert!(condition.evaluate(&upstream()));
        assert!(!condition.evaluate(&UpstreamOutputs::new()));
    }

    #[test]
    fn test_expression_wire_format() {
        let condition: NodeCondition =
            serde_json::from_value(json!({"expression": "a.output == yes"})).unwrap();
        assert!(matches!(condition, NodeCondition::Expression(ref e) if e == "a.output == yes"));
    }
}
