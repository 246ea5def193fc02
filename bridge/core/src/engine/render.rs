//! Script rendering for `node_to_script`

use std::collections::{BTreeMap, BTreeSet};

use crate::engine::classes::NodeClass;
use crate::engine::session::GraphNode;
use crate::error::RuntimeError;

/// Function name used when the caller passes none
pub const DEFAULT_FUNCTION_NAME: &str = "node_function";

/// Options accepted by `node_to_script`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptOptions {
    /// Also write inputs that still hold their default
    pub include_defaults: bool,
    /// Wrap the statements in a function returning the node
    pub as_function: bool,
    /// Name of that function
    pub function_name: String,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            include_defaults: false,
            as_function: false,
            function_name: DEFAULT_FUNCTION_NAME.to_string(),
        }
    }
}

fn variable(id: u64) -> String {
    format!("node_{id}")
}

/// Render `id` and every node it depends on, dependencies first
pub fn node_to_script(
    nodes: &BTreeMap<u64, GraphNode>,
    classes: &BTreeMap<String, NodeClass>,
    id: u64,
    options: &ScriptOptions,
) -> Result<String, RuntimeError> {
    let mut order = Vec::new();
    visit(nodes, classes, id, &mut BTreeSet::new(), &mut order)?;

    let mut lines = Vec::with_capacity(order.len());
    for node_id in &order {
        lines.push(statement(nodes, classes, *node_id, options)?);
    }

    if !options.as_function {
        return Ok(lines.join("\n"));
    }

    let mut out = format!("def {}():\n", options.function_name);
    for line in &lines {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("    return ");
    out.push_str(&variable(id));
    Ok(out)
}

fn lookup<'a>(
    nodes: &'a BTreeMap<u64, GraphNode>,
    classes: &'a BTreeMap<String, NodeClass>,
    id: u64,
) -> Result<(&'a GraphNode, &'a NodeClass), RuntimeError> {
    let node = nodes
        .get(&id)
        .ok_or_else(|| RuntimeError::Raised(format!("node {id} does not exist")))?;
    let class = classes
        .get(&node.class_id)
        .ok_or_else(|| RuntimeError::Raised(format!("unknown node class '{}'", node.class_id)))?;
    Ok((node, class))
}

fn visit(
    nodes: &BTreeMap<u64, GraphNode>,
    classes: &BTreeMap<String, NodeClass>,
    id: u64,
    in_progress: &mut BTreeSet<u64>,
    order: &mut Vec<u64>,
) -> Result<(), RuntimeError> {
    if order.contains(&id) {
        return Ok(());
    }
    if !in_progress.insert(id) {
        return Err(RuntimeError::Raised(format!("node {id} depends on itself")));
    }

    let (node, class) = lookup(nodes, classes, id)?;
    for spec in &class.inputs {
        if let Some(target) = node.reference(&spec.key) {
            visit(nodes, classes, target, in_progress, order)?;
        }
    }

    in_progress.remove(&id);
    order.push(id);
    Ok(())
}

fn statement(
    nodes: &BTreeMap<u64, GraphNode>,
    classes: &BTreeMap<String, NodeClass>,
    id: u64,
    options: &ScriptOptions,
) -> Result<String, RuntimeError> {
    let (node, class) = lookup(nodes, classes, id)?;

    let mut args = Vec::new();
    for spec in &class.inputs {
        let rendered = match (node.reference(&spec.key), node.inputs.get(&spec.key)) {
            (Some(target), _) => variable(target),
            (None, Some(value)) => value.to_string(),
            (None, None) if options.include_defaults => spec.default.to_string(),
            (None, None) => continue,
        };
        args.push(format!("{}={}", spec.key, rendered));
    }

    Ok(format!("{} = {}({})", variable(id), class.id, args.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InputMode;
    use crate::engine::classes::classes_for_selector;
    use crate::marshal::NativeValue;

    fn graph() -> BTreeMap<u64, GraphNode> {
        let constant = GraphNode {
            id: 0,
            class_id: "Constant".into(),
            inputs: BTreeMap::from([("value".to_string(), NativeValue::Float(1.5))]),
            modes: BTreeMap::from([("value".to_string(), InputMode::Value)]),
        };
        let add = GraphNode {
            id: 1,
            class_id: "Add".into(),
            inputs: BTreeMap::from([("b".to_string(), NativeValue::Int(0))]),
            modes: BTreeMap::from([("b".to_string(), InputMode::Node)]),
        };
        BTreeMap::from([(0, constant), (1, add)])
    }

    #[test]
    fn test_dependencies_first() {
        let classes = classes_for_selector("default").unwrap();
        let script = node_to_script(&graph(), &classes, 1, &ScriptOptions::default()).unwrap();
        assert_eq!(script, "node_0 = Constant(value=1.5)\nnode_1 = Add(b=node_0)");
    }

    #[test]
    fn test_include_defaults_as_function() {
        let classes = classes_for_selector("default").unwrap();
        let options = ScriptOptions {
            include_defaults: true,
            as_function: true,
            function_name: "build".into(),
        };
        let script = node_to_script(&graph(), &classes, 1, &options).unwrap();
        assert_eq!(
            script,
            "def build():\n    node_0 = Constant(value=1.5)\n    node_1 = Add(a=0, b=node_0)\n    return node_1"
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let classes = classes_for_selector("default").unwrap();
        let mut nodes = graph();
        if let Some(node) = nodes.get_mut(&0) {
            node.class_id = "Add".into();
            node.inputs = BTreeMap::from([("a".to_string(), NativeValue::Int(1))]);
            node.modes = BTreeMap::from([("a".to_string(), InputMode::Node)]);
        }
        let err = node_to_script(&nodes, &classes, 1, &ScriptOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::Raised(_)));
    }
}
