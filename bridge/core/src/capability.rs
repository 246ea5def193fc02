//! Capability Vocabulary
//!
//! The fixed set of Session methods the editor may invoke, plus the typed
//! values that flow through them. Method names arriving over a transport are
//! resolved through [`SessionMethod::lookup`]; anything outside the table is
//! rejected before it reaches the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CallError;

/// Session methods reachable through a capability call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionMethod {
    /// Create a node of a class
    InitNode,
    /// Set some inputs of a node
    UpdateNodeInputs,
    /// Restore inputs to their defaults
    ResetNodeInputs,
    /// Delete a node
    RemoveNode,
    /// Replace an input value by a node producing it
    NodeInputToNode,
    /// Render a node (and its dependencies) as a script
    NodeToScript,
    /// Fetch the node table
    GetNodes,
    /// Fetch the node class registry
    GetNodeClasses,
    /// Fetch the flow table
    GetFlows,
}

const METHOD_TABLE: &[(&str, SessionMethod)] = &[
    ("init_node", SessionMethod::InitNode),
    ("update_node_inputs", SessionMethod::UpdateNodeInputs),
    ("reset_node_inputs", SessionMethod::ResetNodeInputs),
    ("remove_node", SessionMethod::RemoveNode),
    ("node_input_to_node", SessionMethod::NodeInputToNode),
    ("node_to_script", SessionMethod::NodeToScript),
    ("get_nodes", SessionMethod::GetNodes),
    ("get_node_classes", SessionMethod::GetNodeClasses),
    ("get_flows", SessionMethod::GetFlows),
];

impl SessionMethod {
    /// Every method in table order
    pub fn all() -> impl Iterator<Item = Self> {
        METHOD_TABLE.iter().map(|(_, method)| *method)
    }

    /// Name used on the wire and on the Session
    pub fn name(self) -> &'static str {
        METHOD_TABLE
            .iter()
            .find(|(_, method)| *method == self)
            .map_or("", |(name, _)| name)
    }

    /// Resolve a wire name
    pub fn lookup(name: &str) -> Result<Self, CallError> {
        METHOD_TABLE
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, method)| *method)
            .ok_or_else(|| CallError::UnknownMethod(name.to_string()))
    }
}

impl fmt::Display for SessionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SessionMethod {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s)
    }
}

/// One invoke-session-method request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCall {
    /// Method name as sent on the wire
    #[serde(rename = "methodName")]
    pub method_name: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl SessionCall {
    /// Call a method from the capability table
    pub fn new(method: SessionMethod) -> Self {
        Self {
            method_name: method.name().to_string(),
            ..Default::default()
        }
    }

    /// Call an arbitrary name; resolution happens on the receiving side
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            method_name: name.into(),
            ..Default::default()
        }
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Node identifier assigned by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::from(id.0)
    }
}

/// How a node input is interpreted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InputMode {
    /// Literal value
    #[default]
    Value,
    /// Reference to another node's output
    Node,
}

impl InputMode {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Value => "VALUE",
            Self::Node => "NODE",
        }
    }
}

/// Node as seen by the editor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Engine-assigned id
    pub id: NodeId,
    /// Class the node was created from
    pub class_id: String,
    /// Explicitly set inputs
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Mode of each explicitly set input
    #[serde(default)]
    pub input_modes: BTreeMap<String, InputMode>,
}

/// Which transport a client uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// No backend selected
    #[default]
    None,
    /// Remote engine over a socket
    Socket,
    /// Interpreter hosted in a background worker
    Embedded,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Socket => write!(f, "socket"),
            Self::Embedded => write!(f, "embedded"),
        }
    }
}

/// Capability flags advertised by a client
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Arbitrary code execution is permitted
    pub allows_run_code: bool,
    /// Files can be written into the engine's filesystem
    pub supports_file_staging: bool,
    /// Packages can be added after bootstrap
    pub supports_packages: bool,
}

impl Capabilities {
    /// No capabilities at all
    pub fn none() -> Self {
        Self::default()
    }

    /// Everything an embedded interpreter offers
    pub fn embedded() -> Self {
        Self {
            allows_run_code: true,
            supports_file_staging: true,
            supports_packages: true,
        }
    }
}

/// Post-bootstrap package installation request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInstall {
    /// Packages to install
    pub packages: Vec<String>,
    /// Skip packages that cannot be installed instead of failing
    #[serde(default)]
    pub keep_going: bool,
    /// Also install dependencies
    #[serde(default = "default_true")]
    pub deps: bool,
}

fn default_true() -> bool {
    true
}

impl PackageInstall {
    /// Install packages with dependencies, failing on the first unknown package
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
            keep_going: false,
            deps: true,
        }
    }

    /// Skip packages that cannot be installed
    #[must_use]
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_table_roundtrip() {
        for method in SessionMethod::all() {
            assert_eq!(SessionMethod::lookup(method.name()).unwrap(), method);
        }
        assert_eq!(SessionMethod::all().count(), 9);
    }

    #[test]
    fn test_unknown_method_rejected() {
        let err = "__class__".parse::<SessionMethod>().unwrap_err();
        assert_eq!(err, CallError::UnknownMethod("__class__".into()));
    }

    #[test]
    fn test_session_call_wire_shape() {
        let call = SessionCall::new(SessionMethod::RemoveNode).arg(NodeId(4));
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json, json!({"methodName": "remove_node", "args": [4], "kwargs": {}}));
    }

    #[test]
    fn test_node_from_structured_value() {
        let node: Node = serde_json::from_value(json!({
            "id": 2,
            "class_id": "Add",
            "inputs": {"a": 1},
            "input_modes": {"a": "VALUE"}
        }))
        .unwrap();
        assert_eq!(node.id, NodeId(2));
        assert_eq!(node.input_modes["a"], InputMode::Value);
    }
}
