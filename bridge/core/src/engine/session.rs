//! Graph Session
//!
//! Holds the node graph and answers the capability table's methods. Every
//! mutation moves the matching last-update timestamp forward.

use std::collections::{BTreeMap, BTreeSet};

use crate::capability::{InputMode, SessionMethod};
use crate::engine::classes::{classes_for_selector, NodeClass};
use crate::engine::render;
use crate::error::RuntimeError;
use crate::marshal::{NativeObject, NativeValue};
use crate::messages::LastUpdateSnapshot;

/// A node in the graph
#[derive(Clone, Debug, PartialEq)]
pub struct GraphNode {
    /// Node id
    pub id: u64,
    /// Class id
    pub class_id: String,
    /// Explicitly set inputs
    pub inputs: BTreeMap<String, NativeValue>,
    /// Modes of explicitly set inputs
    pub modes: BTreeMap<String, InputMode>,
}

impl GraphNode {
    /// Id of the node an input refers to, if it is a node reference
    pub fn reference(&self, key: &str) -> Option<u64> {
        if self.modes.get(key) != Some(&InputMode::Node) {
            return None;
        }
        self.inputs
            .get(key)
            .and_then(NativeValue::as_int)
            .and_then(|id| u64::try_from(id).ok())
    }
}

/// Engine-owned session
#[derive(Debug)]
pub struct GraphSession {
    classes: BTreeMap<String, NodeClass>,
    nodes: BTreeMap<u64, GraphNode>,
    next_id: u64,
    last_update: LastUpdateSnapshot,
    hidden_attributes: BTreeSet<String>,
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A timestamp strictly after `previous`
fn next_timestamp(previous: f64) -> f64 {
    let now = now_seconds();
    if now > previous {
        now
    } else {
        previous + 1e-6
    }
}

/// Bound arguments of one call, one slot per parameter
struct Bound {
    method: SessionMethod,
    slots: Vec<Option<NativeValue>>,
}

impl Bound {
    fn bind(
        method: SessionMethod,
        params: &[&str],
        args: Vec<NativeValue>,
        kwargs: Vec<(String, NativeValue)>,
    ) -> Result<Self, RuntimeError> {
        let bad = |reason: String| RuntimeError::BadArguments {
            method: method.name().to_string(),
            reason,
        };

        if args.len() > params.len() {
            return Err(bad(format!(
                "takes {} positional arguments but {} were given",
                params.len(),
                args.len()
            )));
        }

        let mut slots: Vec<Option<NativeValue>> = vec![None; params.len()];
        for (slot, value) in slots.iter_mut().zip(args) {
            *slot = Some(value);
        }

        for (key, value) in kwargs {
            let index = params
                .iter()
                .position(|p| *p == key)
                .ok_or_else(|| bad(format!("unexpected keyword argument '{key}'")))?;
            if slots[index].is_some() {
                return Err(bad(format!("multiple values for argument '{key}'")));
            }
            slots[index] = Some(value);
        }

        Ok(Self { method, slots })
    }

    fn error(&self, reason: String) -> RuntimeError {
        RuntimeError::BadArguments {
            method: self.method.name().to_string(),
            reason,
        }
    }

    fn take(&mut self, index: usize) -> Option<NativeValue> {
        self.slots[index].take().filter(|v| *v != NativeValue::None)
    }

    fn required(&mut self, index: usize, name: &str) -> Result<NativeValue, RuntimeError> {
        self.take(index)
            .ok_or_else(|| self.error(format!("missing required argument '{name}'")))
    }

    fn node_id(&mut self, index: usize) -> Result<u64, RuntimeError> {
        let value = self.required(index, "node_id")?;
        value
            .as_int()
            .and_then(|id| u64::try_from(id).ok())
            .ok_or_else(|| self.error(format!("node_id must be an integer, got {value}")))
    }

    fn string(&mut self, index: usize, name: &str) -> Result<String, RuntimeError> {
        match self.required(index, name)? {
            NativeValue::Str(s) => Ok(s),
            other => Err(self.error(format!("{name} must be a string, got {other}"))),
        }
    }

    fn flag(&mut self, index: usize) -> bool {
        self.take(index).is_some_and(|v| v.truthy())
    }

    fn dict(&mut self, index: usize, name: &str) -> Result<Vec<(String, NativeValue)>, RuntimeError> {
        match self.take(index) {
            None => Ok(Vec::new()),
            Some(NativeValue::Dict(entries)) => entries
                .into_iter()
                .map(|(k, v)| match k {
                    NativeValue::Str(key) => Ok((key, v)),
                    other => Err(self.error(format!("{name} keys must be strings, got {other}"))),
                })
                .collect(),
            Some(other) => Err(self.error(format!("{name} must be a dict, got {other}"))),
        }
    }

    fn modes(&mut self, index: usize) -> Result<BTreeMap<String, InputMode>, RuntimeError> {
        self.dict(index, "input_modes")?
            .into_iter()
            .map(|(key, value)| {
                let mode = match value.as_str() {
                    Some("NODE") => InputMode::Node,
                    Some("VALUE") => InputMode::Value,
                    _ => return Err(self.error(format!("invalid mode {value} for '{key}'"))),
                };
                Ok((key, mode))
            })
            .collect()
    }

    fn keys(&mut self, index: usize) -> Result<Vec<String>, RuntimeError> {
        match self.take(index) {
            None => Ok(Vec::new()),
            Some(NativeValue::List(items)) => items
                .into_iter()
                .map(|item| match item {
                    NativeValue::Str(key) => Ok(key),
                    other => Err(self.error(format!("keys must be strings, got {other}"))),
                })
                .collect(),
            Some(other) => Err(self.error(format!("keys must be a list, got {other}"))),
        }
    }
}

impl GraphSession {
    /// Create a session for a selector
    pub fn new(selector: &str) -> Result<Self, RuntimeError> {
        let classes = classes_for_selector(selector)?;
        let now = now_seconds();
        Ok(Self {
            classes,
            nodes: BTreeMap::new(),
            next_id: 0,
            last_update: LastUpdateSnapshot {
                nodes: now,
                flows: now,
                node_classes: now,
            },
            hidden_attributes: BTreeSet::new(),
        })
    }

    /// Current last-update fingerprint
    pub fn last_update(&self) -> LastUpdateSnapshot {
        self.last_update
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Stop exposing an attribute on produced objects
    pub fn hide_attribute(&mut self, attribute: &str) {
        self.hidden_attributes.insert(attribute.to_string());
    }

    /// Dispatch a capability method
    pub fn call(
        &mut self,
        method: SessionMethod,
        args: Vec<NativeValue>,
        kwargs: Vec<(String, NativeValue)>,
    ) -> Result<NativeValue, RuntimeError> {
        match method {
            SessionMethod::InitNode => {
                let mut b = Bound::bind(method, &["class_id", "inputs", "input_modes"], args, kwargs)?;
                let class_id = b.string(0, "class_id")?;
                let inputs = b.dict(1, "inputs")?;
                let modes = b.modes(2)?;
                let id = self.init_node(&class_id, inputs, modes)?;
                Ok(self.node_object(id))
            }
            SessionMethod::UpdateNodeInputs => {
                let mut b = Bound::bind(method, &["node_id", "inputs", "input_modes"], args, kwargs)?;
                let id = b.node_id(0)?;
                let inputs = b.dict(1, "inputs")?;
                let modes = b.modes(2)?;
                self.update_node_inputs(id, inputs, modes)?;
                Ok(NativeValue::None)
            }
            SessionMethod::ResetNodeInputs => {
                let mut b = Bound::bind(method, &["node_id", "keys"], args, kwargs)?;
                let id = b.node_id(0)?;
                let keys = b.keys(1)?;
                self.reset_node_inputs(id, &keys)?;
                Ok(NativeValue::None)
            }
            SessionMethod::RemoveNode => {
                let mut b = Bound::bind(method, &["node_id"], args, kwargs)?;
                let id = b.node_id(0)?;
                self.remove_node(id)?;
                Ok(NativeValue::None)
            }
            SessionMethod::NodeInputToNode => {
                let mut b = Bound::bind(method, &["node_id", "input_key", "value"], args, kwargs)?;
                let id = b.node_id(0)?;
                let key = b.string(1, "input_key")?;
                let value = b.take(2);
                let new_id = self.node_input_to_node(id, &key, value)?;
                Ok(self.node_object(new_id))
            }
            SessionMethod::NodeToScript => {
                let mut b = Bound::bind(
                    method,
                    &["node_id", "include_defaults", "as_function", "function_name"],
                    args,
                    kwargs,
                )?;
                let id = b.node_id(0)?;
                let options = render::ScriptOptions {
                    include_defaults: b.flag(1),
                    as_function: b.flag(2),
                    function_name: match b.take(3) {
                        Some(NativeValue::Str(name)) if !name.is_empty() => name,
                        _ => render::DEFAULT_FUNCTION_NAME.to_string(),
                    },
                };
                render::node_to_script(&self.nodes, &self.classes, id, &options).map(NativeValue::Str)
            }
            SessionMethod::GetNodes => {
                Bound::bind(method, &[], args, kwargs)?;
                Ok(NativeValue::str_dict(
                    self.nodes
                        .keys()
                        .map(|id| (id.to_string(), self.node_object(*id))),
                ))
            }
            SessionMethod::GetNodeClasses => {
                Bound::bind(method, &[], args, kwargs)?;
                Ok(NativeValue::str_dict(
                    self.classes
                        .values()
                        .map(|class| (class.id.clone(), class.to_native())),
                ))
            }
            SessionMethod::GetFlows => {
                Bound::bind(method, &[], args, kwargs)?;
                Ok(NativeValue::Dict(Vec::new()))
            }
        }
    }

    fn class(&self, class_id: &str) -> Result<&NodeClass, RuntimeError> {
        self.classes
            .get(class_id)
            .ok_or_else(|| RuntimeError::Raised(format!("unknown node class '{class_id}'")))
    }

    fn node(&self, id: u64) -> Result<&GraphNode, RuntimeError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| RuntimeError::Raised(format!("node {id} does not exist")))
    }

    fn touch_nodes(&mut self) {
        self.last_update.nodes = next_timestamp(self.last_update.nodes);
    }

    fn apply_inputs(
        &self,
        node: &mut GraphNode,
        inputs: Vec<(String, NativeValue)>,
        modes: BTreeMap<String, InputMode>,
    ) -> Result<(), RuntimeError> {
        let class = self.class(&node.class_id)?;
        for key in inputs.iter().map(|(k, _)| k).chain(modes.keys()) {
            class.require_input(key)?;
        }
        for (key, value) in inputs {
            node.modes.entry(key.clone()).or_default();
            node.inputs.insert(key, value);
        }
        for (key, mode) in modes {
            node.modes.insert(key, mode);
        }
        for key in node.modes.keys().cloned().collect::<Vec<_>>() {
            if let Some(target) = node.reference(&key) {
                self.node(target)?;
            }
        }
        Ok(())
    }

    fn init_node(
        &mut self,
        class_id: &str,
        inputs: Vec<(String, NativeValue)>,
        modes: BTreeMap<String, InputMode>,
    ) -> Result<u64, RuntimeError> {
        self.class(class_id)?;
        let mut node = GraphNode {
            id: self.next_id,
            class_id: class_id.to_string(),
            inputs: BTreeMap::new(),
            modes: BTreeMap::new(),
        };
        self.apply_inputs(&mut node, inputs, modes)?;

        let id = node.id;
        self.next_id += 1;
        self.nodes.insert(id, node);
        self.touch_nodes();
        tracing::trace!(node_id = id, class_id, "Node created");
        Ok(id)
    }

    fn update_node_inputs(
        &mut self,
        id: u64,
        inputs: Vec<(String, NativeValue)>,
        modes: BTreeMap<String, InputMode>,
    ) -> Result<(), RuntimeError> {
        let mut node = self.node(id)?.clone();
        self.apply_inputs(&mut node, inputs, modes)?;
        self.nodes.insert(id, node);
        self.touch_nodes();
        Ok(())
    }

    fn reset_node_inputs(&mut self, id: u64, keys: &[String]) -> Result<(), RuntimeError> {
        let class = self.class(&self.node(id)?.class_id)?.clone();
        for key in keys {
            class.require_input(key)?;
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            for key in keys {
                node.inputs.remove(key);
                node.modes.remove(key);
            }
        }
        self.touch_nodes();
        Ok(())
    }

    fn remove_node(&mut self, id: u64) -> Result<(), RuntimeError> {
        self.node(id)?;
        self.nodes.remove(&id);
        self.touch_nodes();
        Ok(())
    }

    fn node_input_to_node(
        &mut self,
        id: u64,
        key: &str,
        value: Option<NativeValue>,
    ) -> Result<u64, RuntimeError> {
        let node = self.node(id)?;
        let class = self.class(&node.class_id)?;
        let spec = class.require_input(key)?;

        let value = value
            .or_else(|| node.inputs.get(key).cloned().filter(|_| node.reference(key).is_none()))
            .unwrap_or_else(|| spec.default.clone());

        let new_id = self.init_node(
            "Constant",
            vec![("value".to_string(), value)],
            BTreeMap::new(),
        )?;
        self.update_node_inputs(
            id,
            vec![(key.to_string(), NativeValue::Int(new_id as i64))],
            BTreeMap::from([(key.to_string(), InputMode::Node)]),
        )?;
        Ok(new_id)
    }

    /// Native object handed back to callers for a node
    fn node_object(&self, id: u64) -> NativeValue {
        let Some(node) = self.nodes.get(&id) else {
            return NativeValue::None;
        };

        let attributes = [
            ("id", NativeValue::Int(node.id as i64)),
            ("class_id", NativeValue::Str(node.class_id.clone())),
            (
                "inputs",
                NativeValue::str_dict(node.inputs.iter().map(|(k, v)| (k.clone(), v.clone()))),
            ),
            (
                "input_modes",
                NativeValue::str_dict(
                    node.modes
                        .iter()
                        .map(|(k, m)| (k.clone(), NativeValue::Str(m.as_str().to_string()))),
                ),
            ),
            ("get_output", NativeValue::Callable("Node.get_output".into())),
            ("then", NativeValue::Callable("Node.then".into())),
        ];

        let mut object = NativeObject::new("Node");
        for (name, value) in attributes {
            if !self.hidden_attributes.contains(name) {
                object = object.with(name, value);
            }
        }
        NativeValue::Object(object)
    }
}
