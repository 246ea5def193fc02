//! Capability Client Trait
//!
//! The uniform surface the editor talks to. Transports implement the small
//! required core (`invoke`, `run_code`, lifecycle); the typed capability calls
//! are provided on top of `invoke` so every transport exposes them the same way.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};

use crate::capability::{
    BackendKind, Capabilities, InputMode, Node, NodeId, PackageInstall, SessionCall, SessionMethod,
};
use crate::error::CallError;
use crate::marshal::Marshalled;
use crate::messages::{BootstrapFailure, ClientEvent};
use crate::status::ConnectionStatus;

/// Decode a marshalled result into a typed value
fn decode<T: DeserializeOwned>(result: Marshalled) -> Result<T, CallError> {
    let value = result.into_value().ok_or(CallError::Unrepresentable)?;
    serde_json::from_value(value).map_err(|e| CallError::InvalidResult(e.to_string()))
}

fn modes_to_value(modes: &BTreeMap<String, InputMode>) -> Value {
    Value::Object(
        modes
            .iter()
            .map(|(key, mode)| (key.clone(), Value::from(mode.as_str())))
            .collect(),
    )
}

/// Transport-independent client of a computation engine
///
/// One instance owns one status value. Calls never change that status; only
/// the transport's own lifecycle does.
#[async_trait]
pub trait CapabilityClient: Send + Sync {
    /// Which transport this is
    fn kind(&self) -> BackendKind;

    /// Current status
    fn status(&self) -> ConnectionStatus;

    /// Capability flags
    fn capabilities(&self) -> Capabilities;

    /// Subscribe to status, connect, disconnect and snapshot events
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;

    /// Watch the status value
    fn watch_status(&self) -> watch::Receiver<ConnectionStatus>;

    /// Terminal bootstrap failure, if the backend has one
    fn bootstrap_failure(&self) -> Option<BootstrapFailure> {
        None
    }

    /// Invoke a Session method by name
    async fn invoke(&self, call: SessionCall) -> Result<Marshalled, CallError>;

    /// Execute arbitrary code and return its textual result
    async fn run_code(&self, code: &str) -> Result<String, CallError>;

    /// Ask the engine to push a fresh snapshot
    async fn request_snapshot(&self) -> Result<(), CallError>;

    /// Write files into the engine's filesystem
    async fn stage_files(&self, files: BTreeMap<String, Vec<u8>>) -> Result<(), CallError> {
        let _ = files;
        Err(CallError::Unsupported("stage-files".into()))
    }

    /// Load packages from the runtime's own distribution
    async fn load_packages(&self, packages: Vec<String>) -> Result<(), CallError> {
        let _ = packages;
        Err(CallError::Unsupported("load-packages".into()))
    }

    /// Install extra packages from the package index
    async fn install_packages(&self, request: PackageInstall) -> Result<(), CallError> {
        let _ = request;
        Err(CallError::Unsupported("install-extra-packages".into()))
    }

    /// Release every resource held by this client
    async fn shutdown(&self);

    /// Create a node of `class_id`
    async fn create_node(
        &self,
        class_id: &str,
        inputs: Map<String, Value>,
        input_modes: BTreeMap<String, InputMode>,
    ) -> Result<Node, CallError> {
        let call = SessionCall::new(SessionMethod::InitNode)
            .arg(class_id)
            .arg(Value::Object(inputs))
            .arg(modes_to_value(&input_modes));
        decode(self.invoke(call).await?)
    }

    /// Set some inputs of a node
    async fn update_node_inputs(
        &self,
        node_id: NodeId,
        inputs: Map<String, Value>,
        input_modes: BTreeMap<String, InputMode>,
    ) -> Result<(), CallError> {
        let call = SessionCall::new(SessionMethod::UpdateNodeInputs)
            .arg(node_id)
            .arg(Value::Object(inputs))
            .arg(modes_to_value(&input_modes));
        self.invoke(call).await.map(|_| ())
    }

    /// Restore inputs to their defaults
    async fn reset_node_inputs(&self, node_id: NodeId, keys: Vec<String>) -> Result<(), CallError> {
        let call = SessionCall::new(SessionMethod::ResetNodeInputs)
            .arg(node_id)
            .arg(keys);
        self.invoke(call).await.map(|_| ())
    }

    /// Delete a node
    async fn remove_node(&self, node_id: NodeId) -> Result<(), CallError> {
        let call = SessionCall::new(SessionMethod::RemoveNode).arg(node_id);
        self.invoke(call).await.map(|_| ())
    }

    /// Replace an input by a node producing `value` (or the current value)
    async fn materialize_input_as_node(
        &self,
        node_id: NodeId,
        input_key: &str,
        value: Option<Value>,
    ) -> Result<Node, CallError> {
        let call = SessionCall::new(SessionMethod::NodeInputToNode)
            .arg(node_id)
            .arg(input_key)
            .arg(value.unwrap_or(Value::Null));
        decode(self.invoke(call).await?)
    }

    /// Render a node and its dependencies as a script
    async fn render_node_as_script(
        &self,
        node_id: NodeId,
        include_defaults: bool,
        as_function: bool,
        function_name: &str,
    ) -> Result<String, CallError> {
        let call = SessionCall::new(SessionMethod::NodeToScript)
            .arg(node_id)
            .kwarg("include_defaults", include_defaults)
            .kwarg("as_function", as_function)
            .kwarg("function_name", function_name);
        decode(self.invoke(call).await?)
    }

    /// Fetch the node table, keyed by node id
    async fn get_nodes(&self) -> Result<BTreeMap<String, Node>, CallError> {
        decode(self.invoke(SessionCall::new(SessionMethod::GetNodes)).await?)
    }

    /// Fetch the node class registry
    async fn get_node_classes(&self) -> Result<Value, CallError> {
        decode(self.invoke(SessionCall::new(SessionMethod::GetNodeClasses)).await?)
    }

    /// Fetch the flow table
    async fn get_flows(&self) -> Result<Value, CallError> {
        decode(self.invoke(SessionCall::new(SessionMethod::GetFlows)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_unrepresentable() {
        let err = decode::<Node>(Marshalled::Unrepresentable).unwrap_err();
        assert_eq!(err, CallError::Unrepresentable);
    }

    #[test]
    fn test_decode_wrong_shape() {
        let err = decode::<Node>(Marshalled::Converted(json!("nope"))).unwrap_err();
        assert!(matches!(err, CallError::InvalidResult(_)));
    }

    #[test]
    fn test_modes_to_value() {
        let modes = BTreeMap::from([("a".to_string(), InputMode::Node)]);
        assert_eq!(modes_to_value(&modes), json!({"a": "NODE"}));
    }
}
