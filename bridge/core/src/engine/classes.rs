//! Node Classes
//!
//! Registry of the node classes a session can instantiate.

use std::collections::BTreeMap;

use crate::error::RuntimeError;
use crate::marshal::NativeValue;

/// Declared input of a node class
#[derive(Clone, Debug, PartialEq)]
pub struct InputSpec {
    /// Input name
    pub key: String,
    /// Value used when the input is not set
    pub default: NativeValue,
}

/// A class of nodes
#[derive(Clone, Debug, PartialEq)]
pub struct NodeClass {
    /// Class identifier, also the callable name in rendered scripts
    pub id: String,
    /// One-line description
    pub description: String,
    /// Inputs in declaration order
    pub inputs: Vec<InputSpec>,
}

impl NodeClass {
    fn new(id: &str, description: &str, inputs: &[(&str, NativeValue)]) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            inputs: inputs
                .iter()
                .map(|(key, default)| InputSpec {
                    key: (*key).to_string(),
                    default: default.clone(),
                })
                .collect(),
        }
    }

    /// Look up an input declaration
    pub fn input(&self, key: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|spec| spec.key == key)
    }

    /// Fail unless `key` is a declared input
    pub fn require_input(&self, key: &str) -> Result<&InputSpec, RuntimeError> {
        self.input(key)
            .ok_or_else(|| RuntimeError::Raised(format!("{} has no input '{key}'", self.id)))
    }

    /// Native description used by `get_node_classes`
    pub fn to_native(&self) -> NativeValue {
        NativeValue::str_dict([
            ("description", NativeValue::Str(self.description.clone())),
            (
                "inputs",
                NativeValue::str_dict(
                    self.inputs
                        .iter()
                        .map(|spec| (spec.key.clone(), spec.default.clone())),
                ),
            ),
        ])
    }
}

/// Classes shipped with the engine
pub fn builtin_classes() -> Vec<NodeClass> {
    vec![
        NodeClass::new("Constant", "Outputs its value unchanged", &[("value", NativeValue::None)]),
        NodeClass::new(
            "Add",
            "Sum of two inputs",
            &[("a", NativeValue::Int(0)), ("b", NativeValue::Int(0))],
        ),
        NodeClass::new(
            "Multiply",
            "Product of two inputs",
            &[("a", NativeValue::Int(1)), ("b", NativeValue::Int(1))],
        ),
        NodeClass::new(
            "Text",
            "A piece of text",
            &[("text", NativeValue::Str(String::new()))],
        ),
    ]
}

/// Class registry for a session selector
pub fn classes_for_selector(selector: &str) -> Result<BTreeMap<String, NodeClass>, RuntimeError> {
    let classes = match selector {
        "default" => builtin_classes(),
        "empty" => Vec::new(),
        other => return Err(RuntimeError::UnknownSelector(other.to_string())),
    };
    Ok(classes.into_iter().map(|class| (class.id.clone(), class)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors() {
        assert_eq!(classes_for_selector("default").unwrap().len(), 4);
        assert!(classes_for_selector("empty").unwrap().is_empty());
        assert_eq!(
            classes_for_selector("gpu"),
            Err(RuntimeError::UnknownSelector("gpu".into()))
        );
    }

    #[test]
    fn test_require_input() {
        let classes = classes_for_selector("default").unwrap();
        let add = &classes["Add"];
        assert!(add.require_input("a").is_ok());
        assert!(matches!(add.require_input("c"), Err(RuntimeError::Raised(_))));
    }
}
