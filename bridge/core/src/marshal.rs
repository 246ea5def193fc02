//! Boundary Marshalling
//!
//! Converts values between the host representation ([`serde_json::Value`],
//! the "boundary" form that travels in messages and frames) and the
//! interpreter-native representation ([`NativeValue`]).
//!
//! Inbound conversion is total. Outbound conversion runs a three-stage chain:
//!
//! ```text
//! NativeValue ──direct──► Converted(value)
//!      │ fails
//!      └──structured──► PartiallyConverted(value)
//!             │ fails
//!             └──────► Unrepresentable
//! ```
//!
//! The outcome is tagged so a call that legitimately returned `None` is never
//! confused with a result that could not be converted.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::MarshalError;

/// Attributes the host treats as deferred-result hooks
///
/// An object exposing a callable attribute with one of these names would be
/// awaited by the host instead of converted, invoking engine code as a side
/// effect. The worker neutralizes them on the engine module during bootstrap.
pub const DEFERRED_HANDLE_ATTRIBUTES: &[&str] = &["then"];

/// Interpreter-native value
#[derive(Clone, Debug, PartialEq)]
pub enum NativeValue {
    /// Absence of a value
    None,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// Text
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered sequence
    List(Vec<NativeValue>),
    /// Mapping with arbitrary keys, insertion ordered
    Dict(Vec<(NativeValue, NativeValue)>),
    /// Engine object with named attributes
    Object(NativeObject),
    /// Bound method or function
    Callable(String),
    /// Foreign handle (module, file handle, ...)
    Opaque(String),
}

/// Engine object instance
#[derive(Clone, Debug, PartialEq)]
pub struct NativeObject {
    /// Class name
    pub class: String,
    /// Attributes in definition order
    pub attributes: Vec<(String, NativeValue)>,
}

impl NativeObject {
    /// Create an object with no attributes
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            attributes: Vec::new(),
        }
    }

    /// Add an attribute
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: NativeValue) -> Self {
        self.attributes.push((name.into(), value));
        self
    }

    /// Look up an attribute
    pub fn get(&self, name: &str) -> Option<&NativeValue> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

impl NativeValue {
    /// Build a dictionary with string keys
    pub fn str_dict<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, NativeValue)>,
    {
        Self::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Self::Str(k.into()), v))
                .collect(),
        )
    }

    /// Type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Object(_) => "object",
            Self::Callable(_) => "function",
            Self::Opaque(_) => "handle",
        }
    }

    /// Borrow as text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Read as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read as boolean, with the interpreter's truthiness rules
    pub fn truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Dict(entries) => !entries.is_empty(),
            Self::Object(_) | Self::Callable(_) | Self::Opaque(_) => true,
        }
    }

    /// Convert a boundary value into its native form
    pub fn from_boundary(value: &Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_boundary).collect()),
            Value::Object(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (Self::Str(k.clone()), Self::from_boundary(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into boundary form through the fallback chain
    pub fn to_boundary(&self) -> Marshalled {
        match direct(self) {
            Ok(value) => Marshalled::Converted(value),
            Err(direct_err) => match structured(self) {
                Ok(value) => {
                    tracing::trace!(error = %direct_err, "Direct conversion failed, used structured form");
                    Marshalled::PartiallyConverted(value)
                }
                Err(err) => {
                    tracing::debug!(error = %err, kind = self.type_name(), "Value not representable");
                    Marshalled::Unrepresentable
                }
            },
        }
    }
}

impl fmt::Display for NativeValue {
    /// Source-like representation, used for textual results and rendered scripts
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{x:.1}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Object(obj) => write!(f, "<{} object>", obj.class),
            Self::Callable(name) => write!(f, "<function {name}>"),
            Self::Opaque(name) => write!(f, "<{name}>"),
        }
    }
}

fn float_to_boundary(x: f64) -> Result<Value, MarshalError> {
    Number::from_f64(x)
        .map(Value::Number)
        .ok_or(MarshalError::NonFiniteFloat(x))
}

/// Stage one: values with an exact boundary counterpart
fn direct(value: &NativeValue) -> Result<Value, MarshalError> {
    match value {
        NativeValue::None => Ok(Value::Null),
        NativeValue::Bool(b) => Ok(Value::Bool(*b)),
        NativeValue::Int(i) => Ok(Value::from(*i)),
        NativeValue::Float(x) => float_to_boundary(*x),
        NativeValue::Str(s) => Ok(Value::String(s.clone())),
        NativeValue::List(items) => items.iter().map(direct).collect::<Result<_, _>>().map(Value::Array),
        NativeValue::Dict(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                let NativeValue::Str(key) = k else {
                    return Err(MarshalError::NonStringKey);
                };
                map.insert(key.clone(), direct(v)?);
            }
            Ok(Value::Object(map))
        }
        other => Err(MarshalError::NoDirectForm(other.type_name())),
    }
}

/// Stage two: composite conversion that reshapes what direct conversion rejects
fn structured(value: &NativeValue) -> Result<Value, MarshalError> {
    match value {
        NativeValue::Bytes(bytes) => Ok(Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())),
        NativeValue::List(items) => items
            .iter()
            .map(structured)
            .collect::<Result<_, _>>()
            .map(Value::Array),
        NativeValue::Dict(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(dict_key(k)?, structured(v)?);
            }
            Ok(Value::Object(map))
        }
        NativeValue::Object(obj) => {
            let mut map = Map::new();
            for (name, attr) in &obj.attributes {
                if let NativeValue::Callable(_) = attr {
                    if DEFERRED_HANDLE_ATTRIBUTES.contains(&name.as_str()) {
                        return Err(MarshalError::DeferredHandle {
                            class: obj.class.clone(),
                            attribute: name.clone(),
                        });
                    }
                    continue;
                }
                map.insert(name.clone(), structured(attr)?);
            }
            Ok(Value::Object(map))
        }
        NativeValue::Callable(name) | NativeValue::Opaque(name) => {
            Err(MarshalError::OpaqueHandle(name.clone()))
        }
        scalar => direct(scalar),
    }
}

fn dict_key(key: &NativeValue) -> Result<String, MarshalError> {
    match key {
        NativeValue::Str(s) => Ok(s.clone()),
        NativeValue::None | NativeValue::Bool(_) | NativeValue::Int(_) | NativeValue::Float(_) => {
            Ok(key.to_string())
        }
        _ => Err(MarshalError::NonStringKey),
    }
}

/// How a value made it across the boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// Exact conversion
    Converted,
    /// Reshaped by the structured stage
    PartiallyConverted,
    /// Nothing could be converted; the value is a null placeholder
    Unrepresentable,
}

/// Tagged outcome of outbound conversion
#[derive(Clone, Debug, PartialEq)]
pub enum Marshalled {
    /// Exact boundary counterpart
    Converted(Value),
    /// Structured approximation (e.g. objects flattened to their attributes)
    PartiallyConverted(Value),
    /// Both stages failed
    Unrepresentable,
}

impl Marshalled {
    /// Conversion tag
    pub fn conversion(&self) -> Conversion {
        match self {
            Self::Converted(_) => Conversion::Converted,
            Self::PartiallyConverted(_) => Conversion::PartiallyConverted,
            Self::Unrepresentable => Conversion::Unrepresentable,
        }
    }

    /// Borrow the converted value, if any
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Converted(v) | Self::PartiallyConverted(v) => Some(v),
            Self::Unrepresentable => None,
        }
    }

    /// Take the converted value, if any
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Converted(v) | Self::PartiallyConverted(v) => Some(v),
            Self::Unrepresentable => None,
        }
    }
}

/// Reply body of invoke-session-method: `{return, conversion}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReturnValue {
    /// Converted value, `null` when unrepresentable
    #[serde(rename = "return")]
    pub value: Value,
    /// Conversion tag
    pub conversion: Conversion,
}

impl From<Marshalled> for ReturnValue {
    fn from(marshalled: Marshalled) -> Self {
        let conversion = marshalled.conversion();
        Self {
            value: marshalled.into_value().unwrap_or(Value::Null),
            conversion,
        }
    }
}

impl From<ReturnValue> for Marshalled {
    fn from(reply: ReturnValue) -> Self {
        match reply.conversion {
            Conversion::Converted => Self::Converted(reply.value),
            Conversion::PartiallyConverted => Self::PartiallyConverted(reply.value),
            Conversion::Unrepresentable => Self::Unrepresentable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_inbound_conversion() {
        let native = NativeValue::from_boundary(&json!({"a": [1, 2.5, null, "x", true]}));
        assert_eq!(
            native,
            NativeValue::str_dict([(
                "a",
                NativeValue::List(vec![
                    NativeValue::Int(1),
                    NativeValue::Float(2.5),
                    NativeValue::None,
                    NativeValue::Str("x".into()),
                    NativeValue::Bool(true),
                ])
            )])
        );
    }

    #[test]
    fn test_none_is_converted_not_unrepresentable() {
        let out = NativeValue::None.to_boundary();
        assert_eq!(out, Marshalled::Converted(Value::Null));
        assert_eq!(out.conversion(), Conversion::Converted);
    }

    #[test]
    fn test_object_falls_back_to_structured() {
        let obj = NativeObject::new("Node")
            .with("id", NativeValue::Int(3))
            .with("describe", NativeValue::Callable("Node.describe".into()));
        let out = NativeValue::Object(obj).to_boundary();
        assert_eq!(out, Marshalled::PartiallyConverted(json!({"id": 3})));
    }

    #[test]
    fn test_non_string_keys_are_stringified() {
        let dict = NativeValue::Dict(vec![(NativeValue::Int(1), NativeValue::Str("one".into()))]);
        assert_eq!(dict.to_boundary(), Marshalled::PartiallyConverted(json!({"1": "one"})));
    }

    #[test]
    fn test_deferred_handle_is_unrepresentable() {
        let obj = NativeObject::new("Node")
            .with("id", NativeValue::Int(1))
            .with("then", NativeValue::Callable("Node.then".into()));
        assert_eq!(NativeValue::Object(obj).to_boundary(), Marshalled::Unrepresentable);
    }

    #[test]
    fn test_opaque_and_nan_are_unrepresentable() {
        assert_eq!(
            NativeValue::Opaque("module graph_engine".into()).to_boundary(),
            Marshalled::Unrepresentable
        );
        assert_eq!(NativeValue::Float(f64::NAN).to_boundary(), Marshalled::Unrepresentable);
    }

    #[test]
    fn test_return_value_wire_shape() {
        let reply = ReturnValue::from(Marshalled::Unrepresentable);
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json, json!({"return": null, "conversion": "unrepresentable"}));

        let back: ReturnValue =
            serde_json::from_value(json!({"return": 5, "conversion": "converted"})).unwrap();
        assert_eq!(Marshalled::from(back), Marshalled::Converted(json!(5)));
    }

    #[test]
    fn test_display_repr() {
        let value = NativeValue::List(vec![
            NativeValue::Str("a".into()),
            NativeValue::Float(2.0),
            NativeValue::None,
            NativeValue::Bool(true),
        ]);
        assert_eq!(value.to_string(), r#"["a", 2.0, None, True]"#);
    }
}
