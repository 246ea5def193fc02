//! Reference Graph Engine
//!
//! The engine-owned Session: a small node graph whose methods are the
//! capability table. It is hosted inside [`crate::runtime::MemoryRuntime`] and
//! by the engine daemon, and is never reached except through a method name.

pub mod classes;
pub mod render;
pub mod session;

pub use classes::{builtin_classes, classes_for_selector, InputSpec, NodeClass};
pub use render::ScriptOptions;
pub use session::{GraphNode, GraphSession};
