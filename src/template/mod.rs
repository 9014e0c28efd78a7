//! Workflow Template Module
//!
//! Provides the immutable definitions the engine instantiates, plus the
//! utilities to load, validate, look up and route through them.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowTemplate, Node, Link, RoutingEntry)
//! - [`parser`]: YAML/JSON loading and saving
//! - [`validator`]: Structural validation rules
//! - [`routing`]: Gateway routing evaluation
//! - [`store`]: Template lookup by name or UUID

pub mod model;
pub mod parser;
pub mod routing;
pub mod store;
pub mod validator;

pub use model::{Link, Node, NodeType, ProcessData, RoutingEntry, WorkflowTemplate};
pub use parser::{load_template, parse_template};
pub use store::{DirTemplateStore, MemoryTemplateStore, TemplateStore};
pub use validator::{validate_template, ValidationError};
