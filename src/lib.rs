//! flowcore - Workflow Orchestration Core
//!
//! Instantiates versioned workflow templates against business entities and
//! drives the resulting tasks through their lifecycle: assignment,
//! notification, handler execution, gateway routing, concurrent fan-out and
//! completion detection.
//!
//! # Architecture
//!
//! The library is organized into five main modules:
//!
//! - [`template`]: Template model, loading, validation and routing
//! - [`store`]: Relational rows and the transactional store interface
//! - [`execution`]: Explosion engine and task state machine
//! - [`notify`]: Notification dispatch for human tasks
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use flowcore::execution::{Engine, ExplodeRequest};
//! use flowcore::store::{SqliteStore, TaskStatus};
//! use flowcore::template::{MemoryTemplateStore, Node, WorkflowTemplate};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let template = WorkflowTemplate::new("approval")
//!         .with_node(Node::start("start"))
//!         .with_node(Node::task("review").with_page("review_form"))
//!         .with_node(Node::end("end"))
//!         .with_link("start", "review")
//!         .with_link("review", "end");
//!
//!     let templates = Arc::new(MemoryTemplateStore::from_templates(vec![template]));
//!     let store = Arc::new(SqliteStore::in_memory()?);
//!     let engine = Engine::new(templates, store);
//!
//!     // Explode: creates the entity and its first task
//!     let entity_id = engine.explode(&ExplodeRequest::new("approval", "order", "PO-1"))?;
//!     let tasks = engine.tasks(entity_id)?;
//!     assert_eq!(tasks[0].status, TaskStatus::Started);
//!
//!     // A user finishes the review
//!     engine.complete_task(tasks[0].id)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod notify;
pub mod store;
pub mod template;

// Re-export commonly used types
pub use config::{load_config, EngineConfig};
pub use error::{Result, WorkflowError};
pub use execution::{CompletionOutcome, Engine, ExplodeRequest};
pub use store::{SqliteStore, TaskStatus, WorkflowEntity, WorkflowTask};
pub use template::{load_template, Node, NodeType, WorkflowTemplate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "flowcore";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "flowcore");
    }

    #[test]
    fn test_module_exports_node() {
        let node = Node::task("review").with_page("review_form");
        assert_eq!(node.id, "review");
        assert_eq!(node.node_type, NodeType::Task);
        assert!(node.waits_for_human());
    }

    #[test]
    fn test_module_exports_template() {
        let template = WorkflowTemplate::new("approval");
        assert!(template.is_empty());
        assert!(template.is_default);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
