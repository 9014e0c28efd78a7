//! Workflow Execution Module
//!
//! Provides the engine that explodes templates into workflow entities and
//! moves their tasks through the state machine.
//!
//! # Architecture
//!
//! - [`engine`]: Explosion, task transitions and concurrent fan-out
//! - [`handler`]: Named business-logic handlers run under a timeout
//! - [`completion`]: Entity completion check

pub mod completion;
pub mod engine;
pub mod handler;

pub use completion::{validate_and_complete, CompletionOutcome};
pub use engine::{Engine, ExplodeRequest, ExplodedTask};
pub use handler::{HandlerContext, HandlerError, HandlerExecutor, HandlerRegistry, KeyValue};
