//! Handler Execution
//!
//! Server-driven business logic is addressed by name and dispatched through
//! the [`HandlerExecutor`] trait. Each invocation runs on its own thread
//! under a timeout:
//! - Outputs are returned as key/value pairs and merged into process data
//! - A handler that overruns its deadline is flagged cancelled and abandoned
//! - A panicking handler is reported as an error instead of unwinding the engine

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use crate::template::ProcessData;

/// One output produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Merges handler outputs into process data, later keys winning.
pub fn merge_outputs(data: &mut ProcessData, outputs: Vec<KeyValue>) {
    for kv in outputs {
        data.insert(kv.key, kv.value);
    }
}

/// Error type for handler invocations
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered under '{0}'")]
    NotRegistered(String),

    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("panicked: {0}")]
    Panicked(String),
}

/// Identifies the task a handler runs for and carries its cancellation flag.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub entity_id: i64,
    pub task_id: i64,
    pub node_id: String,
    pub deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl HandlerContext {
    pub fn new(entity_id: i64, task_id: i64, node_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            entity_id,
            task_id,
            node_id: node_id.into(),
            deadline: Instant::now() + timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Long-running handlers should poll this and return early once it is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || Instant::now() >= self.deadline
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Dispatches named business logic.
pub trait HandlerExecutor: Send + Sync {
    fn invoke(
        &self,
        name: &str,
        data: &ProcessData,
        ctx: &HandlerContext,
    ) -> Result<Vec<KeyValue>, HandlerError>;
}

type HandlerFn =
    dyn Fn(&ProcessData, &HandlerContext) -> Result<Vec<KeyValue>, HandlerError> + Send + Sync;

/// Name-to-closure handler table.
///
/// # Example
///
/// ```rust
/// use flowcore::execution::handler::{HandlerRegistry, KeyValue};
///
/// let registry = HandlerRegistry::new();
/// registry.register("approve", |_data, _ctx| Ok(vec![KeyValue::new("status", "approved")]));
/// assert!(registry.contains("approve"));
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<HandlerFn>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one with the same name.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&ProcessData, &HandlerContext) -> Result<Vec<KeyValue>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        debug!("Registering handler '{}'", name);
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.insert(name, Arc::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        match self.handlers.read() {
            Ok(guard) => guard.contains_key(name),
            Err(poisoned) => poisoned.into_inner().contains_key(name),
        }
    }

    fn get(&self, name: &str) -> Option<Arc<HandlerFn>> {
        match self.handlers.read() {
            Ok(guard) => guard.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = match self.handlers.read() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerExecutor for HandlerRegistry {
    fn invoke(
        &self,
        name: &str,
        data: &ProcessData,
        ctx: &HandlerContext,
    ) -> Result<Vec<KeyValue>, HandlerError> {
        let handler = self
            .get(name)
            .ok_or_else(|| HandlerError::NotRegistered(name.to_string()))?;
        handler(data, ctx)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs a handler on its own thread and waits at most `timeout` for it.
///
/// On timeout the context is flagged cancelled and the thread is detached.
pub fn run_with_timeout(
    executor: Arc<dyn HandlerExecutor>,
    name: &str,
    data: ProcessData,
    ctx: HandlerContext,
    timeout: Duration,
) -> Result<Vec<KeyValue>, HandlerError> {
    let (tx, rx) = mpsc::channel();
    let worker_ctx = ctx.clone();
    let handler_name = name.to_string();

    let handle = thread::spawn(move || {
        let result = executor.invoke(&handler_name, &data, &worker_ctx);
        // Receiver is gone once the caller timed out
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            let _ = handle.join();
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "Handler '{}' for task {} exceeded {:?}; cancelling",
                name, ctx.task_id, timeout
            );
            ctx.cancel();
            Err(HandlerError::TimedOut(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => match handle.join() {
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload))),
            Ok(()) => Err(HandlerError::Failed(
                "handler thread exited without a result".to_string(),
            )),
        },
    }
}
