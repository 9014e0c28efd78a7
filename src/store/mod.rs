//! Relational Store
//!
//! Rows owned by the engine (entities, tasks, assignments, history) and the
//! transactional interface every write goes through.
//!
//! The engine never shares a transaction between threads: each explosion,
//! transition or completion check opens its own [`StoreTx`], and all
//! cross-thread coordination relies on the store's isolation.
//!
//! # Structure
//!
//! - [`sqlite`]: SQLite implementation backed by `rusqlite`

pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::{NodeType, ProcessData, WorkflowTemplate};

pub use sqlite::SqliteStore;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    Poisoned,

    /// Status code 3 is reserved and never written by the engine
    #[error("invalid status code {0}")]
    InvalidStatus(i64),

    /// A stored value could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lifecycle state of a workflow task.
///
/// Codes match the persisted values; code `3` is reserved and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Started,
    ExecutionError,
    Completed,
}

impl TaskStatus {
    /// Returns the persisted status code.
    pub fn code(self) -> i64 {
        match self {
            Self::Created => 1,
            Self::Started => 2,
            Self::ExecutionError => 4,
            Self::Completed => 5,
        }
    }

    /// Decodes a persisted status code.
    pub fn from_code(code: i64) -> StoreResult<Self> {
        match code {
            1 => Ok(Self::Created),
            2 => Ok(Self::Started),
            4 => Ok(Self::ExecutionError),
            5 => Ok(Self::Completed),
            other => Err(StoreError::InvalidStatus(other)),
        }
    }

    /// Returns true if the state machine allows moving from `self` to `to`.
    ///
    /// `ExecutionError -> Started` is the operator retry path.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Started)
                | (Self::Started, Self::Completed)
                | (Self::Started, Self::ExecutionError)
                | (Self::ExecutionError, Self::Started)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::ExecutionError => "execution_error",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a workflow entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Completed,
}

impl EntityStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Active => 1,
            Self::Completed => 5,
        }
    }

    pub fn from_code(code: i64) -> StoreResult<Self> {
        match code {
            1 => Ok(Self::Active),
            5 => Ok(Self::Completed),
            other => Err(StoreError::InvalidStatus(other)),
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Completed => f.write_str("completed"),
        }
    }
}

/// One running instance of a template, tied to a business object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowEntity {
    pub id: i64,
    pub template_uuid: String,
    pub entity_type: String,
    pub entity_name: String,
    pub description: String,
    /// JSON copy of the template taken at explosion time
    pub template_snapshot: String,
    pub status: EntityStatus,
    pub client_id: String,
    pub created_on: DateTime<Utc>,
    pub created_by: String,
    pub completed_on: Option<DateTime<Utc>>,
}

impl WorkflowEntity {
    /// Decodes the template this entity was exploded from.
    pub fn template(&self) -> serde_json::Result<WorkflowTemplate> {
        serde_json::from_str(&self.template_snapshot)
    }
}

/// Values for a new entity row.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub template_uuid: String,
    pub entity_type: String,
    pub entity_name: String,
    pub description: String,
    pub template_snapshot: String,
    pub client_id: String,
    pub created_by: String,
    pub created_on: DateTime<Utc>,
}

/// A persisted instance of one node within one entity's run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowTask {
    pub id: i64,
    pub workflow_entity_id: i64,
    pub node_id: String,
    pub node_type: NodeType,
    pub status: TaskStatus,
    /// Process data as it was when the task was created; never updated
    pub pre_task_data: ProcessData,
    /// Working copy that handler outputs and external patches merge into
    pub process_data: ProcessData,
    pub page: Option<String>,
    pub handler: Option<String>,
    pub notification_uuid: Option<String>,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
}

/// Values for a new task row; `data` seeds both data columns.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub workflow_entity_id: i64,
    pub node_id: String,
    pub node_type: NodeType,
    pub data: ProcessData,
    pub page: Option<String>,
    pub handler: Option<String>,
    pub created_on: DateTime<Utc>,
}

/// Target of a task assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Assignee {
    Role(i64),
    User(i64),
}

/// Transition recorded in the task history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Create,
    Start,
    Complete,
    ExecutionError,
    UpdateData,
    Retry,
}

impl HistoryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::ExecutionError => "execution_error",
            Self::UpdateData => "update_data",
            Self::Retry => "retry",
        }
    }
}

impl FromStr for HistoryAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "start" => Ok(Self::Start),
            "complete" => Ok(Self::Complete),
            "execution_error" => Ok(Self::ExecutionError),
            "update_data" => Ok(Self::UpdateData),
            "retry" => Ok(Self::Retry),
            other => Err(StoreError::Corrupt(format!("unknown history action '{}'", other))),
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHistory {
    pub task_id: i64,
    pub action: HistoryAction,
    /// Task status after the transition
    pub status: TaskStatus,
    pub actor: String,
    pub detail: String,
    pub created_on: DateTime<Utc>,
}

impl TaskHistory {
    pub fn new(task_id: i64, action: HistoryAction, status: TaskStatus, actor: &str) -> Self {
        Self {
            task_id,
            action,
            status,
            actor: actor.to_string(),
            detail: String::new(),
            created_on: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// A relational store that hands out transactions.
pub trait WorkflowStore: Send + Sync {
    /// Opens a transaction. Dropping it without [`StoreTx::commit`] rolls back.
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>>;
}

/// Operations available inside one transaction.
pub trait StoreTx {
    fn insert_entity(&mut self, entity: &NewEntity) -> StoreResult<i64>;
    fn entity(&mut self, id: i64) -> StoreResult<Option<WorkflowEntity>>;

    /// Counts tasks of the entity whose status is not `Completed`.
    fn count_incomplete_tasks(&mut self, entity_id: i64) -> StoreResult<u64>;

    /// Marks the entity completed unless it already is.
    ///
    /// Returns true only for the call that performed the transition.
    fn complete_entity(&mut self, id: i64, at: DateTime<Utc>) -> StoreResult<bool>;

    fn insert_task(&mut self, task: &NewTask) -> StoreResult<i64>;
    fn task(&mut self, id: i64) -> StoreResult<Option<WorkflowTask>>;
    fn tasks_for_entity(&mut self, entity_id: i64) -> StoreResult<Vec<WorkflowTask>>;

    /// Moves a task from `from` to `to`, stamping `started_on`/`completed_on`.
    ///
    /// Returns false without writing if the task is not currently in `from`.
    fn transition_task(
        &mut self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    fn set_process_data(&mut self, id: i64, data: &ProcessData) -> StoreResult<()>;
    fn set_notification_uuid(&mut self, id: i64, uuid: &str) -> StoreResult<()>;

    fn find_role_id(&mut self, name: &str) -> StoreResult<Option<i64>>;
    fn find_user_id(&mut self, name: &str) -> StoreResult<Option<i64>>;
    fn insert_assignment(&mut self, task_id: i64, assignee: Assignee) -> StoreResult<()>;
    fn assignments(&mut self, task_id: i64) -> StoreResult<Vec<Assignee>>;

    /// Started human tasks assigned to the user directly or through a role.
    fn inbox_for_user(&mut self, user_id: i64) -> StoreResult<Vec<WorkflowTask>>;

    fn insert_history(&mut self, entry: &TaskHistory) -> StoreResult<()>;
    fn history(&mut self, task_id: i64) -> StoreResult<Vec<TaskHistory>>;

    fn commit(self: Box<Self>) -> StoreResult<()>;
}
