//! SQLite Store
//!
//! [`WorkflowStore`] over a single `rusqlite` connection. Transactions are
//! opened with `BEGIN IMMEDIATE` while holding the connection lock, so every
//! transaction is serialized against every other one. This is what makes the
//! completion check-then-set safe when several end branches finish at once.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    Assignee, EntityStatus, HistoryAction, NewEntity, NewTask, StoreError, StoreResult, StoreTx,
    TaskHistory, TaskStatus, WorkflowEntity, WorkflowStore, WorkflowTask,
};
use crate::template::{NodeType, ProcessData};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS roles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS user_roles (
        user_id INTEGER NOT NULL REFERENCES users(id),
        role_id INTEGER NOT NULL REFERENCES roles(id),
        PRIMARY KEY (user_id, role_id)
    );

    CREATE TABLE IF NOT EXISTS workflow_entities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        template_uuid TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        template_snapshot TEXT NOT NULL,
        status INTEGER NOT NULL,
        client_id TEXT NOT NULL DEFAULT '',
        created_on TEXT NOT NULL,
        created_by TEXT NOT NULL,
        completed_on TEXT
    );

    CREATE TABLE IF NOT EXISTS workflow_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_entity_id INTEGER NOT NULL REFERENCES workflow_entities(id),
        node_id TEXT NOT NULL,
        node_type TEXT NOT NULL,
        status INTEGER NOT NULL,
        pre_task_data TEXT NOT NULL,
        process_data TEXT NOT NULL,
        page TEXT,
        handler TEXT,
        notification_uuid TEXT,
        created_on TEXT NOT NULL,
        started_on TEXT,
        completed_on TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_entity
        ON workflow_tasks(workflow_entity_id, status);

    CREATE TABLE IF NOT EXISTS workflow_task_assignments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_task_id INTEGER NOT NULL REFERENCES workflow_tasks(id),
        role_id INTEGER REFERENCES roles(id),
        user_id INTEGER REFERENCES users(id)
    );

    CREATE INDEX IF NOT EXISTS idx_assignments_task
        ON workflow_task_assignments(workflow_task_id);

    CREATE TABLE IF NOT EXISTS workflow_task_histories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_task_id INTEGER NOT NULL REFERENCES workflow_tasks(id),
        action TEXT NOT NULL,
        status INTEGER NOT NULL,
        actor TEXT NOT NULL,
        detail TEXT NOT NULL DEFAULT '',
        created_on TEXT NOT NULL
    );
";

const TASK_COLUMNS: &str = "t.id, t.workflow_entity_id, t.node_id, t.node_type, t.status, \
     t.pre_task_data, t.process_data, t.page, t.handler, t.notification_uuid, \
     t.created_on, t.started_on, t.completed_on";

/// SQLite-backed workflow store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn, &path.display().to_string())
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("SQLite workflow store opened: {}", label);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Registers a role, returning its ID. Existing roles are reused.
    pub fn add_role(&self, name: &str) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute("INSERT OR IGNORE INTO roles (name) VALUES (?1)", params![name])?;
        Ok(conn.query_row("SELECT id FROM roles WHERE name = ?1", params![name], |r| r.get(0))?)
    }

    /// Registers a user, returning its ID. Existing users are reused.
    pub fn add_user(&self, name: &str) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute("INSERT OR IGNORE INTO users (name) VALUES (?1)", params![name])?;
        Ok(conn.query_row("SELECT id FROM users WHERE name = ?1", params![name], |r| r.get(0))?)
    }

    /// Grants a role to a user, creating either if needed.
    pub fn grant_role(&self, user: &str, role: &str) -> StoreResult<()> {
        let user_id = self.add_user(user)?;
        let role_id = self.add_role(role)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
            params![user_id, role_id],
        )?;
        Ok(())
    }
}

impl WorkflowStore for SqliteStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTx {
            conn,
            finished: false,
        }))
    }
}

/// An open transaction; holds the connection lock until committed or dropped.
struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.conn.execute_batch("ROLLBACK") {
            Ok(()) => debug!("Transaction rolled back"),
            Err(e) => warn!("Failed to roll back transaction: {}", e),
        }
    }
}

/// Raw task columns, decoded outside the rusqlite row callback.
struct TaskRow {
    id: i64,
    workflow_entity_id: i64,
    node_id: String,
    node_type: String,
    status: i64,
    pre_task_data: String,
    process_data: String,
    page: Option<String>,
    handler: Option<String>,
    notification_uuid: Option<String>,
    created_on: String,
    started_on: Option<String>,
    completed_on: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            workflow_entity_id: row.get(1)?,
            node_id: row.get(2)?,
            node_type: row.get(3)?,
            status: row.get(4)?,
            pre_task_data: row.get(5)?,
            process_data: row.get(6)?,
            page: row.get(7)?,
            handler: row.get(8)?,
            notification_uuid: row.get(9)?,
            created_on: row.get(10)?,
            started_on: row.get(11)?,
            completed_on: row.get(12)?,
        })
    }

    fn decode(self) -> StoreResult<WorkflowTask> {
        Ok(WorkflowTask {
            id: self.id,
            workflow_entity_id: self.workflow_entity_id,
            node_id: self.node_id,
            node_type: self
                .node_type
                .parse::<NodeType>()
                .map_err(StoreError::Corrupt)?,
            status: TaskStatus::from_code(self.status)?,
            pre_task_data: decode_data(&self.pre_task_data)?,
            process_data: decode_data(&self.process_data)?,
            page: self.page,
            handler: self.handler,
            notification_uuid: self.notification_uuid,
            created_on: decode_time(&self.created_on)?,
            started_on: self.started_on.as_deref().map(decode_time).transpose()?,
            completed_on: self.completed_on.as_deref().map(decode_time).transpose()?,
        })
    }
}

fn decode_data(raw: &str) -> StoreResult<ProcessData> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("process data: {}", e)))
}

fn encode_data(data: &ProcessData) -> StoreResult<String> {
    serde_json::to_string(data).map_err(|e| StoreError::Corrupt(format!("process data: {}", e)))
}

fn decode_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn collect_tasks(rows: Vec<TaskRow>) -> StoreResult<Vec<WorkflowTask>> {
    rows.into_iter().map(TaskRow::decode).collect()
}

impl SqliteTx<'_> {
    fn query_tasks(&self, sql: &str, id: i64) -> StoreResult<Vec<WorkflowTask>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![id], TaskRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        collect_tasks(rows)
    }
}

impl StoreTx for SqliteTx<'_> {
    fn insert_entity(&mut self, entity: &NewEntity) -> StoreResult<i64> {
        self.conn.execute(
            "INSERT INTO workflow_entities (template_uuid, entity_type, entity_name, description,
                 template_snapshot, status, client_id, created_on, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entity.template_uuid,
                entity.entity_type,
                entity.entity_name,
                entity.description,
                entity.template_snapshot,
                EntityStatus::Active.code(),
                entity.client_id,
                entity.created_on.to_rfc3339(),
                entity.created_by,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn entity(&mut self, id: i64) -> StoreResult<Option<WorkflowEntity>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, template_uuid, entity_type, entity_name, description, template_snapshot,
                        status, client_id, created_on, created_by, completed_on
                 FROM workflow_entities WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        (
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, String>(3)?,
                            r.get::<_, String>(4)?,
                            r.get::<_, String>(5)?,
                        ),
                        (
                            r.get::<_, i64>(6)?,
                            r.get::<_, String>(7)?,
                            r.get::<_, String>(8)?,
                            r.get::<_, String>(9)?,
                            r.get::<_, Option<String>>(10)?,
                        ),
                    ))
                },
            )
            .optional()?;

        let Some((
            (id, template_uuid, entity_type, entity_name, description, template_snapshot),
            (status, client_id, created_on, created_by, completed_on),
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(WorkflowEntity {
            id,
            template_uuid,
            entity_type,
            entity_name,
            description,
            template_snapshot,
            status: EntityStatus::from_code(status)?,
            client_id,
            created_on: decode_time(&created_on)?,
            created_by,
            completed_on: completed_on.as_deref().map(decode_time).transpose()?,
        }))
    }

    fn count_incomplete_tasks(&mut self, entity_id: i64) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM workflow_tasks WHERE workflow_entity_id = ?1 AND status <> ?2",
            params![entity_id, TaskStatus::Completed.code()],
            |r| r.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn complete_entity(&mut self, id: i64, at: DateTime<Utc>) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE workflow_entities SET status = ?2, completed_on = ?3
             WHERE id = ?1 AND status <> ?2",
            params![id, EntityStatus::Completed.code(), at.to_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    fn insert_task(&mut self, task: &NewTask) -> StoreResult<i64> {
        let data = encode_data(&task.data)?;
        self.conn.execute(
            "INSERT INTO workflow_tasks (workflow_entity_id, node_id, node_type, status,
                 pre_task_data, process_data, page, handler, created_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8)",
            params![
                task.workflow_entity_id,
                task.node_id,
                task.node_type.as_str(),
                TaskStatus::Created.code(),
                data,
                task.page,
                task.handler,
                task.created_on.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn task(&mut self, id: i64) -> StoreResult<Option<WorkflowTask>> {
        let sql = format!("SELECT {} FROM workflow_tasks t WHERE t.id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::read)
            .optional()?;
        row.map(TaskRow::decode).transpose()
    }

    fn tasks_for_entity(&mut self, entity_id: i64) -> StoreResult<Vec<WorkflowTask>> {
        let sql = format!(
            "SELECT {} FROM workflow_tasks t WHERE t.workflow_entity_id = ?1 ORDER BY t.id",
            TASK_COLUMNS
        );
        self.query_tasks(&sql, entity_id)
    }

    fn transition_task(
        &mut self,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE workflow_tasks SET status = ?3,
                 started_on = CASE WHEN ?3 = ?5 THEN ?4 ELSE started_on END,
                 completed_on = CASE WHEN ?3 = ?6 THEN ?4 ELSE completed_on END
             WHERE id = ?1 AND status = ?2",
            params![
                id,
                from.code(),
                to.code(),
                at.to_rfc3339(),
                TaskStatus::Started.code(),
                TaskStatus::Completed.code(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn set_process_data(&mut self, id: i64, data: &ProcessData) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE workflow_tasks SET process_data = ?2 WHERE id = ?1",
            params![id, encode_data(data)?],
        )?;
        Ok(())
    }

    fn set_notification_uuid(&mut self, id: i64, uuid: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE workflow_tasks SET notification_uuid = ?2 WHERE id = ?1",
            params![id, uuid],
        )?;
        Ok(())
    }

    fn find_role_id(&mut self, name: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT id FROM roles WHERE name = ?1", params![name], |r| r.get(0))
            .optional()?)
    }

    fn find_user_id(&mut self, name: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT id FROM users WHERE name = ?1", params![name], |r| r.get(0))
            .optional()?)
    }

    fn insert_assignment(&mut self, task_id: i64, assignee: Assignee) -> StoreResult<()> {
        let (role_id, user_id) = match assignee {
            Assignee::Role(id) => (Some(id), None),
            Assignee::User(id) => (None, Some(id)),
        };
        self.conn.execute(
            "INSERT INTO workflow_task_assignments (workflow_task_id, role_id, user_id)
             VALUES (?1, ?2, ?3)",
            params![task_id, role_id, user_id],
        )?;
        Ok(())
    }

    fn assignments(&mut self, task_id: i64) -> StoreResult<Vec<Assignee>> {
        let mut stmt = self.conn.prepare(
            "SELECT role_id, user_id FROM workflow_task_assignments
             WHERE workflow_task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![task_id], |r| {
                Ok((r.get::<_, Option<i64>>(0)?, r.get::<_, Option<i64>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|pair| match pair {
                (Some(role), None) => Ok(Assignee::Role(role)),
                (None, Some(user)) => Ok(Assignee::User(user)),
                _ => Err(StoreError::Corrupt(format!(
                    "assignment of task {} must name exactly one role or user",
                    task_id
                ))),
            })
            .collect()
    }

    fn inbox_for_user(&mut self, user_id: i64) -> StoreResult<Vec<WorkflowTask>> {
        let sql = format!(
            "SELECT DISTINCT {} FROM workflow_tasks t
             JOIN workflow_task_assignments a ON a.workflow_task_id = t.id
             WHERE t.status = {} AND t.page IS NOT NULL
               AND (a.user_id = ?1
                    OR a.role_id IN (SELECT role_id FROM user_roles WHERE user_id = ?1))
             ORDER BY t.id",
            TASK_COLUMNS,
            TaskStatus::Started.code()
        );
        self.query_tasks(&sql, user_id)
    }

    fn insert_history(&mut self, entry: &TaskHistory) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO workflow_task_histories (workflow_task_id, action, status, actor, detail, created_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.task_id,
                entry.action.as_str(),
                entry.status.code(),
                entry.actor,
                entry.detail,
                entry.created_on.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn history(&mut self, task_id: i64) -> StoreResult<Vec<TaskHistory>> {
        let mut stmt = self.conn.prepare(
            "SELECT action, status, actor, detail, created_on FROM workflow_task_histories
             WHERE workflow_task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![task_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(action, status, actor, detail, created_on)| {
                Ok(TaskHistory {
                    task_id,
                    action: action.parse::<HistoryAction>()?,
                    status: TaskStatus::from_code(status)?,
                    actor,
                    detail,
                    created_on: decode_time(&created_on)?,
                })
            })
            .collect()
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}
