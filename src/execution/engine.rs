//! Workflow Execution Engine
//!
//! Instantiates templates against business entities and drives every task
//! through its lifecycle:
//! - Explosion of the start node's successors into a new workflow entity
//! - Role/user assignment and notification emission per task
//! - Server-driven execution of handlers under a timeout
//! - Gateway routing and concurrent fan-out to successor nodes
//! - Completion detection when an end node is reached
//!
//! Each write runs in its own store transaction and no transaction is held
//! while a handler runs or while successor branches are joined.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::notify::{dispatch_create, dispatch_update, LogNotifier, Notification, Notifier};
use crate::store::{
    Assignee, HistoryAction, NewEntity, NewTask, StoreTx, TaskHistory, TaskStatus,
    WorkflowEntity, WorkflowStore, WorkflowTask,
};
use crate::template::{
    routing, validate_template, Node, NodeType, ProcessData, TemplateStore, ValidationError,
    WorkflowTemplate,
};

use super::completion::{validate_and_complete, CompletionOutcome};
use super::handler::{
    merge_outputs, run_with_timeout, HandlerContext, HandlerExecutor, HandlerRegistry,
};

/// Default upper bound for one handler invocation.
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default actor recorded for engine-driven transitions.
const DEFAULT_ACTOR: &str = "flowcore";

/// Message sent to the notification service when a task completes.
const TASK_COMPLETED_MESSAGE: &str = "Task Completed";

/// Arguments of one explosion.
#[derive(Debug, Clone, Default)]
pub struct ExplodeRequest {
    pub template_name: String,
    pub entity_type: String,
    pub entity_name: String,
    /// User creating the entity
    pub user: String,
    pub client_id: String,
    pub description: String,
    /// Initial process data handed to the first tasks
    pub data: ProcessData,
}

impl ExplodeRequest {
    pub fn new(
        template_name: impl Into<String>,
        entity_type: impl Into<String>,
        entity_name: impl Into<String>,
    ) -> Self {
        Self {
            template_name: template_name.into(),
            entity_type: entity_type.into(),
            entity_name: entity_name.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_data(mut self, data: ProcessData) -> Self {
        self.data = data;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A task row written by [`Engine::explode_node`] whose transaction has not
/// been launched yet.
#[derive(Debug, Clone)]
pub struct ExplodedTask {
    pub task_id: i64,
    pub node_id: String,
    notification: Option<Notification>,
}

impl ExplodedTask {
    /// Notification to send once the transaction has committed.
    pub fn notification(&self) -> Option<&Notification> {
        self.notification.as_ref()
    }
}

/// Everything needed to move one task: its row, its entity and its node.
struct TaskContext {
    task: WorkflowTask,
    entity: WorkflowEntity,
    template: WorkflowTemplate,
    node: Node,
}

/// Workflow orchestration engine.
///
/// Cheap to clone; clones share the stores, notifier and handlers.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowcore::execution::{Engine, ExplodeRequest};
/// use flowcore::store::SqliteStore;
/// use flowcore::template::DirTemplateStore;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let templates = Arc::new(DirTemplateStore::new("templates"));
///     let store = Arc::new(SqliteStore::open("flowcore.db".as_ref())?);
///     let engine = Engine::new(templates, store);
///
///     let request = ExplodeRequest::new("purchase_order", "order", "PO-1001")
///         .with_user("alice")
///         .with_value("amount", 1200);
///     let entity_id = engine.explode(&request)?;
///     println!("created entity {}", entity_id);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    templates: Arc<dyn TemplateStore>,
    store: Arc<dyn WorkflowStore>,
    notifier: Arc<dyn Notifier>,
    handlers: Arc<dyn HandlerExecutor>,
    handler_timeout: Duration,
    actor: String,
    /// Completion checks that may still be running
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Engine {
    /// Creates an engine with a logging notifier and no handlers.
    pub fn new(templates: Arc<dyn TemplateStore>, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            templates,
            store,
            notifier: Arc::new(LogNotifier),
            handlers: Arc::new(HandlerRegistry::new()),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            actor: DEFAULT_ACTOR.to_string(),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = notifier;
    }

    pub fn set_handlers(&mut self, handlers: Arc<dyn HandlerExecutor>) {
        self.handlers = handlers;
    }

    /// Sets the upper bound for one handler invocation.
    pub fn set_handler_timeout(&mut self, timeout: Duration) {
        self.handler_timeout = timeout;
    }

    /// Sets the actor recorded in history rows and notifications.
    pub fn set_actor(&mut self, actor: impl Into<String>) {
        self.actor = actor.into();
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Blocks until every background completion check has finished.
    ///
    /// Short-lived callers such as the CLI call this before exiting so an
    /// entity whose end node was just reached is not left `Active`.
    pub fn wait_pending(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = self.pending_checks().drain(..).collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.join().is_err() {
                    error!("Completion check thread panicked");
                }
            }
        }
    }

    fn pending_checks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ---------------------------------------------------------------------
    // Explosion
    // ---------------------------------------------------------------------

    /// Instantiates the default template named in `request`.
    ///
    /// The entity and its first tasks are committed in one transaction.
    /// The first tasks are then executed; their failures are recorded on the
    /// task rows and logged, but do not fail the explosion.
    ///
    /// # Returns
    ///
    /// * `Ok(entity_id)` - Entity committed
    /// * `Err` - Template lookup, template shape or store failure; nothing was written
    pub fn explode(&self, request: &ExplodeRequest) -> Result<i64> {
        let template = self.templates.find_default(&request.template_name)?;
        check_template(&template)?;

        let start = template
            .start_node()
            .ok_or_else(|| WorkflowError::StartNodeMissing(template.name.clone()))?;

        let first: Vec<&Node> = template
            .successors(&start.id)
            .into_iter()
            .filter(|n| n.node_type != NodeType::End)
            .collect();
        if first.is_empty() {
            return Err(WorkflowError::NoReachableNode(template.name.clone()));
        }

        let snapshot = serde_json::to_string(&template)?;
        let created_by = if request.user.is_empty() {
            self.actor.clone()
        } else {
            request.user.clone()
        };

        let mut tx = self.store.begin()?;
        let entity_id = tx.insert_entity(&NewEntity {
            template_uuid: template.uuid.clone(),
            entity_type: request.entity_type.clone(),
            entity_name: request.entity_name.clone(),
            description: request.description.clone(),
            template_snapshot: snapshot,
            client_id: request.client_id.clone(),
            created_by,
            created_on: Utc::now(),
        })?;
        let entity = tx
            .entity(entity_id)?
            .ok_or(WorkflowError::EntityNotFound(entity_id))?;

        let mut exploded = Vec::with_capacity(first.len());
        for node in first {
            exploded.push(self.explode_node(tx.as_mut(), node, &entity, &request.data)?);
        }
        tx.commit()?;

        info!(
            "Exploded '{}' v{} into entity {} ({} first tasks)",
            template.name,
            template.version,
            entity_id,
            exploded.len()
        );

        for task in exploded {
            let (task_id, node_id) = (task.task_id, task.node_id.clone());
            if let Err(e) = self.launch(task) {
                error!(
                    "Task {} ({}) of entity {} failed: {}",
                    task_id, node_id, entity_id, e
                );
            }
        }

        Ok(entity_id)
    }

    /// Writes the task row for `node` inside `tx`.
    ///
    /// The node's own `process_data` seeds the task and `incoming` overrides
    /// it. Roles and users that cannot be resolved are logged and skipped.
    /// The returned task must be passed to [`Engine::launch`] after commit.
    pub fn explode_node(
        &self,
        tx: &mut dyn StoreTx,
        node: &Node,
        entity: &WorkflowEntity,
        incoming: &ProcessData,
    ) -> Result<ExplodedTask> {
        let mut data = node.process_data.clone();
        data.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));

        let handler = if node.node_type.is_structural() {
            None
        } else {
            node.handler.clone()
        };

        let task_id = tx.insert_task(&NewTask {
            workflow_entity_id: entity.id,
            node_id: node.id.clone(),
            node_type: node.node_type,
            data,
            page: node.page.clone(),
            handler,
            created_on: Utc::now(),
        })?;

        let mut roles = Vec::new();
        for name in &node.roles {
            match tx.find_role_id(name)? {
                Some(id) => {
                    tx.insert_assignment(task_id, Assignee::Role(id))?;
                    roles.push(name.clone());
                }
                None => warn!(
                    "{}",
                    WorkflowError::AssignmentResolutionFailed {
                        task_id,
                        kind: "role",
                        name: name.clone(),
                    }
                ),
            }
        }

        let mut users = Vec::new();
        for name in &node.users {
            match tx.find_user_id(name)? {
                Some(id) => {
                    tx.insert_assignment(task_id, Assignee::User(id))?;
                    users.push(name.clone());
                }
                None => warn!(
                    "{}",
                    WorkflowError::AssignmentResolutionFailed {
                        task_id,
                        kind: "user",
                        name: name.clone(),
                    }
                ),
            }
        }

        let notification = if node.notifies() {
            let uuid = Uuid::new_v4().to_string();
            tx.set_notification_uuid(task_id, &uuid)?;
            Some(Notification {
                uuid,
                entity_id: entity.id,
                entity_name: entity.entity_name.clone(),
                template_uuid: entity.template_uuid.clone(),
                task_id,
                node_id: node.id.clone(),
                page: node.page.clone(),
                roles,
                users,
            })
        } else {
            None
        };

        tx.insert_history(&TaskHistory::new(
            task_id,
            HistoryAction::Create,
            TaskStatus::Created,
            &self.actor,
        ))?;

        debug!(
            "Created task {} for {} node '{}' of entity {}",
            task_id, node.node_type, node.id, entity.id
        );

        Ok(ExplodedTask {
            task_id,
            node_id: node.id.clone(),
            notification,
        })
    }

    /// Sends the task's notification and executes it.
    pub fn launch(&self, task: ExplodedTask) -> Result<()> {
        if let Some(notification) = task.notification {
            dispatch_create(Arc::clone(&self.notifier), notification, self.actor.clone());
        }
        self.execute(task.task_id)
    }

    // ---------------------------------------------------------------------
    // Task state machine
    // ---------------------------------------------------------------------

    /// Starts a created task and runs whatever the engine can do for it.
    ///
    /// - Start/end nodes complete immediately
    /// - Nodes with a page stop at `Started` for a user
    /// - Other nodes run their handler (if any) and complete
    pub fn execute(&self, task_id: i64) -> Result<()> {
        let mut tx = self.store.begin()?;
        let ctx = load_context(tx.as_mut(), task_id)?;
        if ctx.task.status != TaskStatus::Created {
            return Err(WorkflowError::InvalidTransition {
                task_id,
                from: ctx.task.status,
                to: TaskStatus::Started,
            });
        }
        self.transition(tx.as_mut(), &ctx.task, TaskStatus::Started, HistoryAction::Start, "")?;
        tx.commit()?;

        debug!("Started task {} ({})", task_id, ctx.node.id);
        self.proceed(&ctx)
    }

    /// Runs the server-driven part of a started task.
    fn proceed(&self, ctx: &TaskContext) -> Result<()> {
        if ctx.node.waits_for_human() {
            info!(
                "Task {} ({}) waiting on page '{}'",
                ctx.task.id,
                ctx.node.id,
                ctx.node.page.as_deref().unwrap_or_default()
            );
            return Ok(());
        }

        if let Some(handler) = ctx.task.handler.as_deref() {
            self.run_handler(ctx, handler)?;
        }

        self.complete_task(ctx.task.id)
    }

    fn run_handler(&self, ctx: &TaskContext, name: &str) -> Result<()> {
        let task_id = ctx.task.id;
        let handler_ctx =
            HandlerContext::new(ctx.entity.id, task_id, &ctx.node.id, self.handler_timeout);

        debug!("Invoking handler '{}' for task {}", name, task_id);
        let result = run_with_timeout(
            Arc::clone(&self.handlers),
            name,
            ctx.task.process_data.clone(),
            handler_ctx,
            self.handler_timeout,
        );

        match result {
            Ok(outputs) => {
                let mut data = ctx.task.process_data.clone();
                merge_outputs(&mut data, outputs);

                let mut tx = self.store.begin()?;
                tx.set_process_data(task_id, &data)?;
                tx.insert_history(
                    &TaskHistory::new(
                        task_id,
                        HistoryAction::UpdateData,
                        TaskStatus::Started,
                        &self.actor,
                    )
                    .with_detail(format!("handler '{}'", name)),
                )?;
                tx.commit()?;
                Ok(())
            }
            Err(source) => {
                error!("Handler '{}' failed for task {}: {}", name, task_id, source);
                self.mark_execution_error(task_id, &source.to_string())?;
                Err(WorkflowError::HandlerExecutionFailed {
                    task_id,
                    handler: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Completes a started task and explodes its successors.
    ///
    /// Gateways route on the task's current process data; a gateway with no
    /// matching entry moves to `ExecutionError` and fails with
    /// [`WorkflowError::NoRouteMatched`]. Successors are exploded
    /// concurrently, each in its own transaction, and all branches are joined
    /// before returning. The first branch error (in link order) is returned.
    pub fn complete_task(&self, task_id: i64) -> Result<()> {
        let mut tx = self.store.begin()?;
        let ctx = load_context(tx.as_mut(), task_id)?;
        if ctx.task.status != TaskStatus::Started {
            return Err(WorkflowError::InvalidTransition {
                task_id,
                from: ctx.task.status,
                to: TaskStatus::Completed,
            });
        }

        let next = match next_nodes(&ctx) {
            Ok(next) => next,
            Err(e) => {
                warn!("Task {} ({}): {}", task_id, ctx.node.id, e);
                self.transition(
                    tx.as_mut(),
                    &ctx.task,
                    TaskStatus::ExecutionError,
                    HistoryAction::ExecutionError,
                    &e.to_string(),
                )?;
                tx.commit()?;
                return Err(e);
            }
        };

        self.transition(
            tx.as_mut(),
            &ctx.task,
            TaskStatus::Completed,
            HistoryAction::Complete,
            "",
        )?;
        tx.commit()?;

        info!(
            "Task {} ({}) completed; {} successors",
            task_id,
            ctx.node.id,
            next.len()
        );

        if let Some(uuid) = ctx.task.notification_uuid.clone() {
            dispatch_update(
                Arc::clone(&self.notifier),
                uuid,
                self.actor.clone(),
                TASK_COMPLETED_MESSAGE.to_string(),
            );
        }

        if ctx.node.node_type == NodeType::End {
            self.spawn_completion_check(ctx.entity.id);
        }

        self.fan_out(ctx.entity.id, next, &ctx.task.process_data)
    }

    /// Explodes every successor on its own thread and joins them all.
    fn fan_out(&self, entity_id: i64, nodes: Vec<Node>, data: &ProcessData) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let watermark = self.last_task_id(entity_id)?;

        let branches: Vec<(String, JoinHandle<Result<()>>)> = nodes
            .into_iter()
            .map(|node| {
                let engine = self.clone();
                let data = data.clone();
                let node_id = node.id.clone();
                let handle = thread::spawn(move || engine.explode_successor(entity_id, &node, &data));
                (node_id, handle)
            })
            .collect();

        self.join_branches(entity_id, watermark, branches)
    }

    /// Joins fan-out branches; tasks above `watermark` belong to this fan-out.
    fn join_branches(
        &self,
        entity_id: i64,
        watermark: i64,
        branches: Vec<(String, JoinHandle<Result<()>>)>,
    ) -> Result<()> {
        let mut first_error = None;
        for (node_id, handle) in branches {
            let result = handle.join().unwrap_or_else(|_| {
                Err(self.fail_panicked_branch(entity_id, &node_id, watermark))
            });

            if let Err(e) = result {
                error!("Branch '{}' of entity {} failed: {}", node_id, entity_id, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn last_task_id(&self, entity_id: i64) -> Result<i64> {
        Ok(self
            .tasks(entity_id)?
            .iter()
            .map(|t| t.id)
            .max()
            .unwrap_or(0))
    }

    /// Moves the tasks a panicked branch left behind to `ExecutionError`.
    fn fail_panicked_branch(&self, entity_id: i64, node_id: &str, watermark: i64) -> WorkflowError {
        let err = WorkflowError::BranchPanicked(node_id.to_string());
        let stranded = match self.tasks(entity_id) {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|t| t.id > watermark && t.node_id == node_id)
                .collect(),
            Err(e) => {
                error!("Cannot look up tasks of entity {}: {}", entity_id, e);
                Vec::new()
            }
        };

        for task in stranded {
            if let Err(e) = self.fail_stranded_task(task.id, &err.to_string()) {
                error!("Cannot mark task {} as failed: {}", task.id, e);
            }
        }
        err
    }

    fn fail_stranded_task(&self, task_id: i64, detail: &str) -> Result<()> {
        let mut tx = self.store.begin()?;
        let mut task = tx.task(task_id)?.ok_or(WorkflowError::TaskNotFound(task_id))?;

        if task.status == TaskStatus::Created {
            self.transition(tx.as_mut(), &task, TaskStatus::Started, HistoryAction::Start, "")?;
            task.status = TaskStatus::Started;
        } else if task.status != TaskStatus::Started || task.page.is_some() {
            // Finished, already failed, or parked in an inbox
            return Ok(());
        }

        self.transition(
            tx.as_mut(),
            &task,
            TaskStatus::ExecutionError,
            HistoryAction::ExecutionError,
            detail,
        )?;
        tx.commit()?;
        warn!("Task {} ({}) failed: {}", task_id, task.node_id, detail);
        Ok(())
    }

    fn explode_successor(&self, entity_id: i64, node: &Node, data: &ProcessData) -> Result<()> {
        let mut tx = self.store.begin()?;
        let entity = tx
            .entity(entity_id)?
            .ok_or(WorkflowError::EntityNotFound(entity_id))?;
        let exploded = self.explode_node(tx.as_mut(), node, &entity, data)?;
        tx.commit()?;

        self.launch(exploded)
    }

    fn spawn_completion_check(&self, entity_id: i64) {
        let engine = self.clone();
        let handle = thread::spawn(move || match engine.validate_entity(entity_id) {
            Ok(outcome) => debug!("Completion check for entity {}: {:?}", entity_id, outcome),
            Err(e) => error!("Completion check for entity {} failed: {}", entity_id, e),
        });

        let mut pending = self.pending_checks();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Shallow-merges `patch` into the task's process data.
    ///
    /// Returns the merged data.
    pub fn update_process_data(&self, task_id: i64, patch: &ProcessData) -> Result<ProcessData> {
        let mut tx = self.store.begin()?;
        let task = tx.task(task_id)?.ok_or(WorkflowError::TaskNotFound(task_id))?;

        let mut data = task.process_data;
        for (key, value) in patch {
            data.insert(key.clone(), value.clone());
        }

        let keys: Vec<&str> = patch.keys().map(String::as_str).collect();
        tx.set_process_data(task_id, &data)?;
        tx.insert_history(
            &TaskHistory::new(task_id, HistoryAction::UpdateData, task.status, &self.actor)
                .with_detail(keys.join(",")),
        )?;
        tx.commit()?;

        debug!("Task {} process data updated: {}", task_id, keys.join(", "));
        Ok(data)
    }

    /// Moves a task out of `ExecutionError` and re-runs it.
    ///
    /// Human tasks go back to their inbox; server-driven tasks invoke their
    /// handler (or routing) again.
    pub fn retry_task(&self, task_id: i64) -> Result<()> {
        let mut tx = self.store.begin()?;
        let ctx = load_context(tx.as_mut(), task_id)?;
        if ctx.task.status != TaskStatus::ExecutionError {
            return Err(WorkflowError::InvalidTransition {
                task_id,
                from: ctx.task.status,
                to: TaskStatus::Started,
            });
        }
        self.transition(tx.as_mut(), &ctx.task, TaskStatus::Started, HistoryAction::Retry, "")?;
        tx.commit()?;

        info!("Retrying task {} ({})", task_id, ctx.node.id);
        self.proceed(&ctx)
    }

    fn mark_execution_error(&self, task_id: i64, detail: &str) -> Result<()> {
        let mut tx = self.store.begin()?;
        let task = tx.task(task_id)?.ok_or(WorkflowError::TaskNotFound(task_id))?;
        self.transition(
            tx.as_mut(),
            &task,
            TaskStatus::ExecutionError,
            HistoryAction::ExecutionError,
            detail,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Applies one state-machine transition and records it in the history.
    fn transition(
        &self,
        tx: &mut dyn StoreTx,
        task: &WorkflowTask,
        to: TaskStatus,
        action: HistoryAction,
        detail: &str,
    ) -> Result<()> {
        let invalid = WorkflowError::InvalidTransition {
            task_id: task.id,
            from: task.status,
            to,
        };
        if !task.status.can_transition_to(to) {
            return Err(invalid);
        }
        if !tx.transition_task(task.id, task.status, to, Utc::now())? {
            return Err(invalid);
        }
        tx.insert_history(
            &TaskHistory::new(task.id, action, to, &self.actor).with_detail(detail),
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Completion and queries
    // ---------------------------------------------------------------------

    /// Runs the completion check for an entity in its own transaction.
    pub fn validate_entity(&self, entity_id: i64) -> Result<CompletionOutcome> {
        let mut tx = self.store.begin()?;
        let outcome = validate_and_complete(tx.as_mut(), entity_id)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Started human tasks assigned to `user` directly or through a role.
    pub fn inbox(&self, user: &str) -> Result<Vec<WorkflowTask>> {
        let mut tx = self.store.begin()?;
        match tx.find_user_id(user)? {
            Some(user_id) => Ok(tx.inbox_for_user(user_id)?),
            None => {
                debug!("Unknown user '{}' has an empty inbox", user);
                Ok(Vec::new())
            }
        }
    }

    pub fn entity(&self, entity_id: i64) -> Result<WorkflowEntity> {
        let mut tx = self.store.begin()?;
        tx.entity(entity_id)?
            .ok_or(WorkflowError::EntityNotFound(entity_id))
    }

    pub fn task(&self, task_id: i64) -> Result<WorkflowTask> {
        let mut tx = self.store.begin()?;
        tx.task(task_id)?.ok_or(WorkflowError::TaskNotFound(task_id))
    }

    /// All tasks of an entity in creation order.
    pub fn tasks(&self, entity_id: i64) -> Result<Vec<WorkflowTask>> {
        let mut tx = self.store.begin()?;
        Ok(tx.tasks_for_entity(entity_id)?)
    }

    pub fn task_history(&self, task_id: i64) -> Result<Vec<TaskHistory>> {
        let mut tx = self.store.begin()?;
        Ok(tx.history(task_id)?)
    }

    pub fn task_assignments(&self, task_id: i64) -> Result<Vec<Assignee>> {
        let mut tx = self.store.begin()?;
        Ok(tx.assignments(task_id)?)
    }
}

/// Rejects templates that cannot be exploded.
fn check_template(template: &WorkflowTemplate) -> Result<()> {
    let errors = validate_template(template);
    if errors.iter().any(ValidationError::is_start_node_error) {
        return Err(WorkflowError::StartNodeMissing(template.name.clone()));
    }
    if !errors.is_empty() {
        let reason: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(WorkflowError::InvalidTemplate {
            name: template.name.clone(),
            reason: reason.join("; "),
        });
    }
    Ok(())
}

/// Loads a task with its entity and the node from the entity's template snapshot.
fn load_context(tx: &mut dyn StoreTx, task_id: i64) -> Result<TaskContext> {
    let task = tx.task(task_id)?.ok_or(WorkflowError::TaskNotFound(task_id))?;
    let entity = tx
        .entity(task.workflow_entity_id)?
        .ok_or(WorkflowError::EntityNotFound(task.workflow_entity_id))?;
    let template = entity.template()?;
    let node = template
        .node(&task.node_id)
        .cloned()
        .ok_or_else(|| WorkflowError::NodeNotFound {
            entity_id: entity.id,
            node: task.node_id.clone(),
        })?;

    Ok(TaskContext {
        task,
        entity,
        template,
        node,
    })
}

/// Decides which nodes follow a completing task.
fn next_nodes(ctx: &TaskContext) -> Result<Vec<Node>> {
    match ctx.node.node_type {
        NodeType::Gateway => {
            let targets = routing::evaluate(&ctx.node.routing_tables, &ctx.task.process_data);
            if targets.is_empty() {
                return Err(WorkflowError::NoRouteMatched {
                    task_id: ctx.task.id,
                    node: ctx.node.id.clone(),
                });
            }
            targets
                .iter()
                .map(|target| {
                    ctx.template
                        .node(target)
                        .cloned()
                        .ok_or_else(|| WorkflowError::NodeNotFound {
                            entity_id: ctx.entity.id,
                            node: target.clone(),
                        })
                })
                .collect()
        }
        NodeType::Start | NodeType::Task => Ok(ctx
            .template
            .successors(&ctx.node.id)
            .into_iter()
            .cloned()
            .collect()),
        NodeType::End => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::handler::{HandlerError, KeyValue};
    use crate::notify::NotifyError;
    use crate::store::{EntityStatus, SqliteStore};
    use crate::template::{MemoryTemplateStore, RoutingEntry};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingNotifier {
        created: Mutex<Vec<Notification>>,
        updated: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn create(&self, payload: &Notification, _actor: &str) -> std::result::Result<(), NotifyError> {
            self.created.lock().unwrap().push(payload.clone());
            Ok(())
        }

        fn update_by_uuid(
            &self,
            uuid: &str,
            _actor: &str,
            message: &str,
        ) -> std::result::Result<(), NotifyError> {
            self.updated
                .lock()
                .unwrap()
                .push((uuid.to_string(), message.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        engine: Engine,
        store: Arc<SqliteStore>,
        notifier: Arc<RecordingNotifier>,
        handlers: HandlerRegistry,
    }

    fn fixture(templates: Vec<WorkflowTemplate>) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let handlers = HandlerRegistry::new();

        let mut engine = Engine::new(
            Arc::new(MemoryTemplateStore::from_templates(templates)),
            store.clone(),
        );
        engine.set_notifier(notifier.clone());
        engine.set_handlers(Arc::new(handlers.clone()));
        engine.set_handler_timeout(Duration::from_secs(5));

        Fixture {
            engine,
            store,
            notifier,
            handlers,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn task_for(engine: &Engine, entity_id: i64, node: &str) -> WorkflowTask {
        engine
            .tasks(entity_id)
            .unwrap()
            .into_iter()
            .find(|t| t.node_id == node)
            .unwrap_or_else(|| panic!("no task for node '{}'", node))
    }

    fn node_ids(engine: &Engine, entity_id: i64) -> Vec<String> {
        engine
            .tasks(entity_id)
            .unwrap()
            .into_iter()
            .map(|t| t.node_id)
            .collect()
    }

    fn data(value: Value) -> ProcessData {
        value.as_object().cloned().unwrap()
    }

    /// start -> A(human) -> [B(gateway on flag -> D|E), C(human)]
    fn branching_template() -> WorkflowTemplate {
        WorkflowTemplate::new("branching")
            .with_node(Node::start("start"))
            .with_node(Node::task("A").with_page("a_form").with_role("clerk"))
            .with_node(
                Node::gateway("B")
                    .with_route(RoutingEntry::when("flag", "d", "D"))
                    .with_route(RoutingEntry::when("flag", "e", "E")),
            )
            .with_node(Node::task("C").with_page("c_form"))
            .with_node(Node::task("D").with_page("d_form"))
            .with_node(Node::task("E").with_page("e_form"))
            .with_link("start", "A")
            .with_link("A", "B")
            .with_link("A", "C")
    }

    #[test]
    fn test_explode_creates_first_task_only() {
        let f = fixture(vec![branching_template()]);
        f.store.grant_role("bob", "clerk").unwrap();

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("branching", "order", "PO-1").with_user("alice"))
            .unwrap();

        assert_eq!(node_ids(&f.engine, entity_id), vec!["A"]);
        let a = task_for(&f.engine, entity_id, "A");
        assert_eq!(a.status, TaskStatus::Started);
        assert!(a.notification_uuid.is_some());

        let entity = f.engine.entity(entity_id).unwrap();
        assert_eq!(entity.created_by, "alice");
        assert_eq!(entity.status, EntityStatus::Active);
        assert_eq!(entity.template().unwrap().name, "branching");

        let inbox = f.engine.inbox("bob").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].node_id, "A");
        assert!(f.engine.inbox("nobody").unwrap().is_empty());

        assert!(wait_until(|| f.notifier.created.lock().unwrap().len() == 1));
        let sent = f.notifier.created.lock().unwrap()[0].clone();
        assert_eq!(Some(sent.uuid), a.notification_uuid);
        assert_eq!(sent.roles, vec!["clerk"]);
    }

    #[test]
    fn test_explode_unknown_template() {
        let f = fixture(vec![]);
        let err = f
            .engine
            .explode(&ExplodeRequest::new("missing", "order", "PO-1"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::TemplateNotFound(_)));
    }

    #[test]
    fn test_explode_requires_single_start_node() {
        let none = WorkflowTemplate::new("none").with_node(Node::task("a"));
        let two = WorkflowTemplate::new("two")
            .with_node(Node::start("s1"))
            .with_node(Node::start("s2"))
            .with_node(Node::task("a"))
            .with_link("s1", "a");
        let f = fixture(vec![none, two]);

        for name in ["none", "two"] {
            let err = f
                .engine
                .explode(&ExplodeRequest::new(name, "order", "PO-1"))
                .unwrap_err();
            assert!(matches!(err, WorkflowError::StartNodeMissing(_)), "{}", name);
        }
    }

    #[test]
    fn test_explode_direct_to_end_is_rejected() {
        let template = WorkflowTemplate::new("empty_flow")
            .with_node(Node::start("start"))
            .with_node(Node::end("end"))
            .with_link("start", "end");
        let f = fixture(vec![template]);

        let err = f
            .engine
            .explode(&ExplodeRequest::new("empty_flow", "order", "PO-1"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoReachableNode(_)));

        let mut tx = f.store.begin().unwrap();
        assert!(tx.entity(1).unwrap().is_none());
    }

    #[test]
    fn test_task_fans_out_to_every_link() {
        let template = WorkflowTemplate::new("fan")
            .with_node(Node::start("start"))
            .with_node(Node::task("T").with_page("t_form"))
            .with_node(Node::task("X").with_page("x_form"))
            .with_node(Node::task("Y").with_page("y_form"))
            .with_link("start", "T")
            .with_link("T", "X")
            .with_link("T", "Y");
        let f = fixture(vec![template]);

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("fan", "order", "PO-1"))
            .unwrap();
        let t = task_for(&f.engine, entity_id, "T");
        f.engine.complete_task(t.id).unwrap();

        let mut ids = node_ids(&f.engine, entity_id);
        ids.sort();
        assert_eq!(ids, vec!["T", "X", "Y"]);
        assert_eq!(
            task_for(&f.engine, entity_id, "T").status,
            TaskStatus::Completed
        );
        assert!(wait_until(|| {
            f.notifier
                .updated
                .lock()
                .unwrap()
                .iter()
                .any(|(uuid, msg)| Some(uuid) == t.notification_uuid.as_ref() && msg == "Task Completed")
        }));
    }

    #[test]
    fn test_gateway_follows_all_matches() {
        let template = WorkflowTemplate::new("review")
            .with_node(Node::start("start"))
            .with_node(
                Node::gateway("G")
                    .with_route(RoutingEntry::when("status", "approved", "A"))
                    .with_route(RoutingEntry::when("status", "rejected", "B"))
                    .with_route(RoutingEntry::otherwise("C")),
            )
            .with_node(Node::task("A").with_page("a"))
            .with_node(Node::task("B").with_page("b"))
            .with_node(Node::task("C").with_page("c"))
            .with_link("start", "G");
        let f = fixture(vec![template]);

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("review", "order", "PO-1").with_value("status", "approved"))
            .unwrap();

        let mut ids = node_ids(&f.engine, entity_id);
        ids.sort();
        assert_eq!(ids, vec!["A", "C", "G"]);
        assert_eq!(
            task_for(&f.engine, entity_id, "G").status,
            TaskStatus::Completed
        );
        assert_eq!(
            task_for(&f.engine, entity_id, "A").process_data["status"],
            "approved"
        );
    }

    #[test]
    fn test_unmatched_gateway_after_human_task() {
        let f = fixture(vec![branching_template()]);
        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("branching", "order", "PO-1"))
            .unwrap();
        let a = task_for(&f.engine, entity_id, "A");

        let merged = f
            .engine
            .update_process_data(a.id, &data(json!({"flag": "x"})))
            .unwrap();
        assert_eq!(merged["flag"], "x");

        let err = f.engine.complete_task(a.id).unwrap_err();
        assert!(matches!(err, WorkflowError::NoRouteMatched { ref node, .. } if node == "B"));

        // The sibling branch still ran
        let c = task_for(&f.engine, entity_id, "C");
        assert_eq!(c.status, TaskStatus::Started);

        let b = task_for(&f.engine, entity_id, "B");
        assert_eq!(b.status, TaskStatus::ExecutionError);
        let history = f.engine.task_history(b.id).unwrap();
        assert_eq!(
            history.last().map(|h| h.action),
            Some(HistoryAction::ExecutionError)
        );
        assert!(history.last().unwrap().detail.contains("matched no routing entry"));
    }

    #[test]
    fn test_retry_reroutes_gateway() {
        let f = fixture(vec![branching_template()]);
        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("branching", "order", "PO-1"))
            .unwrap();
        let a = task_for(&f.engine, entity_id, "A");
        f.engine
            .update_process_data(a.id, &data(json!({"flag": "x"})))
            .unwrap();
        assert!(f.engine.complete_task(a.id).is_err());

        let b = task_for(&f.engine, entity_id, "B");
        f.engine
            .update_process_data(b.id, &data(json!({"flag": "e"})))
            .unwrap();
        f.engine.retry_task(b.id).unwrap();

        assert_eq!(
            task_for(&f.engine, entity_id, "B").status,
            TaskStatus::Completed
        );
        assert_eq!(
            task_for(&f.engine, entity_id, "E").status,
            TaskStatus::Started
        );

        let actions: Vec<HistoryAction> = f
            .engine
            .task_history(b.id)
            .unwrap()
            .into_iter()
            .map(|h| h.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                HistoryAction::Create,
                HistoryAction::Start,
                HistoryAction::ExecutionError,
                HistoryAction::UpdateData,
                HistoryAction::Retry,
                HistoryAction::Complete,
            ]
        );
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let f = fixture(vec![branching_template()]);
        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("branching", "order", "PO-1"))
            .unwrap();
        let a = task_for(&f.engine, entity_id, "A");

        assert!(matches!(
            f.engine.execute(a.id),
            Err(WorkflowError::InvalidTransition { from: TaskStatus::Started, .. })
        ));
        assert!(matches!(
            f.engine.retry_task(a.id),
            Err(WorkflowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.engine.complete_task(999),
            Err(WorkflowError::TaskNotFound(999))
        ));
    }

    fn handler_template(handler: &str) -> WorkflowTemplate {
        WorkflowTemplate::new("auto")
            .with_node(Node::start("start"))
            .with_node(Node::task("calc").with_handler(handler).with_data("rate", 2))
            .with_node(Node::task("review").with_page("review_form"))
            .with_link("start", "calc")
            .with_link("calc", "review")
    }

    #[test]
    fn test_handler_outputs_flow_to_successor() {
        let f = fixture(vec![handler_template("price")]);
        f.handlers.register("price", |data, _ctx| {
            let amount = data.get("amount").and_then(Value::as_i64).unwrap_or(0);
            let rate = data.get("rate").and_then(Value::as_i64).unwrap_or(1);
            Ok(vec![KeyValue::new("total", amount * rate)])
        });

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("auto", "order", "PO-1").with_value("amount", 50))
            .unwrap();

        let calc = task_for(&f.engine, entity_id, "calc");
        assert_eq!(calc.status, TaskStatus::Completed);
        assert_eq!(calc.process_data["total"], 100);
        assert!(calc.pre_task_data.get("total").is_none());

        let review = task_for(&f.engine, entity_id, "review");
        assert_eq!(review.status, TaskStatus::Started);
        assert_eq!(review.process_data["total"], 100);
    }

    #[test]
    fn test_handler_failure_marks_execution_error() {
        let f = fixture(vec![handler_template("price")]);
        f.handlers
            .register("price", |_, _| Err(HandlerError::Failed("rate service down".to_string())));

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("auto", "order", "PO-1"))
            .unwrap();

        let calc = task_for(&f.engine, entity_id, "calc");
        assert_eq!(calc.status, TaskStatus::ExecutionError);
        assert_eq!(node_ids(&f.engine, entity_id), vec!["calc"]);

        // Fixed handler, operator retry
        f.handlers
            .register("price", |_, _| Ok(vec![KeyValue::new("total", 1)]));
        f.engine.retry_task(calc.id).unwrap();
        assert_eq!(
            task_for(&f.engine, entity_id, "calc").status,
            TaskStatus::Completed
        );
        assert_eq!(
            task_for(&f.engine, entity_id, "review").status,
            TaskStatus::Started
        );
    }

    #[test]
    fn test_handler_timeout_and_panic() {
        let mut f = fixture(vec![handler_template("slow"), {
            let mut t = handler_template("boom");
            t.name = "auto_boom".to_string();
            t
        }]);
        f.engine.set_handler_timeout(Duration::from_millis(50));
        f.handlers.register("slow", |_, _| {
            thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        });
        f.handlers.register("boom", |_, _| panic!("bad input"));

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("auto", "order", "PO-1"))
            .unwrap();
        let calc = task_for(&f.engine, entity_id, "calc");
        assert_eq!(calc.status, TaskStatus::ExecutionError);
        let detail = f.engine.task_history(calc.id).unwrap().last().unwrap().detail.clone();
        assert!(detail.contains("timed out"));

        f.engine.set_handler_timeout(Duration::from_secs(5));
        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("auto_boom", "order", "PO-2"))
            .unwrap();
        let calc = task_for(&f.engine, entity_id, "calc");
        assert_eq!(calc.status, TaskStatus::ExecutionError);
        let err = f.engine.retry_task(calc.id).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::HandlerExecutionFailed {
                source: HandlerError::Panicked(_),
                ..
            }
        ));
    }

    #[test]
    fn test_end_to_end_completion() {
        let template = WorkflowTemplate::new("po")
            .with_node(Node::start("start"))
            .with_node(Node::task("approve").with_page("approve_form").with_user("alice"))
            .with_node(
                Node::gateway("route")
                    .with_route(RoutingEntry::when("decision", "yes", "ship"))
                    .with_route(RoutingEntry::when("decision", "no", "done")),
            )
            .with_node(Node::task("ship"))
            .with_node(Node::end("done"))
            .with_link("start", "approve")
            .with_link("approve", "route")
            .with_link("ship", "done");
        let f = fixture(vec![template]);
        f.store.add_user("alice").unwrap();

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("po", "order", "PO-9"))
            .unwrap();
        let approve = task_for(&f.engine, entity_id, "approve");
        assert_eq!(f.engine.task_assignments(approve.id).unwrap().len(), 1);
        assert_eq!(f.engine.inbox("alice").unwrap().len(), 1);

        f.engine
            .update_process_data(approve.id, &data(json!({"decision": "yes"})))
            .unwrap();
        f.engine.complete_task(approve.id).unwrap();

        let mut ids = node_ids(&f.engine, entity_id);
        ids.sort();
        assert_eq!(ids, vec!["approve", "done", "route", "ship"]);
        assert!(f
            .engine
            .tasks(entity_id)
            .unwrap()
            .iter()
            .all(|t| t.status == TaskStatus::Completed));

        f.engine.wait_pending();
        assert_eq!(
            f.engine.entity(entity_id).unwrap().status,
            EntityStatus::Completed
        );
        let completed_on = f.engine.entity(entity_id).unwrap().completed_on;
        assert!(completed_on.is_some());

        assert_eq!(
            f.engine.validate_entity(entity_id).unwrap(),
            CompletionOutcome::AlreadyCompleted
        );
        assert_eq!(f.engine.entity(entity_id).unwrap().completed_on, completed_on);
        assert!(f.engine.inbox("alice").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_end_branches_close_entity_once() {
        let template = WorkflowTemplate::new("parallel")
            .with_node(Node::start("start"))
            .with_node(Node::task("split"))
            .with_node(Node::task("left"))
            .with_node(Node::task("right"))
            .with_node(Node::end("end_left"))
            .with_node(Node::end("end_right"))
            .with_link("start", "split")
            .with_link("split", "left")
            .with_link("split", "right")
            .with_link("left", "end_left")
            .with_link("right", "end_right");
        let f = fixture(vec![template]);

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("parallel", "order", "PO-3"))
            .unwrap();

        f.engine.wait_pending();
        assert_eq!(
            f.engine.entity(entity_id).unwrap().status,
            EntityStatus::Completed
        );
        assert_eq!(f.engine.tasks(entity_id).unwrap().len(), 5);

        let outcomes: Vec<CompletionOutcome> = (0..4)
            .map(|_| {
                let engine = f.engine.clone();
                thread::spawn(move || engine.validate_entity(entity_id).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert!(outcomes
            .iter()
            .all(|o| *o == CompletionOutcome::AlreadyCompleted));
    }

    #[test]
    fn test_unresolved_assignments_are_skipped() {
        let template = WorkflowTemplate::new("assign")
            .with_node(Node::start("start"))
            .with_node(
                Node::task("T")
                    .with_page("form")
                    .with_role("ghost_role")
                    .with_user("carol"),
            )
            .with_link("start", "T");
        let f = fixture(vec![template]);
        let carol = f.store.add_user("carol").unwrap();

        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("assign", "order", "PO-4"))
            .unwrap();
        let t = task_for(&f.engine, entity_id, "T");
        assert_eq!(
            f.engine.task_assignments(t.id).unwrap(),
            vec![Assignee::User(carol)]
        );
    }

    #[test]
    fn test_running_entity_uses_snapshot() {
        let templates = Arc::new(MemoryTemplateStore::from_templates(vec![branching_template()]));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let engine = Engine::new(templates.clone(), store);

        let entity_id = engine
            .explode(&ExplodeRequest::new("branching", "order", "PO-5"))
            .unwrap();

        // Edit the stored template so A leads nowhere
        let mut edited = templates.find_default("branching").unwrap();
        edited.links.retain(|l| l.source != "A");
        templates.insert(edited);

        let a = task_for(&engine, entity_id, "A");
        engine
            .update_process_data(a.id, &data(json!({"flag": "d"})))
            .unwrap();
        engine.complete_task(a.id).unwrap();

        let mut ids = node_ids(&engine, entity_id);
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_wait_pending_closes_entity_after_end_node() {
        let template = WorkflowTemplate::new("short")
            .with_node(Node::start("start"))
            .with_node(Node::task("review").with_page("review_form"))
            .with_node(Node::end("finish"))
            .with_link("start", "review")
            .with_link("review", "finish");

        for run in 0..20 {
            let f = fixture(vec![template.clone()]);
            let entity_id = f
                .engine
                .explode(&ExplodeRequest::new("short", "order", format!("PO-{}", run)))
                .unwrap();
            let review = task_for(&f.engine, entity_id, "review");
            f.engine.complete_task(review.id).unwrap();

            f.engine.wait_pending();
            let entity = f.engine.entity(entity_id).unwrap();
            assert_eq!(entity.status, EntityStatus::Completed, "run {}", run);
            assert!(entity.completed_on.is_some());
        }
    }

    #[test]
    fn test_wait_pending_without_checks_returns() {
        let f = fixture(vec![branching_template()]);
        f.engine.wait_pending();
        f.engine
            .explode(&ExplodeRequest::new("branching", "order", "PO-6"))
            .unwrap();
        f.engine.wait_pending();
    }

    #[test]
    fn test_panicked_branch_marks_its_task() {
        let f = fixture(vec![branching_template()]);
        let entity_id = f
            .engine
            .explode(&ExplodeRequest::new("branching", "order", "PO-7"))
            .unwrap();
        let a = task_for(&f.engine, entity_id, "A");
        let watermark = f.engine.last_task_id(entity_id).unwrap();
        assert_eq!(watermark, a.id);

        let engine = f.engine.clone();
        let handle: JoinHandle<Result<()>> = thread::spawn(move || {
            let entity = engine.entity(entity_id).unwrap();
            let template = entity.template().unwrap();
            let node = template.node("B").unwrap().clone();

            let mut tx = engine.store.begin().unwrap();
            engine
                .explode_node(tx.as_mut(), &node, &entity, &ProcessData::new())
                .unwrap();
            tx.commit().unwrap();
            panic!("branch died after writing its task");
        });

        let err = f
            .engine
            .join_branches(entity_id, watermark, vec![("B".to_string(), handle)])
            .unwrap_err();
        assert!(matches!(err, WorkflowError::BranchPanicked(ref node) if node == "B"));

        let b = task_for(&f.engine, entity_id, "B");
        assert_eq!(b.status, TaskStatus::ExecutionError);
        let history = f.engine.task_history(b.id).unwrap();
        assert_eq!(
            history.last().unwrap().action,
            HistoryAction::ExecutionError
        );

        // The human task that existed before the fan-out is untouched
        assert_eq!(task_for(&f.engine, entity_id, "A").status, TaskStatus::Started);
    }
}
