//! Notification Dispatch
//!
//! Human tasks announce themselves through an external notification
//! service. Delivery is best-effort: the engine mints the notification UUID
//! and stores it on the task row before commit, then sends on a detached
//! thread and only logs failures.

use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

/// Error type for notification delivery
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("unknown notification '{0}'")]
    UnknownUuid(String),
}

/// Payload sent when a human task is created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub uuid: String,
    pub entity_id: i64,
    pub entity_name: String,
    pub template_uuid: String,
    pub task_id: i64,
    pub node_id: String,
    pub page: Option<String>,
    /// Resolved role names
    pub roles: Vec<String>,
    /// Resolved user names
    pub users: Vec<String>,
}

impl Notification {
    /// Returns true if nobody would receive this notification.
    pub fn has_no_recipients(&self) -> bool {
        self.roles.is_empty() && self.users.is_empty()
    }
}

/// External notification service.
pub trait Notifier: Send + Sync {
    fn create(&self, payload: &Notification, actor: &str) -> Result<(), NotifyError>;
    fn update_by_uuid(&self, uuid: &str, actor: &str, message: &str) -> Result<(), NotifyError>;
}

/// Notifier that only writes to the log; the default when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn create(&self, payload: &Notification, actor: &str) -> Result<(), NotifyError> {
        info!(
            "Notification {} for task {} ({}) by {}: roles={:?} users={:?}",
            payload.uuid, payload.task_id, payload.node_id, actor, payload.roles, payload.users
        );
        Ok(())
    }

    fn update_by_uuid(&self, uuid: &str, actor: &str, message: &str) -> Result<(), NotifyError> {
        info!("Notification {} updated by {}: {}", uuid, actor, message);
        Ok(())
    }
}

/// Sends a creation notification on a detached thread.
pub fn dispatch_create(notifier: Arc<dyn Notifier>, payload: Notification, actor: String) {
    thread::spawn(move || {
        if payload.has_no_recipients() {
            debug!("Notification {} has no recipients", payload.uuid);
        }
        if let Err(e) = notifier.create(&payload, &actor) {
            warn!("Failed to send notification {}: {}", payload.uuid, e);
        }
    });
}

/// Sends a notification update on a detached thread.
pub fn dispatch_update(notifier: Arc<dyn Notifier>, uuid: String, actor: String, message: String) {
    thread::spawn(move || {
        if let Err(e) = notifier.update_by_uuid(&uuid, &actor, &message) {
            warn!("Failed to update notification {}: {}", uuid, e);
        }
    });
}
