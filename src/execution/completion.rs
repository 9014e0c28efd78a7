//! Completion Validation
//!
//! Closes a workflow entity once every one of its tasks is completed.

use chrono::Utc;
use log::{debug, info};

use crate::error::{Result, WorkflowError};
use crate::store::{EntityStatus, StoreTx};

/// Result of one completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Some tasks are not completed yet; nothing was written.
    Pending { remaining: u64 },
    /// This call closed the entity.
    Completed,
    /// The entity had already been closed by an earlier check.
    AlreadyCompleted,
}

impl CompletionOutcome {
    /// Returns true if the entity is completed, whoever closed it.
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::Pending { .. })
    }
}

/// Checks the entity and marks it completed if no task remains open.
///
/// The caller owns the transaction and commits it.
pub fn validate_and_complete(tx: &mut dyn StoreTx, entity_id: i64) -> Result<CompletionOutcome> {
    let entity = tx
        .entity(entity_id)?
        .ok_or(WorkflowError::EntityNotFound(entity_id))?;

    if entity.status == EntityStatus::Completed {
        debug!("Entity {} already completed", entity_id);
        return Ok(CompletionOutcome::AlreadyCompleted);
    }

    let remaining = tx.count_incomplete_tasks(entity_id)?;
    if remaining > 0 {
        debug!("Entity {} has {} open tasks", entity_id, remaining);
        return Ok(CompletionOutcome::Pending { remaining });
    }

    if tx.complete_entity(entity_id, Utc::now())? {
        info!("Workflow entity {} completed", entity_id);
        Ok(CompletionOutcome::Completed)
    } else {
        Ok(CompletionOutcome::AlreadyCompleted)
    }
}
