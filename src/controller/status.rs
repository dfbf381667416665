//! Per-entity dispatch status
//!
//! The dispatcher reports attempt count, next retry time and last error for
//! every entity it touches. Status writers and metrics plug in through
//! [`StatusHook`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::entity::EntityId;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityStatus {
    /// Consecutive failed dispatches; 0 once the entity settled
    pub attempt: u32,
    /// When the pending retry fires, if one is scheduled
    pub next_fire_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// `Error::kind()` of the last failure
    pub error_kind: Option<&'static str>,
}

impl EntityStatus {
    pub fn is_retrying(&self) -> bool {
        self.attempt > 0
    }
}

/// Receives status changes from a dispatcher
pub trait StatusHook: Send + Sync {
    fn status_changed(&self, id: &EntityId, status: &EntityStatus);

    /// The entity was deleted or finalized and will not be reported again
    fn entity_forgotten(&self, _id: &EntityId) {}
}

/// Queryable snapshot of the latest status per entity
#[derive(Default)]
pub struct StatusRegistry {
    entries: Mutex<HashMap<EntityId, EntityStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EntityId) -> Option<EntityStatus> {
        self.lock().get(id).cloned()
    }

    /// Entities that currently have at least one failed attempt
    pub fn retrying(&self) -> Vec<(EntityId, EntityStatus)> {
        let mut retrying: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.is_retrying())
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        retrying.sort_by(|a, b| a.0.cmp(&b.0));
        retrying
    }

    /// Every entity with a recorded status
    pub fn ids(&self) -> Vec<EntityId> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityId, EntityStatus>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatusHook for StatusRegistry {
    fn status_changed(&self, id: &EntityId, status: &EntityStatus) {
        self.lock().insert(id.clone(), status.clone());
    }

    fn entity_forgotten(&self, id: &EntityId) {
        self.lock().remove(id);
    }
}
