//! Per-entity asynchronous locking
//!
//! Every entity gets its own single-permit semaphore for as long as someone
//! holds or waits for it. Idle semaphores are kept in a bounded pool so that
//! operators watching many resources do not allocate one per dispatch.
//!
//! Waiters for the same entity are served in arrival order: tokio's
//! `Semaphore` queues `acquire` calls FIFO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::entity::EntityId;
use crate::config::DEFAULT_LOCK_POOL_CAPACITY;
use crate::error::{Error, Result};

/// Hands out exclusive per-entity lock handles
///
/// Cloning is cheap and clones share the same lock table.
#[derive(Clone)]
pub struct EntityLockProvider {
    shared: Arc<LockTable>,
}

struct LockTable {
    state: Mutex<LockState>,
    capacity: usize,
    closed: AtomicBool,
}

#[derive(Default)]
struct LockState {
    locks: HashMap<EntityId, LockSlot>,
    pool: Vec<Arc<Semaphore>>,
}

struct LockSlot {
    semaphore: Arc<Semaphore>,
    /// Holders plus waiters
    users: usize,
}

impl Default for EntityLockProvider {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_POOL_CAPACITY)
    }
}

impl EntityLockProvider {
    /// Create a provider keeping at most `pool_capacity` idle primitives
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            shared: Arc::new(LockTable {
                state: Mutex::new(LockState::default()),
                capacity: pool_capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Wait until `id` is exclusively owned by the caller
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue without leaking the entity's slot.
    pub async fn acquire(&self, id: &EntityId) -> Result<LockHandle> {
        if self.is_closed() {
            return Err(Error::LockProviderClosed);
        }

        let semaphore = self.shared.check_out(id);
        let mut handle = LockHandle {
            id: id.clone(),
            permit: None,
            table: Arc::clone(&self.shared),
        };

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::LockProviderClosed)?;
        handle.permit = Some(permit);
        trace!(entity = %id, "Entity lock acquired");
        Ok(handle)
    }

    /// Release a handle; equivalent to dropping it
    pub fn release(&self, handle: LockHandle) {
        drop(handle);
    }

    /// Refuse new acquisitions; handles already issued stay valid
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.lock_state().pool.clear();
            debug!("Entity lock provider closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of idle primitives waiting for reuse
    pub fn pooled(&self) -> usize {
        self.shared.lock_state().pool.len()
    }

    /// Number of entities currently held or waited for
    pub fn active(&self) -> usize {
        self.shared.lock_state().locks.len()
    }
}

impl LockTable {
    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new user of `id` and return its primitive
    fn check_out(&self, id: &EntityId) -> Arc<Semaphore> {
        let mut state = self.lock_state();
        if let Some(slot) = state.locks.get_mut(id) {
            slot.users += 1;
            return Arc::clone(&slot.semaphore);
        }

        let semaphore = state
            .pool
            .pop()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)));
        state.locks.insert(
            id.clone(),
            LockSlot {
                semaphore: Arc::clone(&semaphore),
                users: 1,
            },
        );
        semaphore
    }

    /// Drop one user of `id`; the last one frees or pools the primitive
    fn check_in(&self, id: &EntityId) {
        let mut state = self.lock_state();
        let Some(slot) = state.locks.get_mut(id) else {
            return;
        };
        slot.users = slot.users.saturating_sub(1);
        if slot.users > 0 {
            return;
        }

        let Some(slot) = state.locks.remove(id) else {
            return;
        };
        // Only a fully released primitive may be handed to another entity.
        if slot.semaphore.available_permits() == 1
            && state.pool.len() < self.capacity
            && !self.closed.load(Ordering::SeqCst)
        {
            state.pool.push(slot.semaphore);
        }
    }
}

/// Exclusive ownership of one entity; released on drop
pub struct LockHandle {
    id: EntityId,
    permit: Option<OwnedSemaphorePermit>,
    table: Arc<LockTable>,
}

impl LockHandle {
    pub fn entity(&self) -> &EntityId {
        &self.id
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // Return the permit before the slot so the primitive is back at full
        // availability when check_in decides whether to pool it.
        drop(self.permit.take());
        self.table.check_in(&self.id);
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("id", &self.id)
            .field("held", &self.permit.is_some())
            .finish()
    }
}
