//! Debounced, delayed dispatch of watch events
//!
//! Each entity has at most one entry. An entry is a spawned task that sleeps
//! until its fire time, runs the handler, and leaves the table once the
//! handler returned. Events enqueued while the handler runs collapse into a
//! single follow-up that is armed when it returns; when several collapse,
//! the longest delay wins so a retry backoff is never shortened by watch
//! traffic. A dequeue cancels a waiting entry or the follow-up of a running
//! one, never the running invocation itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::backoff::RequeuePolicy;
use super::entity::{EntityId, WatchEvent, WatchEventKind};
use crate::error::Result;

/// Callback invoked when an entry fires
pub type QueueHandler<K> =
    Arc<dyn Fn(WatchEvent<K>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct WatchEventQueue<K> {
    shared: Arc<QueueShared<K>>,
}

impl<K> Clone for WatchEventQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct QueueShared<K> {
    entries: Mutex<HashMap<EntityId, QueueEntry<K>>>,
    policy: RequeuePolicy,
    handler: QueueHandler<K>,
    next_ticket: AtomicU64,
}

/// The live entry of one entity
struct QueueEntry<K> {
    /// Distinguishes this entry from later ones for the same entity
    ticket: u64,
    kind: WatchEventKind,
    state: EntryState<K>,
}

enum EntryState<K> {
    /// Waiting for the timer
    Scheduled {
        token: CancellationToken,
        fire_at: Instant,
    },
    /// Handler executing; `rerun` is armed once it returns
    Running {
        rerun: Option<(WatchEvent<K>, Duration)>,
    },
}

impl<K> QueueEntry<K> {
    /// Whether a handler invocation is still ahead for this entry
    fn is_pending(&self) -> bool {
        match &self.state {
            EntryState::Scheduled { .. } => true,
            EntryState::Running { rerun } => rerun.is_some(),
        }
    }
}

impl<K: Send + Sync + 'static> WatchEventQueue<K> {
    pub fn new(policy: RequeuePolicy, handler: QueueHandler<K>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                entries: Mutex::new(HashMap::new()),
                policy,
                handler,
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `event`, unless the entity already has something scheduled
    ///
    /// Without an explicit `delay` the event waits according to its attempt
    /// count. While the entity's handler is running the event becomes its
    /// follow-up instead. Returns whether a new fire was scheduled; `false`
    /// means the event was merged into an existing one. Must be called from
    /// within a tokio runtime.
    pub fn enqueue(&self, mut event: WatchEvent<K>, delay: Option<Duration>) -> bool {
        let delay = delay.unwrap_or_else(|| self.shared.policy.delay(event.attempt));
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        let mut entries = self.shared.lock_entries();
        if let Some(existing) = entries.get_mut(&event.id) {
            let EntryState::Running { rerun } = &mut existing.state else {
                trace!(
                    entity = %event.id,
                    kind = %event.kind,
                    scheduled_kind = %existing.kind,
                    "Entity already queued, keeping existing schedule"
                );
                return false;
            };
            let created = rerun.is_none();
            if let Some((pending, pending_delay)) = rerun.as_mut() {
                // the attempt count survives whichever event is kept
                event.attempt = event.attempt.max(pending.attempt);
                if *pending_delay > delay {
                    pending.attempt = event.attempt;
                    trace!(entity = %event.id, "Longer follow-up already pending");
                    return false;
                }
            }
            debug!(
                entity = %event.id,
                kind = %event.kind,
                attempt = event.attempt,
                delay_ms,
                "Event queued behind running dispatch"
            );
            *rerun = Some((event, delay));
            return created;
        }

        let token = CancellationToken::new();
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            event.id.clone(),
            QueueEntry {
                ticket,
                kind: event.kind,
                state: EntryState::Scheduled {
                    token: token.clone(),
                    fire_at: Instant::now() + delay,
                },
            },
        );
        drop(entries);

        debug!(
            entity = %event.id,
            kind = %event.kind,
            attempt = event.attempt,
            delay_ms,
            "Event queued"
        );
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.run_entry(event, ticket, token, delay).await });
        true
    }

    /// Cancel the pending fire for `id`, if any
    ///
    /// A running handler is not affected; only its follow-up is dropped.
    pub fn dequeue(&self, id: &EntityId) -> bool {
        let mut entries = self.shared.lock_entries();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        match &mut entry.state {
            EntryState::Running { rerun } => {
                let dropped = rerun.take().is_some();
                if dropped {
                    debug!(entity = %id, "Follow-up of running dispatch cancelled");
                }
                dropped
            }
            EntryState::Scheduled { token, .. } => {
                token.cancel();
                entries.remove(id);
                debug!(entity = %id, "Queued event cancelled");
                true
            }
        }
    }

    /// Cancel every pending fire
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        self.shared.lock_entries().retain(|_, entry| match &mut entry.state {
            EntryState::Scheduled { token, .. } => {
                token.cancel();
                dropped += 1;
                false
            }
            EntryState::Running { rerun } => {
                if rerun.take().is_some() {
                    dropped += 1;
                }
                true
            }
        });
        if dropped > 0 {
            debug!(count = dropped, "Event queue cleared");
        }
        dropped
    }

    /// Whether a fire for `id` is still ahead
    pub fn contains(&self, id: &EntityId) -> bool {
        self.shared
            .lock_entries()
            .get(id)
            .is_some_and(QueueEntry::is_pending)
    }

    /// Whether the handler for `id` is executing right now
    pub fn is_running(&self, id: &EntityId) -> bool {
        matches!(
            self.shared.lock_entries().get(id).map(|e| &e.state),
            Some(EntryState::Running { .. })
        )
    }

    /// When the next fire for `id` is due
    ///
    /// A follow-up counts from now, since it is armed as soon as the running
    /// handler returns.
    pub fn scheduled_at(&self, id: &EntityId) -> Option<Instant> {
        match &self.shared.lock_entries().get(id)?.state {
            EntryState::Scheduled { fire_at, .. } => Some(*fire_at),
            EntryState::Running { rerun } => rerun.as_ref().map(|(_, d)| Instant::now() + *d),
        }
    }

    pub fn len(&self) -> usize {
        self.shared
            .lock_entries()
            .values()
            .filter(|e| e.is_pending())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> QueueShared<K> {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<EntityId, QueueEntry<K>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_entry(
        &self,
        mut event: WatchEvent<K>,
        ticket: u64,
        mut token: CancellationToken,
        mut delay: Duration,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(entity = %event.id, "Queue entry cancelled before firing");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.start(&event.id, ticket) {
                // dequeued between the timer firing and this point
                return;
            }

            let id = event.id.clone();
            if let Err(e) = (self.handler)(event).await {
                // Handlers convert failures into retries themselves.
                error!(entity = %id, error = %e, "Queue handler returned an error, not retrying");
            }

            match self.finish(&id, ticket) {
                Some((next, next_delay, next_token)) => {
                    event = next;
                    delay = next_delay;
                    token = next_token;
                }
                None => return,
            }
        }
    }

    /// Move the entry identified by `ticket` from scheduled to running
    fn start(&self, id: &EntityId, ticket: u64) -> bool {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(id).filter(|e| e.ticket == ticket) else {
            return false;
        };
        let live = matches!(
            &entry.state,
            EntryState::Scheduled { token, .. } if !token.is_cancelled()
        );
        if live {
            entry.state = EntryState::Running { rerun: None };
        }
        live
    }

    /// Arm the follow-up of a finished run, or drop the entry
    fn finish(
        &self,
        id: &EntityId,
        ticket: u64,
    ) -> Option<(WatchEvent<K>, Duration, CancellationToken)> {
        let mut entries = self.lock_entries();
        let entry = entries.get_mut(id).filter(|e| e.ticket == ticket)?;
        let rerun = match &mut entry.state {
            EntryState::Running { rerun } => rerun.take(),
            EntryState::Scheduled { .. } => None,
        };
        let Some((event, delay)) = rerun else {
            entries.remove(id);
            return None;
        };

        let token = CancellationToken::new();
        entry.kind = event.kind;
        entry.state = EntryState::Scheduled {
            token: token.clone(),
            fire_at: Instant::now() + delay,
        };
        trace!(entity = %id, "Follow-up armed");
        Some((event, delay, token))
    }
}
