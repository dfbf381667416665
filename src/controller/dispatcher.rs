//! Reconciliation dispatcher
//!
//! Ties the watch stream, the event queue, the entity locks, finalizers and
//! leadership together. Per entity the flow is:
//!
//! ```text
//! Idle -> Queued -> Running -> Idle
//!                           -> Queued (retry with backoff)
//! Running(finalizing) -> Idle (markers removed) | Queued (retry)
//! ```
//!
//! Failures of one entity only ever schedule a retry for that entity; the
//! watch loop keeps going for everything else.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{FutureExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backoff::RequeuePolicy;
use super::client::ResourceClient;
use super::entity::{EntityId, WatchEvent, WatchEventKind, WatchedResource};
use super::finalizers::{Finalizer, FinalizerSet};
use super::lock::EntityLockProvider;
use super::queue::{QueueHandler, WatchEventQueue};
use super::status::{EntityStatus, StatusHook, StatusRegistry};
use crate::config::OperatorSettings;
use crate::error::{Error, Result};
use crate::leader::LeaderState;

/// User reconcile logic for one resource type
#[async_trait]
pub trait Controller<K: Send + Sync + 'static>: Send + Sync + 'static {
    /// Converge the cluster towards the desired state of `obj`
    async fn reconcile(&self, obj: Arc<K>) -> Result<()>;

    /// Called once the object is physically gone and no finalizer was pending
    async fn deleted(&self, _obj: Arc<K>) -> Result<()> {
        Ok(())
    }
}

/// Behaviour switches for a dispatcher
#[derive(Clone)]
pub struct DispatcherOptions {
    pub policy: RequeuePolicy,
    pub auto_attach_finalizers: bool,
    pub auto_detach_finalizers: bool,
    pub status_hooks: Vec<Arc<dyn StatusHook>>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self::from(&OperatorSettings::default())
    }
}

impl From<&OperatorSettings> for DispatcherOptions {
    fn from(settings: &OperatorSettings) -> Self {
        Self {
            policy: RequeuePolicy::from(settings),
            auto_attach_finalizers: settings.auto_attach_finalizers,
            auto_detach_finalizers: settings.auto_detach_finalizers,
            status_hooks: Vec::new(),
        }
    }
}

/// What a fired event turns into
enum Dispatch<K> {
    Reconcile,
    Finalize(Vec<Arc<dyn Finalizer<K>>>),
    Deleted,
    /// Marked for deletion, but none of our finalizers is pending
    AwaitDeletion,
}

pub struct ReconciliationDispatcher<K: WatchedResource> {
    inner: Arc<DispatcherInner<K>>,
}

impl<K: WatchedResource> Clone for ReconciliationDispatcher<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DispatcherInner<K: WatchedResource> {
    controller: Arc<dyn Controller<K>>,
    finalizers: FinalizerSet<K>,
    client: Arc<dyn ResourceClient<K>>,
    queue: WatchEventQueue<K>,
    locks: EntityLockProvider,
    leader: LeaderState,
    options: DispatcherOptions,
    /// Most recent object and kind seen per entity
    latest: Mutex<HashMap<EntityId, (Arc<K>, WatchEventKind)>>,
    status: StatusRegistry,
}

impl<K: WatchedResource> ReconciliationDispatcher<K> {
    pub fn new(
        controller: Arc<dyn Controller<K>>,
        finalizers: FinalizerSet<K>,
        client: Arc<dyn ResourceClient<K>>,
        locks: EntityLockProvider,
        leader: LeaderState,
        options: DispatcherOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<DispatcherInner<K>>| {
            let weak = weak.clone();
            let handler: QueueHandler<K> = Arc::new(move |event: WatchEvent<K>| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.fire(event).await,
                        None => Ok(()),
                    }
                }
                .boxed()
            });
            DispatcherInner {
                controller,
                finalizers,
                client,
                queue: WatchEventQueue::new(options.policy, handler),
                locks,
                leader,
                options,
                latest: Mutex::new(HashMap::new()),
                status: StatusRegistry::new(),
            }
        });
        Self { inner }
    }

    /// Consume `events` until the stream ends or `term` is cancelled
    ///
    /// On cancellation every scheduled entry is dropped together with the
    /// cached objects and statuses; a new term starts from a fresh watch.
    pub async fn run<S>(&self, events: S, term: CancellationToken)
    where
        S: Stream<Item = WatchEvent<K>> + Send,
    {
        futures::pin_mut!(events);
        loop {
            tokio::select! {
                biased;
                _ = term.cancelled() => {
                    let dropped = self.inner.queue.clear();
                    let forgotten = self.inner.reset();
                    info!(dropped, forgotten, "Leadership lost, dispatch stopped");
                    return;
                }
                next = events.next() => match next {
                    Some(event) => {
                        self.handle_event(event);
                    }
                    None => {
                        debug!("Watch stream ended");
                        return;
                    }
                },
            }
        }
    }

    /// Feed one watch event; returns whether it was scheduled
    ///
    /// Events arriving while this instance is not the leader are dropped;
    /// the watch relist on the next term delivers them again.
    pub fn handle_event(&self, event: WatchEvent<K>) -> bool {
        if !self.inner.leader.is_leader() {
            debug!(entity = %event.id, kind = %event.kind, "Not leader, dropping event");
            return false;
        }
        self.inner.remember(&event);
        self.inner.queue.enqueue(event, None)
    }

    /// Schedule an event directly, skipping the leadership check
    pub fn enqueue(&self, event: WatchEvent<K>, delay: Option<Duration>) -> bool {
        self.inner.queue.enqueue(event, delay)
    }

    pub fn dequeue(&self, id: &EntityId) -> bool {
        self.inner.queue.dequeue(id)
    }

    pub fn is_queued(&self, id: &EntityId) -> bool {
        self.inner.queue.contains(id)
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Latest dispatch status of `id`
    pub fn status(&self, id: &EntityId) -> Option<EntityStatus> {
        self.inner.status.get(id)
    }

    pub fn retrying(&self) -> Vec<(EntityId, EntityStatus)> {
        self.inner.status.retrying()
    }

    /// Number of entities with a cached object
    pub fn tracked(&self) -> usize {
        self.inner.latest().len()
    }

    pub fn locks(&self) -> &EntityLockProvider {
        &self.inner.locks
    }

    /// Stop scheduling: close the locks and drop queued entries
    ///
    /// Callbacks already running finish normally.
    pub fn shutdown(&self) {
        self.inner.locks.close();
        let dropped = self.inner.queue.clear();
        info!(dropped, "Dispatcher shut down");
    }
}

impl<K: WatchedResource> DispatcherInner<K> {
    fn latest(&self) -> MutexGuard<'_, HashMap<EntityId, (Arc<K>, WatchEventKind)>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, event: &WatchEvent<K>) {
        self.latest()
            .insert(event.id.clone(), (Arc::clone(&event.object), event.kind));
    }

    /// Swap in the newest object, since debouncing keeps the first schedule
    fn refresh(&self, mut event: WatchEvent<K>) -> WatchEvent<K> {
        if let Some((object, kind)) = self.latest().get(&event.id) {
            event.object = Arc::clone(object);
            event.kind = *kind;
        }
        event
    }

    fn classify(&self, event: &WatchEvent<K>) -> Dispatch<K> {
        if !event.is_deletion() {
            return Dispatch::Reconcile;
        }
        let pending = self.finalizers.pending(&event.object);
        if !pending.is_empty() {
            Dispatch::Finalize(pending)
        } else if event.kind == WatchEventKind::Deleted {
            Dispatch::Deleted
        } else {
            Dispatch::AwaitDeletion
        }
    }

    /// Queue handler: run one event under the entity lock
    #[instrument(skip(self, event), fields(entity = %event.id, attempt = event.attempt))]
    async fn fire(&self, event: WatchEvent<K>) -> Result<()> {
        let term = self.leader.term();
        if term.is_cancelled() {
            debug!("Not leader, skipping dispatch");
            return Ok(());
        }

        let event = self.refresh(event);
        let handle = tokio::select! {
            biased;
            _ = term.cancelled() => {
                debug!("Leadership lost while waiting for entity lock");
                return Ok(());
            }
            acquired = self.locks.acquire(&event.id) => match acquired {
                Ok(handle) => handle,
                Err(Error::LockProviderClosed) => {
                    debug!("Lock provider closed, dropping dispatch");
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };
        if term.is_cancelled() {
            return Ok(());
        }

        // Deletions and completed finalization end the entity's tracking.
        let (outcome, finished) = match self.classify(&event) {
            Dispatch::Reconcile => (self.reconcile(&event).await, false),
            Dispatch::Finalize(pending) => (self.finalize(&event, pending).await, true),
            Dispatch::Deleted => {
                debug!("Resource deleted");
                let deleted = self.controller.deleted(Arc::clone(&event.object)).await;
                (deleted, true)
            }
            Dispatch::AwaitDeletion => {
                debug!("Resource is being deleted by someone else, nothing to do");
                (Ok(()), false)
            }
        };
        drop(handle);

        if term.is_cancelled() {
            // This instance is no longer leader; the new leader owns the retry.
            debug!("Leadership lost during dispatch, result discarded");
            return Ok(());
        }

        match outcome {
            Ok(()) if finished => self.forget(&event.id),
            Ok(()) => self.settle(&event),
            Err(e) => self.retry(&event, e),
        }
        Ok(())
    }

    async fn reconcile(&self, event: &WatchEvent<K>) -> Result<()> {
        let mut object = Arc::clone(&event.object);

        if self.options.auto_attach_finalizers {
            let missing = self.finalizers.missing(&object);
            if !missing.is_empty() {
                let updated = self.client.add_finalizers(&object, &missing).await?;
                object = Arc::new(updated);
                self.latest()
                    .insert(event.id.clone(), (Arc::clone(&object), event.kind));
            }
        }

        debug!(kind = %event.kind, "Reconciling");
        self.controller.reconcile(object).await
    }

    async fn finalize(
        &self,
        event: &WatchEvent<K>,
        pending: Vec<Arc<dyn Finalizer<K>>>,
    ) -> Result<()> {
        let mut names = Vec::with_capacity(pending.len());
        for finalizer in pending {
            let name = finalizer.name().to_string();
            debug!(finalizer = %name, "Running finalizer");
            finalizer
                .finalize(Arc::clone(&event.object))
                .await
                .map_err(|e| Error::FinalizerError {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
            names.push(name);
        }

        if self.options.auto_detach_finalizers {
            self.client.remove_finalizers(&event.object, &names).await?;
        }
        info!(finalizers = ?names, "Finalizers completed");
        self.queue.dequeue(&event.id);
        Ok(())
    }

    fn settle(&self, event: &WatchEvent<K>) {
        if event.attempt > 0 {
            info!(attempts = event.attempt, "Dispatch succeeded after retries");
        }
        // A newer event may already be waiting in the queue.
        self.publish(
            &event.id,
            EntityStatus {
                attempt: 0,
                next_fire_at: self.next_fire_at(&event.id),
                last_error: None,
                error_kind: None,
            },
        );
    }

    /// Requeue after a failure
    ///
    /// Runs while the queue entry is still running, so the retry becomes its
    /// follow-up and events that arrived meanwhile merge into it.
    fn retry(&self, event: &WatchEvent<K>, error: Error) {
        let next = event.next_attempt();
        let attempt = next.attempt;
        let delay = self.options.policy.delay(attempt);
        warn!(
            kind = %event.kind,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Dispatch failed, requeueing"
        );

        self.queue.enqueue(next, Some(delay));
        self.publish(
            &event.id,
            EntityStatus {
                attempt,
                next_fire_at: self.next_fire_at(&event.id),
                last_error: Some(error.to_string()),
                error_kind: Some(error.kind()),
            },
        );
    }

    /// Wall-clock time of the next scheduled fire for `id`
    fn next_fire_at(&self, id: &EntityId) -> Option<DateTime<Utc>> {
        self.queue.scheduled_at(id).map(|at| {
            let wait = at.saturating_duration_since(tokio::time::Instant::now());
            Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default()
        })
    }

    fn publish(&self, id: &EntityId, status: EntityStatus) {
        self.status.status_changed(id, &status);
        for hook in &self.options.status_hooks {
            hook.status_changed(id, &status);
        }
    }

    fn forget(&self, id: &EntityId) {
        self.latest().remove(id);
        self.status.entity_forgotten(id);
        for hook in &self.options.status_hooks {
            hook.entity_forgotten(id);
        }
    }

    /// Forget every entity; returns how many were tracked
    ///
    /// Deletions seen as a follower never reach `forget`, so a term starts
    /// with empty caches and rebuilds them from the relist.
    fn reset(&self) -> usize {
        let mut ids: HashSet<EntityId> = self.latest().drain().map(|(id, _)| id).collect();
        ids.extend(self.status.ids());
        for id in &ids {
            self.forget(id);
        }
        ids.len()
    }
}
