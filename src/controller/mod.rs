//! Controller module: the reconciliation core
//! This module contains the event queue, per-entity locking, finalizer
//! handling and the dispatcher that ties them to the watch stream.

pub mod backoff;
pub mod client;
mod dispatcher;
#[cfg(test)]
mod dispatcher_test;
pub mod entity;
pub mod finalizers;
pub mod lock;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod queue;
pub mod source;
pub mod status;

pub use backoff::{requeue_delay, RequeuePolicy};
pub use client::{KubeResourceClient, ResourceClient};
pub use dispatcher::{Controller, DispatcherOptions, ReconciliationDispatcher};
pub use entity::{EntityId, WatchEvent, WatchEventKind, WatchedResource};
pub use finalizers::{has_finalizer, Finalizer, FinalizerSet};
pub use lock::{EntityLockProvider, LockHandle};
pub use queue::{QueueHandler, WatchEventQueue};
pub use source::{watch_events, EventClassifier};
pub use status::{EntityStatus, StatusHook, StatusRegistry};
