//! Entity identity and watch events

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::Resource;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Bounds every resource type handled by the dispatcher has to satisfy
pub trait WatchedResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
}

impl<K> WatchedResource for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
}

/// Stable identity of one watched resource instance
///
/// Used as the key of both the event queue and the lock provider. Two
/// objects with the same namespace and name but different uids (delete
/// followed by re-create) are distinct entities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    namespace: Option<String>,
    name: String,
    uid: Option<String>,
}

impl EntityId {
    pub fn new(namespace: Option<&str>, name: &str, uid: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            uid: uid.map(str::to_string),
        }
    }

    /// Derive the identity from object metadata
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .ok_or(Error::MissingObjectKey("metadata.name"))?;
        Ok(Self::new(meta.namespace.as_deref(), name, meta.uid.as_deref()))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Kind of change reported by the watch stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEventKind::Added => write!(f, "Added"),
            WatchEventKind::Modified => write!(f, "Modified"),
            WatchEventKind::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A change notification for one entity, plus its retry attempt
#[derive(Debug)]
pub struct WatchEvent<K> {
    pub id: EntityId,
    pub object: Arc<K>,
    pub kind: WatchEventKind,
    /// Number of failed dispatches so far; 0 for fresh events
    pub attempt: u32,
    pub arrived_at: DateTime<Utc>,
}

// Manual impl: `K` itself does not need to be `Clone`.
impl<K> Clone for WatchEvent<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            object: Arc::clone(&self.object),
            kind: self.kind,
            attempt: self.attempt,
            arrived_at: self.arrived_at,
        }
    }
}

impl<K: Resource> WatchEvent<K> {
    pub fn new(object: K, kind: WatchEventKind) -> Result<Self> {
        Self::from_arc(Arc::new(object), kind)
    }

    pub fn from_arc(object: Arc<K>, kind: WatchEventKind) -> Result<Self> {
        Ok(Self {
            id: EntityId::from_resource(object.as_ref())?,
            object,
            kind,
            attempt: 0,
            arrived_at: Utc::now(),
        })
    }

    /// True for physical deletions and for objects marked for deletion
    pub fn is_deletion(&self) -> bool {
        self.kind == WatchEventKind::Deleted || self.object.meta().deletion_timestamp.is_some()
    }
}

impl<K> WatchEvent<K> {
    /// The same event, scheduled as the next retry attempt
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt = self.attempt.saturating_add(1);
        next
    }
}
