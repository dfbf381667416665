//! Watch stream adapter
//!
//! Turns the kube watcher into a stream of classified [`WatchEvent`]s. kube
//! does not distinguish additions from modifications, so objects are tracked
//! by identity to tell the first sighting apart from later updates. A relist
//! does not report objects that vanished while the watch was down; those are
//! emitted as deletions once the relist completes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{stream, Stream, StreamExt};
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
};
use tracing::{debug, warn};

use super::entity::{EntityId, WatchEvent, WatchEventKind, WatchedResource};
use crate::error::Error;

/// Classifies raw watcher events into Added / Modified / Deleted
#[derive(Debug)]
pub struct EventClassifier<K> {
    /// Last object seen per entity
    known: HashMap<EntityId, Arc<K>>,
    /// Entities listed since the running relist started
    relisted: Option<HashSet<EntityId>>,
}

impl<K> Default for EventClassifier<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K: WatchedResource> EventClassifier<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        let (object, deleted) = match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => (obj, false),
            watcher::Event::Delete(obj) => (obj, true),
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                return Vec::new();
            }
            watcher::Event::InitDone => return self.finish_relist(),
        };

        let id = match EntityId::from_resource(&object) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Skipping watch event for object without identity");
                return Vec::new();
            }
        };

        let object = Arc::new(object);
        let kind = if deleted {
            self.known.remove(&id);
            WatchEventKind::Deleted
        } else {
            if let Some(seen) = &mut self.relisted {
                seen.insert(id.clone());
            }
            match self.known.insert(id, Arc::clone(&object)) {
                None => WatchEventKind::Added,
                Some(_) => WatchEventKind::Modified,
            }
        };

        WatchEvent::from_arc(object, kind).into_iter().collect()
    }

    /// Deletions for known objects the relist did not return
    fn finish_relist(&mut self) -> Vec<WatchEvent<K>> {
        let Some(seen) = self.relisted.take() else {
            return Vec::new();
        };
        let mut vanished: Vec<EntityId> = self
            .known
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        vanished.sort();

        vanished
            .into_iter()
            .filter_map(|id| {
                let object = self.known.remove(&id)?;
                debug!(entity = %id, "Object vanished during watch gap");
                WatchEvent::from_arc(object, WatchEventKind::Deleted).ok()
            })
            .collect()
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }
}

/// Watch `api` and yield classified events
///
/// Watch errors are retried by kube's default backoff and only logged here;
/// a reconnect relists, which re-delivers every object as a resync.
pub fn watch_events<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = WatchEvent<K>> + Send
where
    K: WatchedResource,
{
    let mut classifier = EventClassifier::new();
    watcher(api, config)
        .default_backoff()
        .map(move |result| {
            let classified = match result {
                Ok(event) => classifier.classify(event),
                Err(e) => {
                    let e = Error::from(e);
                    warn!(error = %e, kind = e.kind(), "Watch stream error");
                    Vec::new()
                }
            };
            for event in &classified {
                debug!(entity = %event.id, kind = %event.kind, "Watch event received");
            }
            stream::iter(classified)
        })
        .flatten()
}
