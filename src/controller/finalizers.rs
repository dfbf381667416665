//! Finalizer registration and marker helpers
//!
//! Finalizers make sure that when a resource is deleted:
//! 1. Every registered cleanup step runs, in registration order
//! 2. The resource keeps its finalizer markers until all of them succeeded
//! 3. Only then the API server is allowed to finish the physical deletion

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};

/// A named cleanup step that has to complete before deletion finishes
#[async_trait]
pub trait Finalizer<K>: Send + Sync + 'static {
    /// Marker stored in `metadata.finalizers`, e.g. `example.com/cleanup`
    fn name(&self) -> &str;

    async fn finalize(&self, obj: Arc<K>) -> Result<()>;
}

/// Ordered finalizers registered for one resource type
pub struct FinalizerSet<K> {
    finalizers: Vec<Arc<dyn Finalizer<K>>>,
}

impl<K> Default for FinalizerSet<K> {
    fn default() -> Self {
        Self {
            finalizers: Vec::new(),
        }
    }
}

impl<K> Clone for FinalizerSet<K> {
    fn clone(&self) -> Self {
        Self {
            finalizers: self.finalizers.clone(),
        }
    }
}

impl<K: Resource + 'static> FinalizerSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finalizer; names must be non-empty and unique
    pub fn register(&mut self, finalizer: impl Finalizer<K>) -> Result<()> {
        self.register_arc(Arc::new(finalizer))
    }

    pub fn register_arc(&mut self, finalizer: Arc<dyn Finalizer<K>>) -> Result<()> {
        let name = finalizer.name();
        if name.trim().is_empty() {
            return Err(Error::ConfigError(
                "Finalizer name must not be empty".to_string(),
            ));
        }
        if self.finalizers.iter().any(|f| f.name() == name) {
            return Err(Error::ConfigError(format!(
                "Finalizer {name} is registered twice"
            )));
        }
        self.finalizers.push(finalizer);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.finalizers.iter().map(|f| f.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.finalizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    /// Registered finalizers whose marker is still on `obj`, in registration order
    pub fn pending(&self, obj: &K) -> Vec<Arc<dyn Finalizer<K>>> {
        self.finalizers
            .iter()
            .filter(|f| has_finalizer(obj, f.name()))
            .cloned()
            .collect()
    }

    /// Registered finalizer names not yet attached to `obj`
    pub fn missing(&self, obj: &K) -> Vec<String> {
        self.finalizers
            .iter()
            .filter(|f| !has_finalizer(obj, f.name()))
            .map(|f| f.name().to_string())
            .collect()
    }
}

/// Check if the resource carries the given finalizer marker
pub fn has_finalizer<K: Resource>(obj: &K, name: &str) -> bool {
    obj.finalizers().iter().any(|f| f == name)
}

/// Finalizer list with `names` appended, keeping existing order and skipping duplicates
pub fn with_finalizers<K: Resource>(obj: &K, names: &[String]) -> Vec<String> {
    let mut finalizers: Vec<String> = obj.finalizers().to_vec();
    for name in names {
        if !finalizers.contains(name) {
            finalizers.push(name.clone());
        }
    }
    finalizers
}

/// Finalizer list with `names` removed
pub fn without_finalizers<K: Resource>(obj: &K, names: &[String]) -> Vec<String> {
    obj.finalizers()
        .iter()
        .filter(|f| !names.contains(f))
        .cloned()
        .collect()
}
