//! Prometheus metrics for the dispatcher
//!
//! # Exported metrics
//! Built with `--features metrics`, [`MetricsStatusHook`] feeds:
//! - `kubeops_dispatch_results_total` (counter): dispatch outcomes labeled by controller and result.
//! - `kubeops_dispatch_errors_total` (counter): failed dispatches labeled by controller and error kind.
//! - `kubeops_entity_retry_attempt` (gauge): current retry attempt labeled by controller/namespace/name.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::entity::EntityId;
use super::status::{EntityStatus, StatusHook};

/// Labels for dispatch results
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub controller: String,
    pub result: String, // "success" or "retry"
}

/// Labels for dispatch errors
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    pub kind: String,
}

/// Labels for per-entity gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EntityLabels {
    pub controller: String,
    pub namespace: String,
    pub name: String,
}

/// Counter tracking dispatch outcomes
pub static DISPATCH_RESULTS_TOTAL: Lazy<Family<ResultLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking failed dispatches by error kind
pub static DISPATCH_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the retry attempt of entities that are failing
pub static ENTITY_RETRY_ATTEMPT: Lazy<Family<EntityLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "kubeops_dispatch_results",
        "Total number of dispatches by result",
        DISPATCH_RESULTS_TOTAL.clone(),
    );
    registry.register(
        "kubeops_dispatch_errors",
        "Total number of failed dispatches by error kind",
        DISPATCH_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "kubeops_entity_retry_attempt",
        "Current retry attempt of a failing entity (0 = settled)",
        ENTITY_RETRY_ATTEMPT.clone(),
    );

    registry
});

/// Render the registry in the Prometheus text format
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

/// [`StatusHook`] publishing dispatcher status into the global registry
pub struct MetricsStatusHook {
    controller: String,
}

impl MetricsStatusHook {
    pub fn new(controller: &str) -> Self {
        Self {
            controller: controller.to_string(),
        }
    }

    fn entity_labels(&self, id: &EntityId) -> EntityLabels {
        EntityLabels {
            controller: self.controller.clone(),
            namespace: id.namespace().unwrap_or_default().to_string(),
            name: id.name().to_string(),
        }
    }
}

impl StatusHook for MetricsStatusHook {
    fn status_changed(&self, id: &EntityId, status: &EntityStatus) {
        let result = if status.is_retrying() { "retry" } else { "success" };
        DISPATCH_RESULTS_TOTAL
            .get_or_create(&ResultLabels {
                controller: self.controller.clone(),
                result: result.to_string(),
            })
            .inc();

        if let Some(kind) = status.error_kind {
            DISPATCH_ERRORS_TOTAL
                .get_or_create(&ErrorLabels {
                    controller: self.controller.clone(),
                    kind: kind.to_string(),
                })
                .inc();
        }

        ENTITY_RETRY_ATTEMPT
            .get_or_create(&self.entity_labels(id))
            .set(i64::from(status.attempt));
    }

    fn entity_forgotten(&self, id: &EntityId) {
        ENTITY_RETRY_ATTEMPT.remove(&self.entity_labels(id));
    }
}
