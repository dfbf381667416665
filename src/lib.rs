//! KubeOps: reconciliation core for Kubernetes operators
//!
//! This crate turns a watch stream of Kubernetes resources into serialized,
//! retried reconcile callbacks: per-entity locking, delayed requeueing with
//! linear backoff, finalizer handling and leader gating.

pub mod config;
pub mod controller;
pub mod error;
pub mod leader;
pub mod operator;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::config::OperatorSettings;
pub use crate::error::{Error, Result};
pub use crate::operator::{Operator, OperatorBuilder};
