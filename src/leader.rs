//! Leadership signal and Lease based leader election
//!
//! [`LeaderState`] is what the dispatcher consumes: a boolean "is leader"
//! plus a cancellation token per leadership term that fires when the term
//! ends. [`LeaseElector`] drives it from a `coordination.k8s.io/v1` Lease,
//! using resourceVersion for compare-and-swap so two replicas never both
//! believe they hold the lease.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaderElectionSettings;
use crate::error::Result;

/// Shared view of whether this instance currently leads
#[derive(Clone)]
pub struct LeaderState {
    inner: Arc<LeaderInner>,
}

struct LeaderInner {
    tx: watch::Sender<bool>,
    term: Mutex<CancellationToken>,
}

impl Default for LeaderState {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderState {
    /// Start as a follower
    pub fn new() -> Self {
        let term = CancellationToken::new();
        term.cancel();
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(LeaderInner {
                tx,
                term: Mutex::new(term),
            }),
        }
    }

    /// Single-instance mode: leader from the start
    pub fn always_leader() -> Self {
        let state = Self::new();
        state.set_leader(true);
        state
    }

    pub fn is_leader(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Token of the current term; already cancelled while not leading
    pub fn term(&self) -> CancellationToken {
        self.lock_term().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Record a leadership change; losing it cancels the current term
    pub fn set_leader(&self, leader: bool) {
        let mut term = self.lock_term();
        let was_leader = *self.inner.tx.borrow();
        if leader == was_leader {
            return;
        }
        if leader {
            // The new term must be visible before anyone sees `true`.
            *term = CancellationToken::new();
            self.inner.tx.send_replace(true);
        } else {
            term.cancel();
            self.inner.tx.send_replace(false);
        }
    }

    /// Wait until leading and return the token of that term
    pub async fn wait_for_leadership(&self) -> CancellationToken {
        let mut rx = self.subscribe();
        if rx.wait_for(|leader| *leader).await.is_err() {
            debug!("Leadership channel closed");
        }
        self.term()
    }

    fn lock_term(&self) -> MutexGuard<'_, CancellationToken> {
        self.inner.term.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lease based leader elector
pub struct LeaseElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaseElector {
    pub fn new(
        client: Client,
        settings: &LeaderElectionSettings,
        namespace: &str,
        identity: &str,
    ) -> Self {
        Self {
            client,
            lease_name: settings.lease_name.clone(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: settings.lease_duration(),
            renew_interval: settings.renew_interval(),
            retry_interval: settings.retry_interval(),
        }
    }

    /// Acquire and renew the lease until `shutdown` fires, publishing into `state`
    pub async fn run(self, state: LeaderState, shutdown: CancellationToken) {
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        info!(identity = %self.identity, lease = %self.lease_name, "Leader election started");

        loop {
            let wait = match self.try_acquire_or_renew(&leases).await {
                Ok(true) => {
                    if !state.is_leader() {
                        info!(identity = %self.identity, "Acquired leadership for lease {}", self.lease_name);
                    }
                    state.set_leader(true);
                    self.renew_interval
                }
                Ok(false) => {
                    if state.is_leader() {
                        warn!(identity = %self.identity, "Lost leadership for lease {}", self.lease_name);
                    }
                    state.set_leader(false);
                    self.retry_interval
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Leader election error");
                    state.set_leader(false);
                    self.retry_interval
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let was_leader = state.is_leader();
        state.set_leader(false);
        if was_leader {
            if let Err(e) = self.release(&leases).await {
                warn!(identity = %self.identity, error = %e, "Failed to release lease");
            }
        }
    }

    async fn try_acquire_or_renew(&self, leases: &Api<Lease>) -> Result<bool> {
        let now = Utc::now();

        let existing = match leases.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return self.create(leases, now).await;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

        let next_spec = if holder == Some(self.identity.as_str()) {
            LeaseSpec {
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.lease_duration_secs()),
                ..spec.cloned().unwrap_or_default()
            }
        } else if lease_is_expired(spec, now) {
            info!(identity = %self.identity, "Lease held by {:?} has expired, taking over", holder);
            LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.lease_duration_secs()),
                lease_transitions: Some(transitions + 1),
                ..Default::default()
            }
        } else {
            return Ok(false);
        };

        let mut updated = existing.clone();
        updated.spec = Some(next_spec);
        match leases
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                debug!(identity = %self.identity, "Lease update conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, leases: &Api<Lease>, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.lease_duration_secs()),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match leases.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!("Created lease {} with holder {}", self.lease_name, self.identity);
                Ok(true)
            }
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so another replica can take over without waiting
    async fn release(&self, leases: &Api<Lease>) -> Result<()> {
        let past = Utc::now() - chrono::Duration::seconds(self.lease_duration_secs().into());
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past),
            }
        });
        leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(identity = %self.identity, "Lease {} released", self.lease_name);
        Ok(())
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// A lease without renew time or duration counts as expired
pub fn lease_is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    match (renew, duration) {
        (Some(renew), Some(duration)) => now > renew.0 + chrono::Duration::seconds(duration.into()),
        _ => true,
    }
}

/// Identity used as lease holder: `$HOSTNAME`, falling back to the system hostname
pub fn holder_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}
