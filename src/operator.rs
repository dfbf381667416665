//! Operator assembly
//!
//! Controllers are registered up front through [`OperatorBuilder`]. The
//! resulting [`Operator`] owns the leadership signal and runs one loop per
//! resource type: wait for leadership, open a fresh watch, dispatch until
//! the term ends, drop whatever was queued, and start over.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::watcher,
    Client, Resource,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::controller::metrics::MetricsStatusHook;
use crate::config::OperatorSettings;
use crate::controller::{
    watch_events, Controller, DispatcherOptions, EntityLockProvider, FinalizerSet,
    KubeResourceClient, ReconciliationDispatcher, ResourceClient, StatusHook, WatchedResource,
};
use crate::error::Result;
use crate::leader::{holder_identity, LeaderState, LeaseElector};

/// A registered resource type, with its type erased
#[async_trait]
trait RegisteredController: Send + Sync {
    fn resource(&self) -> &str;

    async fn run(&self, leader: LeaderState, shutdown: CancellationToken);

    fn shutdown(&self);
}

struct TypedController<K: WatchedResource> {
    resource: String,
    api: Api<K>,
    config: watcher::Config,
    dispatcher: ReconciliationDispatcher<K>,
}

#[async_trait]
impl<K: WatchedResource> RegisteredController for TypedController<K> {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn run(&self, leader: LeaderState, shutdown: CancellationToken) {
        loop {
            let term = tokio::select! {
                _ = shutdown.cancelled() => return,
                term = leader.wait_for_leadership() => term,
            };
            if term.is_cancelled() {
                continue;
            }

            info!(resource = %self.resource, "Starting watch");
            let events = watch_events(self.api.clone(), self.config.clone());
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.dispatcher.run(events, term) => {}
            }
            debug!(resource = %self.resource, "Dispatch loop ended");
        }
    }

    fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

/// Static registration of controllers and finalizers
pub struct OperatorBuilder {
    client: Client,
    settings: OperatorSettings,
    leader: LeaderState,
    status_hooks: Vec<Arc<dyn StatusHook>>,
    controllers: Vec<Arc<dyn RegisteredController>>,
}

impl OperatorBuilder {
    pub fn new(client: Client, settings: OperatorSettings) -> Self {
        Self {
            client,
            settings,
            leader: LeaderState::new(),
            status_hooks: Vec::new(),
            controllers: Vec::new(),
        }
    }

    /// Receive status updates from every controller registered afterwards
    pub fn with_status_hook(mut self, hook: Arc<dyn StatusHook>) -> Self {
        self.status_hooks.push(hook);
        self
    }

    /// Register a controller for a namespaced resource type
    ///
    /// Watches `settings.namespace`, or every namespace when unset.
    pub fn add_controller<K>(
        self,
        controller: impl Controller<K>,
        finalizers: FinalizerSet<K>,
        config: watcher::Config,
    ) -> Self
    where
        K: WatchedResource + Resource<Scope = NamespaceResourceScope>,
    {
        let api = match &self.settings.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let client = KubeResourceClient::<K>::namespaced(self.client.clone(), &self.settings.name);
        self.register(api, Arc::new(client), Arc::new(controller), finalizers, config)
    }

    /// Register a controller for a cluster scoped resource type
    pub fn add_cluster_controller<K>(
        self,
        controller: impl Controller<K>,
        finalizers: FinalizerSet<K>,
        config: watcher::Config,
    ) -> Self
    where
        K: WatchedResource,
    {
        let api = Api::all(self.client.clone());
        let client = KubeResourceClient::<K>::cluster(self.client.clone(), &self.settings.name);
        self.register(api, Arc::new(client), Arc::new(controller), finalizers, config)
    }

    fn register<K: WatchedResource>(
        mut self,
        api: Api<K>,
        client: Arc<dyn ResourceClient<K>>,
        controller: Arc<dyn Controller<K>>,
        finalizers: FinalizerSet<K>,
        config: watcher::Config,
    ) -> Self {
        let resource = K::kind(&()).to_string();
        info!(
            resource = %resource,
            finalizers = ?finalizers.names(),
            "Registering controller"
        );

        let mut options = DispatcherOptions::from(&self.settings);
        options.status_hooks = self.status_hooks.clone();
        #[cfg(feature = "metrics")]
        options
            .status_hooks
            .push(Arc::new(MetricsStatusHook::new(&resource)));

        let dispatcher = ReconciliationDispatcher::new(
            controller,
            finalizers,
            client,
            EntityLockProvider::new(self.settings.lock_pool_capacity),
            self.leader.clone(),
            options,
        );
        self.controllers.push(Arc::new(TypedController {
            resource,
            api,
            config,
            dispatcher,
        }));
        self
    }

    pub fn build(self) -> Result<Operator> {
        self.settings.validate()?;
        Ok(Operator {
            client: self.client,
            settings: self.settings,
            leader: self.leader,
            controllers: self.controllers,
            shutdown: CancellationToken::new(),
        })
    }
}

/// A set of controllers sharing one leadership signal
pub struct Operator {
    client: Client,
    settings: OperatorSettings,
    leader: LeaderState,
    controllers: Vec<Arc<dyn RegisteredController>>,
    shutdown: CancellationToken,
}

impl Operator {
    pub fn leader(&self) -> &LeaderState {
        &self.leader
    }

    /// Token that stops [`Operator::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every controller until shut down
    pub async fn run(&self) -> Result<()> {
        let elector = if self.settings.leader_election.enabled {
            let namespace = self.lease_namespace();
            let identity = holder_identity();
            info!("Leader election using holder ID: {}", identity);
            let elector = LeaseElector::new(
                self.client.clone(),
                &self.settings.leader_election,
                &namespace,
                &identity,
            );
            Some(tokio::spawn(
                elector.run(self.leader.clone(), self.shutdown.clone()),
            ))
        } else {
            info!("Leader election disabled, running as the only instance");
            self.leader.set_leader(true);
            None
        };

        let names: Vec<&str> = self.controllers.iter().map(|c| c.resource()).collect();
        info!(controllers = ?names, "Operator {} started", self.settings.name);

        join_all(
            self.controllers
                .iter()
                .map(|c| c.run(self.leader.clone(), self.shutdown.clone())),
        )
        .await;

        self.shutdown();
        if let Some(handle) = elector {
            if let Err(e) = handle.await {
                warn!(error = %e, "Leader election task failed");
            }
        }
        info!("Operator {} stopped", self.settings.name);
        Ok(())
    }

    /// Stop all loops, close lock providers and drop queued entries
    ///
    /// Callbacks already running finish normally.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for controller in &self.controllers {
            controller.shutdown();
        }
    }

    fn lease_namespace(&self) -> String {
        self.settings
            .leader_election
            .lease_namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .or_else(|| self.settings.namespace.clone())
            .unwrap_or_else(|| "default".to_string())
    }
}
