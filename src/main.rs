use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher;
use kube::ResourceExt;
use kubeops::controller::{Controller, Finalizer, FinalizerSet};
use kubeops::{OperatorBuilder, OperatorSettings};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Settings file (TOML); flags below override it
    #[arg(long, env = "KUBEOPS_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Retry delay unit in milliseconds
    #[arg(long, env = "MIN_REQUEUE_MS")]
    min_requeue_ms: Option<u64>,

    /// Retry delay cap in milliseconds
    #[arg(long, env = "MAX_REQUEUE_MS")]
    max_requeue_ms: Option<u64>,

    /// Idle lock primitives kept for reuse
    #[arg(long, env = "LOCK_POOL_CAPACITY")]
    lock_pool_capacity: Option<usize>,

    /// Run as the only instance without a Lease
    #[arg(long, env = "DISABLE_LEADER_ELECTION")]
    disable_leader_election: bool,

    /// Label selector for the sample ConfigMap controller
    #[arg(long, env = "LABEL_SELECTOR", default_value = "kubeops.dev/managed=true")]
    label_selector: String,

    /// Address of the health/status/metrics endpoint
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: std::net::SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl RunArgs {
    fn settings(&self) -> anyhow::Result<OperatorSettings> {
        let mut settings = match &self.config {
            Some(path) => OperatorSettings::from_file(path)
                .with_context(|| format!("loading settings from {}", path.display()))?,
            None => OperatorSettings::default(),
        };

        if let Some(ns) = &self.namespace {
            settings.namespace = Some(ns.clone());
        }
        if let Some(ms) = self.min_requeue_ms {
            settings.min_requeue_interval_ms = ms;
        }
        if let Some(ms) = self.max_requeue_ms {
            settings.max_requeue_interval_ms = ms;
        }
        if let Some(capacity) = self.lock_pool_capacity {
            settings.lock_pool_capacity = capacity;
        }
        if self.disable_leader_election {
            settings.leader_election.enabled = false;
        }

        settings.validate()?;
        Ok(settings)
    }
}

const AUDIT_FINALIZER: &str = "kubeops.dev/audit";

/// Sample controller: logs every managed ConfigMap it converges
struct ConfigMapController;

#[async_trait]
impl Controller<ConfigMap> for ConfigMapController {
    async fn reconcile(&self, cm: Arc<ConfigMap>) -> kubeops::Result<()> {
        let keys = cm.data.as_ref().map(|d| d.len()).unwrap_or(0);
        info!(
            "Reconciled ConfigMap {}/{} ({} keys)",
            cm.namespace().unwrap_or_default(),
            cm.name_any(),
            keys
        );
        Ok(())
    }

    async fn deleted(&self, cm: Arc<ConfigMap>) -> kubeops::Result<()> {
        info!(
            "ConfigMap {}/{} is gone",
            cm.namespace().unwrap_or_default(),
            cm.name_any()
        );
        Ok(())
    }
}

/// Records the deletion before the ConfigMap is allowed to disappear
struct AuditFinalizer;

#[async_trait]
impl Finalizer<ConfigMap> for AuditFinalizer {
    fn name(&self) -> &str {
        AUDIT_FINALIZER
    }

    async fn finalize(&self, cm: Arc<ConfigMap>) -> kubeops::Result<()> {
        info!(
            "Audit: ConfigMap {}/{} deleted (resourceVersion {:?})",
            cm.namespace().unwrap_or_default(),
            cm.name_any(),
            cm.resource_version()
        );
        Ok(())
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("KubeOps Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    init_tracing(args.log_format);
    let settings = args.settings()?;

    info!("Starting KubeOps Operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API")?;
    info!("Connected to Kubernetes cluster");

    let mut finalizers = FinalizerSet::new();
    finalizers.register(AuditFinalizer)?;

    let status = Arc::new(kubeops::controller::StatusRegistry::new());
    let operator = OperatorBuilder::new(client, settings)
        .with_status_hook(status.clone())
        .add_controller(
            ConfigMapController,
            finalizers,
            watcher::Config::default().labels(&args.label_selector),
        )
        .build()?;

    let shutdown = operator.shutdown_token();

    #[cfg(feature = "rest-api")]
    {
        let state = Arc::new(kubeops::rest_api::ApiState {
            leader: operator.leader().clone(),
            status: status.clone(),
        });
        let addr = args.http_addr;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = kubeops::rest_api::run_server(state, addr, shutdown).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    operator.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            wait_for_ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = wait_for_ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        // without a signal source, run until killed
        std::future::pending::<()>().await;
    }
}
