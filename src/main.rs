//! rbac-sync - syncs ClusterRoleBindings from annotated ConfigMaps

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rbac_sync::config::ControllerConfig;
use rbac_sync::controller::run_cluster;
use rbac_sync::identity::{ClientRegistry, CredentialProvider};
use rbac_sync::resolver::Resolver;
use rbac_sync::source::parse_manifest;
use rbac_sync::{
    CACHE_SYNC_ATTEMPTS, DEFAULT_DEBOUNCE_MILLIS, DEFAULT_REQUESTS_PER_SECOND,
    DEFAULT_RESYNC_INTERVAL_SECS,
};

/// rbac-sync - keeps ClusterRoleBindings in sync with identity bindings declared in ConfigMaps
#[derive(Parser, Debug)]
#[command(
    name = "rbac-sync",
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    ///
    /// Watches ConfigMaps carrying the binding annotation, resolves the
    /// declared users through the cloud identity service, and converges the
    /// managed ClusterRoleBindings.
    Run(RunArgs),

    /// Print the bindings a ConfigMap manifest declares, without contacting anything
    Convert(ConvertArgs),
}

/// Controller arguments
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Cloud region of the cluster (e.g., ap-guangzhou)
    #[arg(long, env = "RBAC_SYNC_REGION")]
    region: Option<String>,

    /// TKE cluster id (e.g., cls-abc123)
    #[arg(long, env = "RBAC_SYNC_CLUSTER_ID")]
    cluster_id: Option<String>,

    /// TKE cluster name, looked up when no cluster id is given
    #[arg(long, env = "RBAC_SYNC_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Namespace to watch for binding ConfigMaps (all namespaces when unset)
    #[arg(long, env = "RBAC_SYNC_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between forced convergence passes
    #[arg(long, default_value_t = DEFAULT_RESYNC_INTERVAL_SECS)]
    resync_interval_secs: u64,

    /// Quiet period after the last change before a pass runs, in milliseconds
    #[arg(long, default_value_t = DEFAULT_DEBOUNCE_MILLIS)]
    debounce_millis: u64,

    /// Identity service requests per second, per identifier type
    #[arg(long, default_value_t = DEFAULT_REQUESTS_PER_SECOND)]
    requests_per_second: u32,
}

impl RunArgs {
    fn into_config(self) -> ControllerConfig {
        ControllerConfig {
            region: self.region.unwrap_or_default(),
            cluster_id: self.cluster_id,
            cluster_name: self.cluster_name,
            namespace: self.namespace,
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            debounce: Duration::from_millis(self.debounce_millis),
            requests_per_second: self.requests_per_second,
            cache_sync_attempts: CACHE_SYNC_ATTEMPTS,
        }
    }
}

/// Convert mode arguments
#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Path to the ConfigMap manifest
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Convert(args)) => run_convert(args).await,
        Some(Commands::Run(args)) => run_controller(args.into_config()).await,
        None => run_controller(cli.run.into_config()).await,
    }
}

/// Print the parsed bindings of a ConfigMap manifest as YAML
async fn run_convert(args: ConvertArgs) -> anyhow::Result<()> {
    let manifest = tokio::fs::read_to_string(&args.file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", args.file, e))?;

    let bindings = parse_manifest(&manifest)?;
    let yaml = serde_yaml::to_string(&bindings)
        .map_err(|e| anyhow::anyhow!("Failed to serialize bindings: {}", e))?;
    print!("{yaml}");
    Ok(())
}

async fn run_controller(mut config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!("rbac-sync controller starting...");
    config.validate()?;

    let credentials = CredentialProvider::discover().await?;
    let registry = ClientRegistry::new(credentials, &[config.region.as_str()])?;
    let identity = registry.client(&config.region)?;
    tracing::debug!(
        regions = ?registry.regions().collect::<Vec<_>>(),
        "Identity clients ready"
    );

    let cluster_id = match config.cluster_id.clone().filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let name = config.cluster_name.clone().unwrap_or_default();
            let id = identity
                .find_cluster_id(&name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No cluster named {} in {}", name, config.region))?;
            tracing::info!(cluster_name = %name, cluster_id = %id, "Resolved cluster id");
            id
        }
    };
    config.cluster_id = Some(cluster_id.clone());

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let resolver =
        Resolver::with_default_workers(identity, &cluster_id, config.requests_per_second);

    let shutdown = CancellationToken::new();
    let signal = shutdown_signal()
        .map_err(|e| anyhow::anyhow!("Failed to install signal handlers: {}", e))?;
    tokio::spawn(cancel_on(signal, shutdown.clone()));

    tracing::info!(
        region = %config.region,
        cluster_id = %cluster_id,
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        "Watching binding ConfigMaps"
    );
    run_cluster(client, &config, resolver, shutdown).await?;

    tracing::info!("rbac-sync controller stopped");
    Ok(())
}

/// Resolves with the name of the first SIGINT or SIGTERM received
///
/// Handlers are installed before this returns, so a signal that arrives
/// before the future is first polled is not lost.
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

/// Cancel `shutdown` once `signal` resolves
async fn cancel_on(signal: impl Future<Output = &'static str>, shutdown: CancellationToken) {
    let name = signal.await;
    tracing::info!(signal = name, "Shutdown signal received");
    shutdown.cancel();
}
