//! dvp-ccm - cloud controller manager for tenant clusters running on DVP

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dvp_cloud_provider::controller::{build_controllers, Context, TenantClientImpl};
use dvp_cloud_provider::{CloudProvider, DvpCloud};
use dvp_common::config::OsEnv;
use dvp_common::kube_utils::create_client;
use dvp_common::telemetry::{init_tracing, TelemetryConfig};
use dvp_common::CloudConfig;

/// Cloud controller manager backing tenant nodes and load balancers with DVP
#[derive(Parser, Debug)]
#[command(name = "dvp-ccm", version, about, long_about = None)]
struct Cli {
    /// Cloud provider config file (YAML)
    #[arg(long, env = "DVP_CCM_CLOUD_CONFIG")]
    cloud_config: Option<PathBuf>,

    /// Tenant cluster name, used to label and select backing objects
    #[arg(long, env = "DVP_CCM_CLUSTER_NAME", default_value = "kubernetes")]
    cluster_name: String,

    /// Kubeconfig of the tenant cluster (in-cluster config when unset)
    #[arg(long, env = "KUBECONFIG")]
    tenant_kubeconfig: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Service and Node controllers (default mode)
    Run,
    /// Print the provider capability matrix as JSON and exit
    Capabilities,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Capabilities) = cli.command {
        println!("{}", serde_json::to_string_pretty(&DvpCloud::CAPABILITIES)?);
        return Ok(());
    }

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    init_tracing(TelemetryConfig {
        json: cli.json_logs,
    })?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let reader = cli
        .cloud_config
        .as_ref()
        .map(File::open)
        .transpose()
        .with_context(|| format!("failed to open cloud config {:?}", cli.cloud_config))?;
    let config = CloudConfig::load(reader, &OsEnv)?;

    let cloud = DvpCloud::from_config(config).await?;
    cloud.initialize();

    let tenant = create_client(cli.tenant_kubeconfig.as_deref())
        .await
        .context("failed to connect to tenant cluster")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested, cancelling in-flight load balancer waits");
            shutdown.cancel();
        }
    });

    let ctx = Arc::new(Context {
        cloud: Arc::new(cloud),
        tenant: Arc::new(TenantClientImpl::new(tenant.client.clone())),
        cluster_name: cli.cluster_name.clone(),
        cancel,
    });

    info!(cluster = %cli.cluster_name, "Starting controllers");
    futures::future::join_all(build_controllers(tenant.client, ctx)).await;
    info!("Controllers stopped");

    Ok(())
}
