//! RayService operator entry point

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rayservice_operator::controller::{error_policy, reconcile, Context};
use rayservice_operator::crd::{RayCluster, RayService};
use rayservice_operator::DEFAULT_SERVE_CONFIG_CACHE_CAPACITY;

/// RayService operator - zero-downtime Ray Serve lifecycle management
#[derive(Parser, Debug)]
#[command(name = "rayservice-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Reconcile fan-out across RayService keys; a single key is always
    /// reconciled serially
    #[arg(long, default_value_t = 1, env = "MAX_CONCURRENT_RECONCILES")]
    max_concurrent_reconciles: u16,

    /// Capacity of the serve-config cache (RayService entries)
    #[arg(long, default_value_t = DEFAULT_SERVE_CONFIG_CACHE_CAPACITY, env = "SERVE_CONFIG_CACHE_CAPACITY")]
    serve_config_cache_capacity: usize,

    /// Gate head-pod readiness on the HeadPodReady status condition instead
    /// of probing the head pod directly
    #[arg(
        long,
        default_value_t = true,
        env = "RAY_CLUSTER_STATUS_CONDITIONS",
        action = clap::ArgAction::Set
    )]
    status_conditions: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let ray_service_crd = serde_yaml::to_string(&RayService::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize RayService CRD: {e}"))?;
        let ray_cluster_crd = serde_yaml::to_string(&RayCluster::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize RayCluster CRD: {e}"))?;
        println!("{ray_service_crd}---\n{ray_cluster_crd}");
        return Ok(());
    }

    tracing::info!("RayService operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let ctx = Arc::new(
        Context::new(
            client.clone(),
            cli.serve_config_cache_capacity,
            cli.status_conditions,
        )
        .map_err(|e| anyhow::anyhow!("failed to build controller context: {e}"))?,
    );

    let ray_services: Api<RayService> = Api::all(client.clone());
    let ray_clusters: Api<RayCluster> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);

    tracing::info!(
        max_concurrent_reconciles = cli.max_concurrent_reconciles,
        "starting RayService controller..."
    );

    Controller::new(ray_services, WatcherConfig::default())
        .owns(ray_clusters, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(cli.max_concurrent_reconciles))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(object) => tracing::debug!(?object, "reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
        })
        .await;

    tracing::info!("RayService operator shutting down");
    Ok(())
}
