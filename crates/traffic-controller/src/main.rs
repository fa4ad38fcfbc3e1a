//! Binary entrypoint for the traffic controller.
use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use traffic_controller::{
    build_router,
    cluster::{ClusterApi, KubeClusterApi},
    config::Args,
    k8s_watch,
    logging::init_logging,
    reconcile_loop::ReconcileLoop,
    records::RoutePipeline,
    state::{WeightSnapshot, WeightState},
    store::{new_backend, StoreConfig},
    telemetry, AppState,
};

/// Pending fan-out events before the weight loop waits on the controller.
const FAN_OUT_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format)?;
    let settings = args.into_settings()?;
    info!(cluster=%settings.store.cluster_name, backend=?settings.store.backend, binding_domain=%settings.records.binding_domain, "traffic_controller.starting");

    let (mut writer, weights) = WeightState::new(WeightSnapshot::new(
        settings.initial_weight,
        settings.initial_weight,
        settings.health_check_id.clone(),
    ));
    let store = new_backend(&settings.store, weights.clone()).await?;
    store
        .initialize_if_absent(&StoreConfig::from(writer.snapshot().as_ref()))
        .await
        .context("seeding the weight store")?;
    let desired = store.read_weight().await.context("reading the desired weight from the store")?;
    let seeded = writer.seed(desired, desired);
    if let Err(e) = store.on_weight_update(&StoreConfig::from(seeded.as_ref())).await {
        warn!(error=%e, "weight_store.initial_update_failed");
    }
    telemetry::record_weights(&seeded);
    info!(weight = desired, "weight_state.seeded");

    let client = kube::Client::try_default().await.context("building the kubernetes client")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));
    let pipeline = Arc::new(RoutePipeline::new(cluster.clone(), weights.clone(), settings.records.clone()));
    let (events_tx, events_rx) = mpsc::channel(FAN_OUT_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(settings.metrics_addr)
        .await
        .with_context(|| format!("binding {}", settings.metrics_addr))?;
    info!(addr=%settings.metrics_addr, "metrics.listening");
    let app = build_router(AppState { weights });
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { let _ = server_shutdown.changed().await; })
            .await
    });

    let weight_loop = ReconcileLoop::new(store, writer, cluster, events_tx);
    let weight_loop = tokio::spawn(weight_loop.run(settings.poll_interval, shutdown_rx));
    let deletions = tokio::spawn(k8s_watch::run_route_deletion_watcher(client.clone(), pipeline.clone()));

    k8s_watch::run_controller(client, pipeline, events_rx).await;
    info!("traffic_controller.shutting_down");
    let _ = shutdown_tx.send(true);
    deletions.abort();
    if let Err(e) = weight_loop.await {
        warn!(error=%e, "weight_loop.join_failed");
    }
    match server.await {
        Ok(Err(e)) => warn!(error=%e, "metrics.server_failed"),
        Err(e) => warn!(error=%e, "metrics.join_failed"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
