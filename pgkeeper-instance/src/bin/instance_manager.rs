//! pgkeeper instance manager binary.
//!
//! Runs inside every PostgreSQL pod, watches the cluster's resources and
//! reconciles the local instance one event at a time. Exits non-zero on a
//! fatal error so the pod is restarted.

use kube::{Client, CustomResourceExt};
use pgkeeper_engine::{DiskFiles, PostgresInstance};
use pgkeeper_instance::crd::Cluster;
use pgkeeper_instance::observability::{TracingConfig, init_tracing};
use pgkeeper_instance::status::KubeStatusStore;
use pgkeeper_instance::{Dispatcher, InstanceContext, ManagerConfig, watch};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Check for CRD generation mode
    if std::env::args().any(|arg| arg == "--generate-crds") {
        generate_crds()?;
        return Ok(());
    }

    let guard = init_tracing(TracingConfig::from_env())?;

    let config = ManagerConfig::from_env()?;
    tracing::info!(
        pod = %config.pod_name,
        namespace = %config.namespace,
        cluster = %config.cluster_name,
        pgdata = %config.pgdata.display(),
        "Starting pgkeeper instance manager"
    );

    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    let instance = Arc::new(PostgresInstance::new(config.postgres_settings()));
    let status_store = Arc::new(KubeStatusStore::new(
        client.clone(),
        &config.namespace,
        config.cluster_name.clone(),
    ));
    let ctx = InstanceContext::new(
        config,
        instance,
        status_store,
        Arc::new(DiskFiles::new()),
        cancel,
    );

    let events = watch::instance_events(client, &ctx.identity);
    let mut dispatcher = Dispatcher::new(ctx);

    if let Err(err) = dispatcher.run(events).await {
        tracing::error!(error = %err, "Instance manager stopped on a fatal error");
        drop(guard);
        std::process::exit(1);
    }

    tracing::info!(handled = dispatcher.handled(), "Instance manager stopped");
    Ok(())
}

/// Generate CRD YAML.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&Cluster::crd())?);
    Ok(())
}
