//! SessionPlane control-plane HTTP service entry point.
//!
//! # Purpose
//! Wires configuration, Kubernetes clients, identity discovery, policy and
//! credential providers, then serves the API and the metrics endpoint.
//!
//! # Notes
//! Without a reachable Kubernetes API the service still starts: identity
//! falls back to an unresolved, in-memory anchor and a warning is logged.
use anyhow::Context;
use controlplane::app::{Backends, build_router, build_state};
use controlplane::config::ControlPlaneConfig;
use controlplane::observability;
use sessionplane_identity::kube_backend::{KubeDiscoveryStore, KubeManagedObjects, KubeOwnerLookup};
use sessionplane_identity::{InMemoryDiscoveryStore, InMemoryManagedObjects, InMemoryOwnerLookup};
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_env_or_yaml().context("control plane config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn kube_backends(config: &ControlPlaneConfig) -> anyhow::Result<Backends> {
    let session_gvk = config.session_gvk()?;
    let backends = match kube::Client::try_default().await {
        Ok(client) => Backends {
            owners: Arc::new(KubeOwnerLookup::new(client.clone(), config.kube_timeout)),
            discovery: Arc::new(KubeDiscoveryStore::new(client.clone(), config.kube_timeout)),
            objects: Arc::new(KubeManagedObjects::new(client, config.kube_timeout, &session_gvk)),
        },
        Err(err) => {
            tracing::warn!(error = %err, "kubernetes client unavailable; identity will not be persisted");
            let discovery = InMemoryDiscoveryStore::without_cluster_uid();
            discovery.set_available(false);
            Backends {
                owners: Arc::new(InMemoryOwnerLookup::new()),
                discovery: Arc::new(discovery),
                objects: Arc::new(InMemoryManagedObjects::new()),
            }
        }
    };
    Ok(backends)
}

async fn run_with_shutdown<F>(config: ControlPlaneConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability(&config)?;
    let backends = kube_backends(&config).await?;
    let state = build_state(&config, backends).await?;

    let (metrics_stop, metrics_stopped) = tokio::sync::oneshot::channel::<()>();
    let metrics_addr = config.metrics_bind;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("bind metrics {metrics_addr}"))?;
    let metrics_task = tokio::spawn(async move {
        let stopped = async {
            let _ = metrics_stopped.await;
        };
        if let Err(err) =
            observability::serve_metrics(metrics_handle, metrics_listener, stopped).await
        {
            tracing::warn!(error = %err, "metrics listener failed");
        }
    });

    let app = build_router(state);
    let addr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, metrics = %metrics_addr, "control plane listening");
    tokio::pin!(shutdown);
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result?;
        }
        _ = &mut shutdown => {}
    }

    let _ = metrics_stop.send(());
    let _ = metrics_task.await;
    Ok(())
}
