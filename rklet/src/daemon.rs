//! Process lifecycle: bring every component up in order, wait for the
//! cancellation token, tear down in reverse.

use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, error, info, info_span};

use crate::config::BridgeConfig;
use crate::controller::{
    KubeNodeClient, KubePodClient, NodeController, PodController, RegisterOnNotFound,
};
use crate::error::{DaemonError, ServerError};
use crate::informer::PodInformer;
use crate::node::NodeIdentity;
use crate::provider::{MacProvider, StubBackend};
use crate::server::{ApiState, ServerBinding, StatusServer};

const EVENT_QUEUE_DEPTH: usize = 256;

pub fn init_crypto() {
    // A provider may already be installed by an embedding process.
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );
}

/// Build a cluster client from the kubeconfig on disk. Also returns the
/// API server URL it points at.
pub async fn connect(config: &BridgeConfig) -> Result<(Client, String), DaemonError> {
    let path = config.kubeconfig_path.display().to_string();
    let kubeconfig = Kubeconfig::read_from(&config.kubeconfig_path).map_err(|e| {
        DaemonError::Kubeconfig {
            path: path.clone(),
            message: e.to_string(),
        }
    })?;
    let client_config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| DaemonError::Kubeconfig {
            path,
            message: e.to_string(),
        })?;
    let url = client_config.cluster_url.to_string();
    let client = Client::try_from(client_config).map_err(DaemonError::Client)?;
    Ok((client, url))
}

pub async fn run(
    config: BridgeConfig,
    token: CancellationToken,
    log: Span,
) -> Result<(), DaemonError> {
    // Any early return stops whatever was already spawned.
    let _shutdown = token.clone().drop_guard();

    let (client, url) = connect(&config).await?;
    let config = config.with_kubernetes_url(url);
    info!(
        parent: &log,
        node = %config.node_name,
        kubeconfig = %config.kubeconfig_path.display(),
        url = config.kubernetes_url.as_deref().unwrap_or_default(),
        "[daemon] connected to cluster"
    );

    let provider = Arc::new(MacProvider::new(
        config.node_name.clone(),
        Arc::new(StubBackend),
        info_span!(parent: &log, "provider"),
    ));
    let mut identity = NodeIdentity::new(&config);

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let informer = PodInformer::spawn(
        client.clone(),
        &config.node_name,
        config.namespace.as_deref(),
        events_tx,
        token.clone(),
        info_span!(parent: &log, "informer"),
    );
    let synced = informer.wait_for_sync(&token).await?;
    info!(parent: &log, "[daemon] pod cache synced");

    let node_log = info_span!(parent: &log, "node");
    let mut node_controller = NodeController::new(
        Arc::new(KubeNodeClient::new(client.clone())),
        Arc::new(RegisterOnNotFound::new(node_log.clone())),
        identity.to_node(),
        node_log,
    );
    node_controller
        .register()
        .await
        .map_err(DaemonError::NodeController)?;
    identity.begin_registration();
    let notifier = node_controller.notifier();
    let node_task = tokio::spawn(node_controller.run(token.clone()));

    let store = Arc::new(informer.store());
    let pod_controller = PodController::new(
        provider.clone(),
        Arc::new(KubePodClient::new(client.clone())),
        store.clone(),
        config.pod_sync_workers,
        info_span!(parent: &log, "pod"),
    );
    let pod_task = tokio::spawn(pod_controller.run(events_rx, token.clone()));

    let state = ApiState {
        pods: store,
        provider: provider.clone(),
    };
    let (binding, server_task) =
        match StatusServer::bind(&config, state, info_span!(parent: &log, "server")).await {
            Ok(Some(server)) => {
                let binding = server.binding();
                (binding, Some(tokio::spawn(server.serve(token.clone()))))
            }
            Ok(None) => (ServerBinding::Skipped, None),
            // Bad TLS material only costs the kubelet API, a failed bind is fatal.
            Err(e @ ServerError::Tls(_)) => {
                error!(parent: &log, error = %e, "[daemon] kubelet API disabled");
                (ServerBinding::Skipped, None)
            }
            Err(e) => return Err(e.into()),
        };

    identity.mark_ready(&synced, &binding)?;
    notifier.publish(identity.to_node());
    info!(parent: &log, ?binding, "[daemon] node is ready");

    token.cancelled().await;
    info!(parent: &log, "[daemon] shutting down");

    if let Some(task) = server_task {
        task.await?;
    }
    pod_task.await?;
    node_task.await?;
    informer.join().await?;
    info!(parent: &log, "[daemon] stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;

    #[tokio::test]
    async fn unreadable_kubeconfig_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::resolve_with(&Args::default(), |_| None);
        config.kubeconfig_path = dir.path().join("missing-kubeconfig");

        let token = CancellationToken::new();
        let err = run(config, token.clone(), Span::none()).await.unwrap_err();
        assert!(matches!(err, DaemonError::Kubeconfig { .. }));
        assert!(!err.is_cancelled());
        // Early exits cancel whatever was already started.
        assert!(token.is_cancelled());
    }
}
