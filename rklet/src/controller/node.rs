use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use crate::error::ControlPlaneError;
use crate::node::refresh_heartbeats;

pub const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LEASE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LEASE_DURATION_SECONDS: i32 = 40;

/// Node and lease operations against the cluster.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn create_node(&self, node: &Node) -> Result<Node, ControlPlaneError>;

    async fn patch_node_status(&self, node: &Node) -> Result<Node, ControlPlaneError>;

    /// Create the node lease if missing, otherwise bump its renew time.
    async fn renew_lease(
        &self,
        node_name: &str,
        duration_seconds: i32,
    ) -> Result<(), ControlPlaneError>;
}

pub struct KubeNodeClient {
    nodes: Api<Node>,
    leases: Api<Lease>,
}

impl KubeNodeClient {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
            leases: Api::namespaced(client, NODE_LEASE_NAMESPACE),
        }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn create_node(&self, node: &Node) -> Result<Node, ControlPlaneError> {
        Ok(self.nodes.create(&PostParams::default(), node).await?)
    }

    async fn patch_node_status(&self, node: &Node) -> Result<Node, ControlPlaneError> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let patch = json!({ "status": node.status });
        Ok(self
            .nodes
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn renew_lease(
        &self,
        node_name: &str,
        duration_seconds: i32,
    ) -> Result<(), ControlPlaneError> {
        let now = MicroTime(Utc::now());
        if self.leases.get_opt(node_name).await?.is_none() {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(node_name.to_string()),
                    namespace: Some(NODE_LEASE_NAMESPACE.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(node_name.to_string()),
                    lease_duration_seconds: Some(duration_seconds),
                    renew_time: Some(now),
                    ..Default::default()
                }),
            };
            self.leases.create(&PostParams::default(), &lease).await?;
            return Ok(());
        }

        let patch = json!({
            "spec": {
                "holderIdentity": node_name,
                "leaseDurationSeconds": duration_seconds,
                "renewTime": now,
            }
        });
        self.leases
            .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Decides what to do when publishing node status fails.
#[async_trait]
pub trait NodeStatusErrorHandler: Send + Sync {
    async fn handle(
        &self,
        client: &dyn NodeClient,
        node: &Node,
        err: ControlPlaneError,
    ) -> Result<Node, ControlPlaneError>;
}

/// Registers the node when the cluster does not know it yet.
pub struct RegisterOnNotFound {
    log: Span,
}

impl RegisterOnNotFound {
    pub fn new(log: Span) -> Self {
        Self { log }
    }
}

#[async_trait]
impl NodeStatusErrorHandler for RegisterOnNotFound {
    async fn handle(
        &self,
        client: &dyn NodeClient,
        node: &Node,
        err: ControlPlaneError,
    ) -> Result<Node, ControlPlaneError> {
        if !err.is_not_found() {
            return Err(err);
        }
        let mut fresh = node.clone();
        fresh.metadata.resource_version = None;
        info!(
            parent: &self.log,
            node = fresh.metadata.name.as_deref().unwrap_or_default(),
            "[node] registering node"
        );
        let created = client.create_node(&fresh).await?;
        info!(parent: &self.log, "[node] created new node");
        Ok(created)
    }
}

/// Publishes new node versions to the node controller.
#[derive(Clone)]
pub struct NodeNotifier {
    tx: Arc<watch::Sender<Node>>,
}

impl NodeNotifier {
    pub fn publish(&self, node: Node) {
        self.tx.send_replace(node);
    }
}

/// Keeps the node object and its lease alive in the cluster.
pub struct NodeController {
    client: Arc<dyn NodeClient>,
    handler: Arc<dyn NodeStatusErrorHandler>,
    node: Node,
    tx: Arc<watch::Sender<Node>>,
    rx: watch::Receiver<Node>,
    status_interval: Duration,
    lease_interval: Duration,
    lease_duration_seconds: i32,
    log: Span,
}

impl NodeController {
    pub fn new(
        client: Arc<dyn NodeClient>,
        handler: Arc<dyn NodeStatusErrorHandler>,
        node: Node,
        log: Span,
    ) -> Self {
        let (tx, rx) = watch::channel(node.clone());
        Self {
            client,
            handler,
            node,
            tx: Arc::new(tx),
            rx,
            status_interval: DEFAULT_STATUS_INTERVAL,
            lease_interval: DEFAULT_LEASE_INTERVAL,
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
            log,
        }
    }

    pub fn with_intervals(mut self, status: Duration, lease: Duration) -> Self {
        self.status_interval = status;
        self.lease_interval = lease;
        self
    }

    pub fn notifier(&self) -> NodeNotifier {
        NodeNotifier {
            tx: self.tx.clone(),
        }
    }

    fn node_name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }

    /// Push the current status, falling back to the error handler.
    async fn publish_status(&mut self) -> Result<(), ControlPlaneError> {
        let updated = match self.client.patch_node_status(&self.node).await {
            Ok(node) => node,
            Err(e) => {
                debug!(parent: &self.log, error = %e, "[node] status update failed, consulting handler");
                self.handler.handle(self.client.as_ref(), &self.node, e).await?
            }
        };
        self.node.metadata.resource_version = updated.metadata.resource_version;
        Ok(())
    }

    /// Initial registration. A failure here is fatal for the daemon.
    pub async fn register(&mut self) -> Result<(), ControlPlaneError> {
        self.publish_status().await?;
        info!(parent: &self.log, node = self.node_name(), "[node] node registered");
        Ok(())
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut status_tick = tokio::time::interval(self.status_interval);
        let mut lease_tick = tokio::time::interval(self.lease_interval);
        status_tick.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = self.rx.borrow_and_update().clone();
                    let rv = self.node.metadata.resource_version.take();
                    self.node = next;
                    self.node.metadata.resource_version = rv;
                    if let Err(e) = self.publish_status().await {
                        warn!(parent: &self.log, error = %e, "[node] failed to publish node update");
                    }
                }
                _ = status_tick.tick() => {
                    refresh_heartbeats(&mut self.node, Utc::now());
                    if let Err(e) = self.publish_status().await {
                        warn!(parent: &self.log, error = %e, "[node] failed to refresh node status");
                    }
                }
                _ = lease_tick.tick() => {
                    let name = self.node_name().to_string();
                    if let Err(e) = self.client.renew_lease(&name, self.lease_duration_seconds).await {
                        warn!(parent: &self.log, error = %e, "[node] failed to renew node lease");
                    }
                }
            }
        }
        info!(parent: &self.log, "[node] node controller stopped");
    }
}
