//! Identity of the virtual node and its readiness transition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSpec, NodeStatus,
    NodeSystemInfo, Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::config::BridgeConfig;
use crate::error::NodeError;
use crate::informer::CacheSynced;
use crate::server::ServerBinding;

pub mod conditions;

pub use conditions::ConditionSet;

pub const CONDITION_READY: &str = "Ready";
pub const READY_REASON: &str = "KubeletReady";
pub const READY_MESSAGE: &str = "provider ready";

const PROVIDER: &str = "mac";
const INTERNAL_IP: &str = "1.2.3.4";
const CPU: &str = "20";
const MEMORY: &str = "100Gi";
const PODS: &str = "110";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Unregistered,
    Registering,
    Ready,
}

/// The node object this bridge advertises, plus where it is in its
/// `Unregistered -> Registering -> Ready` lifecycle.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    node: Node,
    conditions: ConditionSet,
    readiness: Readiness,
}

impl NodeIdentity {
    pub fn new(config: &BridgeConfig) -> Self {
        Self::from_node(build_node(config, Utc::now()))
    }

    pub fn from_node(mut node: Node) -> Self {
        let conditions = ConditionSet::from_list(
            node.status
                .as_mut()
                .and_then(|s| s.conditions.take())
                .unwrap_or_default(),
        );
        Self {
            node,
            conditions,
            readiness: Readiness::Unregistered,
        }
    }

    pub fn name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn conditions(&self) -> &ConditionSet {
        &self.conditions
    }

    /// Called once the node has been handed to the node controller.
    pub fn begin_registration(&mut self) {
        if self.readiness == Readiness::Unregistered {
            self.readiness = Readiness::Registering;
        }
    }

    /// Flip the `Ready` condition to True.
    ///
    /// Requires the pod cache to have synced and the kubelet API server to
    /// be bound or deliberately skipped. Only the `Ready` condition is
    /// touched. Calling it again just refreshes the timestamps.
    pub fn mark_ready(
        &mut self,
        synced: &CacheSynced,
        server: &ServerBinding,
    ) -> Result<(), NodeError> {
        self.mark_ready_at(synced, server, Utc::now())
    }

    pub fn mark_ready_at(
        &mut self,
        _synced: &CacheSynced,
        _server: &ServerBinding,
        now: DateTime<Utc>,
    ) -> Result<(), NodeError> {
        if self.readiness == Readiness::Unregistered {
            return Err(NodeError::NotRegistering);
        }
        // By contract the initial node carries the full condition set.
        if let Some(c) = self.conditions.get_mut(CONDITION_READY) {
            c.status = "True".to_string();
            c.reason = Some(READY_REASON.to_string());
            c.message = Some(READY_MESSAGE.to_string());
            c.last_heartbeat_time = Some(Time(now));
            c.last_transition_time = Some(Time(now));
        }
        self.readiness = Readiness::Ready;
        Ok(())
    }

    /// Node in API form, conditions converted back to a list.
    pub fn to_node(&self) -> Node {
        let mut node = self.node.clone();
        node.status.get_or_insert_with(Default::default).conditions =
            Some(self.conditions.to_list());
        node
    }
}

/// Refresh `last_heartbeat_time` of every condition, leaving transitions alone.
pub fn refresh_heartbeats(node: &mut Node, now: DateTime<Utc>) {
    let Some(status) = node.status.as_mut() else {
        return;
    };
    let mut set = ConditionSet::from_list(status.conditions.take().unwrap_or_default());
    for c in set.iter_mut() {
        c.last_heartbeat_time = Some(Time(now));
    }
    status.conditions = Some(set.to_list());
}

/// Build the initial node object for this bridge.
pub fn build_node(config: &BridgeConfig, now: DateTime<Utc>) -> Node {
    let name = config.node_name.clone();

    let labels = BTreeMap::from([
        ("type".to_string(), "virtual-kubelet".to_string()),
        ("kubernetes.io/role".to_string(), "agent".to_string()),
        ("kubernetes.io/hostname".to_string(), name.clone()),
        ("kubernetes.io/os".to_string(), "darwin".to_string()),
    ]);

    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(CPU.to_string())),
        ("memory".to_string(), Quantity(MEMORY.to_string())),
        ("pods".to_string(), Quantity(PODS.to_string())),
    ]);

    Node {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(labels),
            creation_timestamp: Some(Time(now)),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: Some(vec![Taint {
                key: "virtual-kubelet.io/provider".to_string(),
                value: Some(PROVIDER.to_string()),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            capacity: Some(resources.clone()),
            allocatable: Some(resources),
            addresses: Some(vec![
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: INTERNAL_IP.to_string(),
                },
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: name,
                },
            ]),
            daemon_endpoints: Some(NodeDaemonEndpoints {
                kubelet_endpoint: Some(DaemonEndpoint {
                    port: i32::from(config.listen_port),
                }),
            }),
            node_info: Some(NodeSystemInfo {
                kubelet_version: config.version.clone(),
                operating_system: "darwin".to_string(),
                architecture: std::env::consts::ARCH.to_string(),
                ..Default::default()
            }),
            conditions: Some(initial_conditions(now)),
            ..Default::default()
        }),
    }
}

fn initial_conditions(now: DateTime<Utc>) -> Vec<NodeCondition> {
    let cond = |type_: &str, status: &str, reason: &str, message: &str| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(Time(now)),
        last_transition_time: Some(Time(now)),
    };
    vec![
        cond(CONDITION_READY, "False", "KubeletPending", "kubelet is pending"),
        cond(
            "MemoryPressure",
            "False",
            "KubeletHasSufficientMemory",
            "kubelet has sufficient memory available",
        ),
        cond("DiskPressure", "False", "KubeletHasNoDiskPressure", "kubelet has no disk pressure"),
        cond(
            "PIDPressure",
            "False",
            "KubeletHasSufficientPID",
            "kubelet has sufficient PID available",
        ),
        cond("NetworkUnavailable", "False", "RouteCreated", "RouteController created a route"),
    ]
}
