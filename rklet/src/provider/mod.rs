//! Pod lifecycle contract consumed by the pod controller, and the mac
//! implementation of it.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};

use crate::error::ProviderError;

pub mod backend;
pub mod mac;
pub mod status;
pub mod workload;

pub use backend::{Backend, StubBackend};
pub use mac::MacProvider;

/// Operations the pod controller invokes for pods bound to this node.
///
/// Implementations must tolerate concurrent calls from several workers and
/// at-least-once delivery of `create_pod`.
#[async_trait]
pub trait PodLifecycle: Send + Sync {
    /// Start the pod and write the synthesized status back into `pod`.
    async fn create_pod(&self, pod: &mut Pod) -> Result<(), ProviderError>;

    async fn update_pod(&self, pod: &Pod) -> Result<(), ProviderError>;

    async fn delete_pod(&self, pod: &Pod) -> Result<(), ProviderError>;

    /// Last known pod, including the status synthesized at creation.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ProviderError>;

    async fn get_pod_status(&self, namespace: &str, name: &str)
    -> Result<PodStatus, ProviderError>;

    async fn get_pods(&self) -> Result<Vec<Pod>, ProviderError>;
}

/// Identity of a workload in the bridge: namespace and name of the pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }

    pub fn not_found(&self) -> ProviderError {
        ProviderError::not_found(&self.namespace, &self.name)
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
