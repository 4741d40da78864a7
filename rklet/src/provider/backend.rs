use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use uuid::Uuid;

use crate::error::ProviderError;

/// Addresses handed out when there is no real network integration.
pub const PLACEHOLDER_HOST_IP: &str = "1.2.3.4";
pub const PLACEHOLDER_POD_IP: &str = "2.3.4.5";

/// Runtime state of one container as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    NotStarted,
    Running { since: DateTime<Utc> },
    Terminated { exit_code: i32, at: DateTime<Utc> },
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionedContainer {
    pub container_id: String,
    pub state: ContainerState,
}

/// Result of provisioning a pod on the backend.
#[derive(Debug, Clone)]
pub struct Provisioned {
    /// Backend identifier of the pod sandbox. Unrelated to the pod UID.
    pub runtime_id: String,
    pub host_ip: String,
    pub pod_ip: String,
    pub started_at: DateTime<Utc>,
    /// One entry per declared container, same order.
    pub containers: Vec<ProvisionedContainer>,
}

/// The machine runtime that actually runs workloads.
///
/// Capability flags let the provider surface `InvalidOperation` instead of
/// pretending an unsupported call succeeded.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn provision(&self, pod: &Pod) -> Result<Provisioned, ProviderError>;

    fn supports_delete(&self) -> bool {
        false
    }

    fn supports_update(&self) -> bool {
        false
    }

    async fn terminate(&self, _runtime_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::InvalidOperation("delete".into()))
    }

    async fn update(&self, _runtime_id: &str, _pod: &Pod) -> Result<(), ProviderError> {
        Err(ProviderError::InvalidOperation("update".into()))
    }
}

/// Backend that reports every pod as running immediately.
///
/// Intended for POC deployments: nothing is started on the machines and
/// deletion is not supported.
#[derive(Debug, Default, Clone)]
pub struct StubBackend;

#[async_trait]
impl Backend for StubBackend {
    async fn provision(&self, pod: &Pod) -> Result<Provisioned, ProviderError> {
        let now = Utc::now();
        let runtime_id = Uuid::new_v4().simple().to_string();
        let containers = pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, _)| ProvisionedContainer {
                container_id: format!("mac://{runtime_id}-{i}"),
                state: ContainerState::Running { since: now },
            })
            .collect();

        Ok(Provisioned {
            runtime_id,
            host_ip: PLACEHOLDER_HOST_IP.to_string(),
            pod_ip: PLACEHOLDER_POD_IP.to_string(),
            started_at: now,
            containers,
        })
    }
}
