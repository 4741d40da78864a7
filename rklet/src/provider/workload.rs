use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tokio::sync::RwLock;

use super::WorkloadKey;
use super::backend::{ContainerState, Provisioned};

/// One declared container and what the backend says about it.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub name: String,
    pub image: String,
    pub container_id: String,
    pub state: ContainerState,
}

/// A pod accepted by this node.
#[derive(Debug, Clone)]
pub struct Workload {
    pub key: WorkloadKey,
    /// Pod UID assigned by the API server, if any.
    pub uid: Option<String>,
    /// Identifier assigned by the backend runtime.
    pub runtime_id: String,
    pub containers: Vec<ContainerRecord>,
    /// Last known pod, with the synthesized status written in.
    pub pod: Pod,
}

impl Workload {
    pub fn new(key: WorkloadKey, pod: Pod, provisioned: &Provisioned) -> Self {
        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
            .iter()
            .zip(provisioned.containers.iter())
            .map(|(spec, runtime)| ContainerRecord {
                name: spec.name.clone(),
                image: spec.image.clone().unwrap_or_default(),
                container_id: runtime.container_id.clone(),
                state: runtime.state.clone(),
            })
            .collect();

        Workload {
            key,
            uid: pod.metadata.uid.clone(),
            runtime_id: provisioned.runtime_id.clone(),
            containers,
            pod,
        }
    }

    pub fn status(&self) -> PodStatus {
        self.pod.status.clone().unwrap_or_default()
    }
}

/// Workloads keyed by namespace/name.
///
/// Every mutation is one insert or remove under the write lock, so readers
/// never see a half-written workload. Only clones leave the table.
#[derive(Debug, Default)]
pub struct WorkloadTable {
    inner: RwLock<HashMap<WorkloadKey, Workload>>,
}

impl WorkloadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &WorkloadKey) -> Option<Workload> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &WorkloadKey) -> bool {
        self.inner.read().await.contains_key(key)
    }

    /// Insert unless the key is already present. Returns the workload that
    /// ends up in the table.
    pub async fn insert_if_absent(&self, workload: Workload) -> Workload {
        let mut guard = self.inner.write().await;
        guard
            .entry(workload.key.clone())
            .or_insert(workload)
            .clone()
    }

    /// Replace the stored pod of an existing workload.
    pub async fn replace_pod(&self, key: &WorkloadKey, pod: Pod) -> bool {
        let mut guard = self.inner.write().await;
        match guard.get_mut(key) {
            Some(w) => {
                let status = w.pod.status.take();
                w.pod = pod;
                w.pod.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, key: &WorkloadKey) -> Option<Workload> {
        self.inner.write().await.remove(key)
    }

    pub async fn snapshot(&self) -> Vec<Workload> {
        let guard = self.inner.read().await;
        let mut all: Vec<_> = guard.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
