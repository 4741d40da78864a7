use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tracing::{Span, debug, error, info, warn};

use super::backend::Backend;
use super::status::synthesize;
use super::workload::{Workload, WorkloadTable};
use super::{PodLifecycle, WorkloadKey};
use crate::error::ProviderError;

/// Upper bound for a single backend call.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Mac provider, implements the pod lifecycle contract on top of a
/// [`Backend`] and keeps the table of workloads accepted by this node.
pub struct MacProvider {
    node_name: String,
    backend: Arc<dyn Backend>,
    workloads: WorkloadTable,
    backend_timeout: Duration,
    log: Span,
}

impl MacProvider {
    pub fn new(node_name: impl Into<String>, backend: Arc<dyn Backend>, log: Span) -> Self {
        Self {
            node_name: node_name.into(),
            backend,
            workloads: WorkloadTable::new(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            log,
        }
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.backend_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ProviderError::ProviderFailure(format!(
                "{op} timed out after {:?}",
                self.backend_timeout
            ))),
        }
    }
}

#[async_trait]
impl PodLifecycle for MacProvider {
    async fn create_pod(&self, pod: &mut Pod) -> Result<(), ProviderError> {
        let key = WorkloadKey::from_pod(pod);

        if let Some(existing) = self.workloads.get(&key).await {
            debug!(parent: &self.log, pod = %key, "[provider] CreatePod replayed, already tracked");
            pod.status = Some(existing.status());
            return Ok(());
        }

        info!(parent: &self.log, pod = %key, "[provider] CreatePod called");
        let provisioned = self.bounded("provision", self.backend.provision(pod)).await?;
        pod.status = Some(synthesize(pod, &provisioned));

        let workload = Workload::new(key.clone(), pod.clone(), &provisioned);
        let stored = self.workloads.insert_if_absent(workload).await;
        if stored.runtime_id != provisioned.runtime_id {
            // lost a race with a concurrent create of the same pod
            warn!(
                parent: &self.log,
                pod = %key,
                runtime_id = %provisioned.runtime_id,
                "[provider] duplicate provisioning, releasing extra sandbox"
            );
            if self.backend.supports_delete() {
                if let Err(e) = self
                    .bounded("terminate", self.backend.terminate(&provisioned.runtime_id))
                    .await
                {
                    error!(
                        parent: &self.log,
                        pod = %key,
                        runtime_id = %provisioned.runtime_id,
                        error = %e,
                        "[provider] failed to release duplicate sandbox"
                    );
                }
            }
            pod.status = Some(stored.status());
        }
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let key = WorkloadKey::from_pod(pod);
        if !self.backend.supports_update() {
            return Err(ProviderError::InvalidOperation("updatepod".into()));
        }
        let existing = self.workloads.get(&key).await.ok_or_else(|| key.not_found())?;

        self.bounded("update", self.backend.update(&existing.runtime_id, pod))
            .await?;
        self.workloads.replace_pod(&key, pod.clone()).await;
        info!(parent: &self.log, pod = %key, "[provider] pod updated");
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), ProviderError> {
        let key = WorkloadKey::from_pod(pod);
        if !self.backend.supports_delete() {
            return Err(ProviderError::InvalidOperation("delpod".into()));
        }
        let existing = self.workloads.get(&key).await.ok_or_else(|| key.not_found())?;

        self.bounded("terminate", self.backend.terminate(&existing.runtime_id))
            .await?;
        self.workloads.remove(&key).await;
        info!(parent: &self.log, pod = %key, "[provider] pod deleted");
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ProviderError> {
        let key = WorkloadKey::new(namespace, name);
        self.workloads
            .get(&key)
            .await
            .map(|w| w.pod)
            .ok_or_else(|| key.not_found())
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PodStatus, ProviderError> {
        let key = WorkloadKey::new(namespace, name);
        self.workloads
            .get(&key)
            .await
            .map(|w| w.status())
            .ok_or_else(|| key.not_found())
    }

    async fn get_pods(&self) -> Result<Vec<Pod>, ProviderError> {
        Ok(self
            .workloads
            .snapshot()
            .await
            .into_iter()
            .map(|w| w.pod)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::backend::{
        ContainerState, PLACEHOLDER_POD_IP, Provisioned, ProvisionedContainer, StubBackend,
    };
    use chrono::Utc;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pod(ns: &str, name: &str, containers: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|(n, i)| Container {
                        name: n.to_string(),
                        image: Some(i.to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stub_provider() -> MacProvider {
        MacProvider::new("mac-test", Arc::new(StubBackend), Span::none())
    }

    /// Backend that counts calls and supports every operation.
    #[derive(Default)]
    struct CountingBackend {
        provisioned: AtomicUsize,
        terminated: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn provision(&self, pod: &Pod) -> Result<Provisioned, ProviderError> {
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            let count = pod.spec.as_ref().map(|s| s.containers.len()).unwrap_or(0);
            Ok(Provisioned {
                runtime_id: format!("rt-{n}"),
                host_ip: "10.0.0.1".into(),
                pod_ip: "10.1.0.1".into(),
                started_at: Utc::now(),
                containers: (0..count)
                    .map(|i| ProvisionedContainer {
                        container_id: format!("cid-{i}"),
                        state: ContainerState::Running { since: Utc::now() },
                    })
                    .collect(),
            })
        }

        fn supports_delete(&self) -> bool {
            true
        }

        fn supports_update(&self) -> bool {
            true
        }

        async fn terminate(&self, _runtime_id: &str) -> Result<(), ProviderError> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update(&self, _runtime_id: &str, _pod: &Pod) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl Backend for FailingBackend {
        async fn provision(&self, _pod: &Pod) -> Result<Provisioned, ProviderError> {
            Err(ProviderError::ProviderFailure("machine pool exhausted".into()))
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl Backend for HangingBackend {
        async fn provision(&self, _pod: &Pod) -> Result<Provisioned, ProviderError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn create_writes_status_back() {
        let provider = stub_provider();
        let mut p = pod("default", "a", &[("c1", "img:1"), ("c2", "img:2")]);
        provider.create_pod(&mut p).await.unwrap();

        let status = p.status.as_ref().unwrap();
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.pod_ip.as_deref(), Some(PLACEHOLDER_POD_IP));
        let names: Vec<_> = status
            .container_statuses
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, ["c1", "c2"]);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let backend = Arc::new(CountingBackend::default());
        let provider = MacProvider::new("mac-test", backend.clone(), Span::none());
        let mut first = pod("default", "a", &[("c1", "img:1")]);
        let mut replay = first.clone();

        provider.create_pod(&mut first).await.unwrap();
        provider.create_pod(&mut replay).await.unwrap();

        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 1);
        assert_eq!(provider.get_pods().await.unwrap().len(), 1);
        assert_eq!(first.status, replay.status);
    }

    #[tokio::test]
    async fn backend_failure_is_transient_and_leaves_no_workload() {
        let provider = MacProvider::new("mac-test", Arc::new(FailingBackend), Span::none());
        let err = provider
            .create_pod(&mut pod("default", "a", &[("c1", "img:1")]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(provider.get_pods().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hung_backend_is_bounded() {
        let provider = MacProvider::new("mac-test", Arc::new(HangingBackend), Span::none())
            .with_backend_timeout(Duration::from_millis(50));
        let err = provider
            .create_pod(&mut pod("default", "a", &[]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unknown_pod_is_not_found() {
        let provider = stub_provider();
        let err = provider.get_pod("default", "ghost").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotFound { ref namespace, ref name } if namespace == "default" && name == "ghost"
        ));
        assert!(
            provider
                .get_pod_status("default", "ghost")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn stub_refuses_delete_and_keeps_workload() {
        let provider = stub_provider();
        let mut p = pod("default", "a", &[("c1", "img:1")]);
        provider.create_pod(&mut p).await.unwrap();

        assert!(provider.delete_pod(&p).await.unwrap_err().is_invalid_operation());
        assert!(provider.update_pod(&p).await.unwrap_err().is_invalid_operation());
        assert_eq!(provider.get_pods().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn supporting_backend_deletes_and_updates() {
        let backend = Arc::new(CountingBackend::default());
        let provider = MacProvider::new("mac-test", backend.clone(), Span::none());
        let mut p = pod("default", "a", &[("c1", "img:1")]);
        provider.create_pod(&mut p).await.unwrap();

        let mut updated = pod("default", "a", &[("c1", "img:2")]);
        updated.status = None;
        provider.update_pod(&updated).await.unwrap();
        let stored = provider.get_pod("default", "a").await.unwrap();
        assert_eq!(
            stored.spec.unwrap().containers[0].image.as_deref(),
            Some("img:2")
        );
        assert!(stored.status.is_some());

        provider.delete_pod(&p).await.unwrap();
        assert_eq!(backend.terminated.load(Ordering::SeqCst), 1);
        assert!(provider.get_pod("default", "a").await.unwrap_err().is_not_found());
        assert!(provider.delete_pod(&p).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn concurrent_creates_track_each_pod_once() {
        let provider = Arc::new(stub_provider());
        let mut handles = Vec::new();
        for i in 0..16 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                let mut p = pod("default", &format!("p{}", i % 4), &[("c1", "img:1")]);
                provider.create_pod(&mut p).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(provider.get_pods().await.unwrap().len(), 4);
    }

    /// Slow to provision, so two creates of one pod both reach the backend.
    /// Releasing a sandbox always fails.
    #[derive(Default)]
    struct SlowBackend {
        provisioned: AtomicUsize,
        terminated: AtomicUsize,
    }

    #[async_trait]
    impl Backend for SlowBackend {
        async fn provision(&self, _pod: &Pod) -> Result<Provisioned, ProviderError> {
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Provisioned {
                runtime_id: format!("rt-{n}"),
                host_ip: "10.0.0.1".into(),
                pod_ip: format!("10.1.0.{n}"),
                started_at: Utc::now(),
                containers: Vec::new(),
            })
        }

        fn supports_delete(&self) -> bool {
            true
        }

        async fn terminate(&self, runtime_id: &str) -> Result<(), ProviderError> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::ProviderFailure(format!("{runtime_id} is stuck")))
        }
    }

    #[tokio::test]
    async fn losing_create_releases_its_sandbox_once() {
        let backend = Arc::new(SlowBackend::default());
        let provider = MacProvider::new("mac-test", backend.clone(), Span::none());
        let mut first = pod("default", "a", &[]);
        let mut second = first.clone();

        let (a, b) = tokio::join!(
            provider.create_pod(&mut first),
            provider.create_pod(&mut second)
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(backend.provisioned.load(Ordering::SeqCst), 2);
        assert_eq!(backend.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(provider.get_pods().await.unwrap().len(), 1);
        // Both callers see the status of the sandbox that was kept.
        assert_eq!(first.status, second.status);
    }
}
