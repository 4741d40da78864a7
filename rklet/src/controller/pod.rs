use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, error, info, warn};

use crate::error::{ControlPlaneError, ProviderError};
use crate::informer::PodEvent;
use crate::provider::status::{PHASE_FAILED, PHASE_SUCCEEDED};
use crate::provider::{PodLifecycle, WorkloadKey};
use crate::server::PodLister;

pub const DEFAULT_STATUS_SYNC_INTERVAL: Duration = Duration::from_secs(5);
const WORKER_QUEUE_DEPTH: usize = 64;

/// Pod writes the controller makes against the cluster.
#[async_trait]
pub trait PodClient: Send + Sync {
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PodStatus,
    ) -> Result<(), ControlPlaneError>;

    /// Delete with a zero grace period.
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError>;
}

pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PodStatus,
    ) -> Result<(), ControlPlaneError> {
        let patch = json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default().grace_period(0))
            .await?;
        Ok(())
    }
}

/// Exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1 << attempt.min(16))
    }
}

pub fn shard_for(key: &WorkloadKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Reconciles pods bound to this node against the provider.
pub struct PodController {
    provider: Arc<dyn PodLifecycle>,
    client: Arc<dyn PodClient>,
    cache: Arc<dyn PodLister>,
    workers: usize,
    retry: RetryPolicy,
    status_interval: Duration,
    log: Span,
}

impl PodController {
    pub fn new(
        provider: Arc<dyn PodLifecycle>,
        client: Arc<dyn PodClient>,
        cache: Arc<dyn PodLister>,
        workers: usize,
        log: Span,
    ) -> Self {
        Self {
            provider,
            client,
            cache,
            workers: workers.max(1),
            retry: RetryPolicy::default(),
            status_interval: DEFAULT_STATUS_SYNC_INTERVAL,
            log,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Dispatch `events` to the workers until the token fires or the
    /// informer goes away, then drain the workers.
    pub async fn run(self, mut events: mpsc::Receiver<PodEvent>, token: CancellationToken) {
        let this = Arc::new(self);
        let stop = token.child_token();

        let mut queues = Vec::with_capacity(this.workers);
        let mut workers = JoinSet::new();
        for id in 0..this.workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            queues.push(tx);
            workers.spawn(this.clone().worker(id, rx, stop.clone()));
        }
        let sync = tokio::spawn(this.clone().status_sync(stop.clone()));
        info!(parent: &this.log, workers = this.workers, "[pod] pod controller started");

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            let shard = shard_for(&WorkloadKey::from_pod(event.pod()), queues.len());
            if queues[shard].send(event).await.is_err() {
                break;
            }
        }

        drop(queues);
        stop.cancel();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!(parent: &this.log, error = %e, "[pod] worker panicked");
            }
        }
        if let Err(e) = sync.await {
            error!(parent: &this.log, error = %e, "[pod] status sync panicked");
        }
        info!(parent: &this.log, "[pod] pod controller stopped");
    }

    async fn worker(
        self: Arc<Self>,
        id: usize,
        mut queue: mpsc::Receiver<PodEvent>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = queue.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle(&event, &token).await;
        }
        debug!(parent: &self.log, worker = id, "[pod] worker exited");
    }

    /// Reconcile one event, retrying transient provider failures.
    pub(crate) async fn handle(&self, event: &PodEvent, token: &CancellationToken) {
        let key = WorkloadKey::from_pod(event.pod());
        let mut attempt = 0;
        loop {
            match self.reconcile(event, token).await {
                Ok(()) => return,
                Err(ProviderError::Cancelled) => return,
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    warn!(
                        parent: &self.log,
                        pod = %key,
                        attempt,
                        ?delay,
                        error = %e,
                        "[pod] requeueing after transient failure"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(parent: &self.log, pod = %key, error = %e, "[pod] failed to sync pod");
                    return;
                }
            }
        }
    }

    async fn reconcile(
        &self,
        event: &PodEvent,
        token: &CancellationToken,
    ) -> Result<(), ProviderError> {
        match event {
            PodEvent::Upsert(pod) if pod.metadata.deletion_timestamp.is_some() => {
                self.delete(pod, token).await
            }
            PodEvent::Upsert(pod) => self.create_or_update(pod, token).await,
            PodEvent::Removed(pod) => self.delete(pod, token).await,
        }
    }

    async fn create_or_update(
        &self,
        pod: &Pod,
        token: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let key = WorkloadKey::from_pod(pod);
        if is_terminal(pod) {
            debug!(parent: &self.log, pod = %key, "[pod] pod already finished, skipping");
            return Ok(());
        }
        match cancellable(token, self.provider.get_pod(&key.namespace, &key.name)).await {
            Ok(known) => {
                if known.spec == pod.spec {
                    return Ok(());
                }
                match cancellable(token, self.provider.update_pod(pod)).await {
                    Err(e) if e.is_invalid_operation() => {
                        info!(parent: &self.log, pod = %key, error = %e, "[pod] provider cannot update pod, leaving as is");
                        Ok(())
                    }
                    other => other,
                }
            }
            Err(e) if e.is_not_found() => {
                let mut created = pod.clone();
                cancellable(token, self.provider.create_pod(&mut created)).await?;
                info!(parent: &self.log, pod = %key, "[pod] pod created on provider");
                if let Some(status) = created.status.as_ref() {
                    self.patch_status(&key, status).await;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, pod: &Pod, token: &CancellationToken) -> Result<(), ProviderError> {
        let key = WorkloadKey::from_pod(pod);
        match cancellable(token, self.provider.delete_pod(pod)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(parent: &self.log, pod = %key, "[pod] pod already gone from provider");
            }
            Err(e) if e.is_invalid_operation() => {
                info!(parent: &self.log, pod = %key, error = %e, "[pod] provider cannot delete pod, leaving as is");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self.client.force_delete_pod(&key.namespace, &key.name).await {
            Ok(()) => info!(parent: &self.log, pod = %key, "[pod] pod deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(parent: &self.log, pod = %key, error = %e, "[pod] failed to delete pod object"),
        }
        Ok(())
    }

    async fn patch_status(&self, key: &WorkloadKey, status: &PodStatus) {
        if let Err(e) = self
            .client
            .patch_pod_status(&key.namespace, &key.name, status)
            .await
        {
            warn!(parent: &self.log, pod = %key, error = %e, "[pod] failed to update pod status");
        }
    }

    async fn status_sync(self: Arc<Self>, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.status_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => self.sync_statuses(&token).await,
            }
        }
    }

    /// Patch every cached pod whose provider status drifted.
    pub(crate) async fn sync_statuses(&self, token: &CancellationToken) {
        for pod in self.cache.list() {
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let key = WorkloadKey::from_pod(&pod);
            let status = match cancellable(
                token,
                self.provider.get_pod_status(&key.namespace, &key.name),
            )
            .await
            {
                Ok(status) => status,
                Err(ProviderError::Cancelled) => return,
                Err(_) => continue,
            };
            if status_differs(&status, pod.status.as_ref()) {
                debug!(parent: &self.log, pod = %key, "[pod] status drifted, patching");
                self.patch_status(&key, &status).await;
            }
        }
    }
}

async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ProviderError::Cancelled),
        res = fut => res,
    }
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some(PHASE_SUCCEEDED | PHASE_FAILED)
    )
}

// The API server adds fields of its own (qosClass, startTime), so only
// the fields the provider owns are compared.
fn status_differs(ours: &PodStatus, theirs: Option<&PodStatus>) -> bool {
    let Some(theirs) = theirs else {
        return true;
    };
    ours.phase != theirs.phase
        || ours.host_ip != theirs.host_ip
        || ours.pod_ip != theirs.pod_ip
        || ours.conditions != theirs.conditions
        || ours.container_statuses != theirs.container_statuses
}
