//! Watch of the pods scheduled to this node.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, warn};

use crate::error::DaemonError;
use crate::server::PodLister;

/// Proof that the pod cache finished its initial list.
#[derive(Debug)]
pub struct CacheSynced(());

impl CacheSynced {
    pub(crate) fn new() -> Self {
        CacheSynced(())
    }
}

#[derive(Debug, Clone)]
pub enum PodEvent {
    Upsert(Pod),
    Removed(Pod),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Upsert(p) | PodEvent::Removed(p) => p,
        }
    }
}

pub fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name}")
}

fn to_pod_event(event: watcher::Event<Pod>) -> Option<PodEvent> {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => Some(PodEvent::Upsert(pod)),
        watcher::Event::Delete(pod) => Some(PodEvent::Removed(pod)),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

impl PodLister for Store<Pod> {
    fn list(&self) -> Vec<Pod> {
        self.state().into_iter().map(Arc::unwrap_or_clone).collect()
    }
}

pub struct PodInformer {
    store: Store<Pod>,
    task: JoinHandle<()>,
}

impl PodInformer {
    /// Start watching pods bound to `node_name` and forward every change
    /// on `events`. Changes queue up inside the informer while `events` is
    /// full.
    pub fn spawn(
        client: Client,
        node_name: &str,
        namespace: Option<&str>,
        events: mpsc::Sender<PodEvent>,
        token: CancellationToken,
        log: Span,
    ) -> Self {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let config = watcher::Config::default().fields(&node_field_selector(node_name));
        let (store, writer) = reflector::store();
        let stream = watcher(api, config).default_backoff().reflect(writer);

        info!(
            parent: &log,
            node = node_name,
            namespace = namespace.unwrap_or("<all>"),
            "[informer] watching pods"
        );

        let task = tokio::spawn(async move {
            let mut stream = pin!(stream);
            // The reflector must keep being polled while the controller is
            // not consuming yet, or the cache never reports ready.
            let mut pending = VecDeque::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    permit = events.reserve(), if !pending.is_empty() => {
                        let Ok(permit) = permit else {
                            debug!(parent: &log, "[informer] pod controller gone, stopping");
                            break;
                        };
                        if let Some(event) = pending.pop_front() {
                            permit.send(event);
                        }
                    }
                    _ = events.closed(), if pending.is_empty() => {
                        debug!(parent: &log, "[informer] pod controller gone, stopping");
                        break;
                    }
                    next = stream.next() => match next {
                        Some(Ok(event)) => pending.extend(to_pod_event(event)),
                        Some(Err(e)) => {
                            warn!(parent: &log, error = %e, "[informer] watch error, backing off");
                        }
                        None => break,
                    },
                }
            }
            info!(parent: &log, "[informer] stopped");
        });

        PodInformer { store, task }
    }

    pub fn store(&self) -> Store<Pod> {
        self.store.clone()
    }

    /// Wait for the initial list to land in the cache.
    pub async fn wait_for_sync(
        &self,
        token: &CancellationToken,
    ) -> Result<CacheSynced, DaemonError> {
        tokio::select! {
            _ = token.cancelled() => Err(DaemonError::Cancelled),
            res = self.store.wait_until_ready() => {
                res.map_err(|_| DaemonError::Cancelled)?;
                Ok(CacheSynced::new())
            }
        }
    }

    pub async fn join(self) -> Result<(), DaemonError> {
        self.task.await?;
        Ok(())
    }
}
