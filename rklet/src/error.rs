use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned through the pod lifecycle contract.
///
/// The pod controller decides from the variant whether to retry,
/// give up, or treat the pod as gone, so the variants must stay distinct.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Pod {name} in namespace {namespace} could not be found on the node")]
    NotFound { namespace: String, name: String },

    /// The backend cannot perform this operation. Retrying as-is will not help.
    #[error("operation {0} is not supported by the backend")]
    InvalidOperation(String),

    /// Transient backend failure, safe to retry with backoff.
    #[error("backend failure: {0}")]
    ProviderFailure(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderFailure(_))
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node must be registering before it can be marked ready")]
    NotRegistering,
}

/// Errors talking to the cluster API server.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Kube(kube::Error),
}

impl ControlPlaneError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for ControlPlaneError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ref resp) if resp.code == 404 => {
                ControlPlaneError::NotFound(resp.message.clone())
            }
            other => ControlPlaneError::Kube(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("error loading tls certs: {0}")]
    Tls(String),

    #[error("failed to bind kubelet API listener at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for ServerError {
    fn from(e: rustls::Error) -> Self {
        ServerError::Tls(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to load kubeconfig {path}: {message}")]
    Kubeconfig { path: String, message: String },

    #[error("failed to build cluster client: {0}")]
    Client(#[source] kube::Error),

    #[error("failed to set up node controller: {0}")]
    NodeController(#[source] ControlPlaneError),

    #[error("failed to set up the kubelet API server: {0}")]
    Server(#[from] ServerError),

    #[error("error marking the node as ready: {0}")]
    Node(#[from] NodeError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("daemon cancelled")]
    Cancelled,
}

impl DaemonError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DaemonError::Cancelled)
    }
}
