use std::path::PathBuf;

use crate::cli::Args;

pub const DEFAULT_NODE_NAME: &str = "mac-virtual-kubelet";
pub const DEFAULT_POD_SYNC_WORKERS: usize = 10;
pub const DEFAULT_LISTEN_PORT: u16 = 10248;
/// Follows the version of the Kubernetes API the bridge is tested against.
/// See https://kubernetes.io/docs/setup/release/version-skew-policy/#kubelet
pub const K8S_VERSION: &str = "v1.24.3";

pub const ENV_NODE_NAME: &str = "HOSTNAME";
pub const ENV_KUBECONFIG: &str = "KUBECONFIG";
pub const ENV_HOME: &str = "HOME";
pub const ENV_CERT: &str = "APISERVER_CERT_LOCATION";
pub const ENV_KEY: &str = "APISERVER_KEY_LOCATION";

/// Resolved daemon configuration. Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub node_name: String,
    /// `None` watches every namespace.
    pub namespace: Option<String>,
    pub kubeconfig_path: PathBuf,
    pub server_cert_path: Option<PathBuf>,
    pub server_key_path: Option<PathBuf>,
    pub listen_port: u16,
    pub pod_sync_workers: usize,
    pub version: String,
    /// API server URL, known only once the client has been built.
    pub kubernetes_url: Option<String>,
}

impl BridgeConfig {
    /// Resolve from flags, falling back to the process environment.
    pub fn resolve(args: &Args) -> Self {
        Self::resolve_with(args, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    ///
    /// Order for each value: flag, then environment, then the compiled-in
    /// default. Empty strings count as unset.
    pub fn resolve_with<F>(args: &Args, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.is_empty());

        let node_name = args
            .nodename
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| env(ENV_NODE_NAME))
            .unwrap_or_else(|| DEFAULT_NODE_NAME.to_string());

        let kubeconfig_path = args
            .kubeconfig
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| env(ENV_KUBECONFIG).map(PathBuf::from))
            .unwrap_or_else(|| {
                PathBuf::from(env(ENV_HOME).unwrap_or_default())
                    .join(".kube")
                    .join("config")
            });

        let pod_sync_workers = match args.pod_sync_workers {
            Some(n) if n > 0 => n,
            _ => DEFAULT_POD_SYNC_WORKERS,
        };

        let listen_port = match args.port {
            Some(p) if p != 0 => p,
            _ => DEFAULT_LISTEN_PORT,
        };

        let namespace = args.namespace.clone().filter(|ns| !ns.is_empty());

        let server_cert_path = args
            .tls_cert
            .clone()
            .or_else(|| env(ENV_CERT).map(PathBuf::from));
        let server_key_path = args
            .tls_key
            .clone()
            .or_else(|| env(ENV_KEY).map(PathBuf::from));

        BridgeConfig {
            node_name,
            namespace,
            kubeconfig_path,
            server_cert_path,
            server_key_path,
            listen_port,
            pod_sync_workers,
            version: K8S_VERSION.to_string(),
            kubernetes_url: None,
        }
    }

    pub fn with_kubernetes_url(mut self, url: impl Into<String>) -> Self {
        self.kubernetes_url = Some(url.into());
        self
    }
}
