use clap::Parser;
use std::path::PathBuf;

/// Runs a virtual kubelet daemon that makes it easier to manage mac machines
/// with kubectl like commands.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "rklet", version, about = "provides a virtual kubelet interface for mac runners.")]
pub struct Args {
    /// cluster client configuration
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// The value to be set as the Node name
    #[arg(long)]
    pub nodename: Option<String>,

    /// The number of Pod synchronization workers
    #[arg(long = "pod-sync-workers")]
    pub pod_sync_workers: Option<usize>,

    /// The Kubernetes namespace
    #[arg(long)]
    pub namespace: Option<String>,

    /// Port of the kubelet API server
    #[arg(long)]
    pub port: Option<u16>,

    /// Certificate used to secure the kubelet API
    #[arg(long = "tls-cert")]
    pub tls_cert: Option<PathBuf>,

    /// Private key matching --tls-cert
    #[arg(long = "tls-key")]
    pub tls_key: Option<PathBuf>,
}
