use std::path::PathBuf;

use rklet::cli::Args;
use rklet::config::{BridgeConfig, ENV_CERT, ENV_KEY, ENV_KUBECONFIG, ENV_NODE_NAME};
use serial_test::serial;

struct EnvGuard {
    keys: Vec<&'static str>,
}

impl EnvGuard {
    fn set(vars: &[(&'static str, &str)]) -> Self {
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
        }
        Self {
            keys: vars.iter().map(|(k, _)| *k).collect(),
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for k in &self.keys {
            unsafe { std::env::remove_var(k) };
        }
    }
}

#[test]
#[serial]
fn test_resolve_reads_process_environment() {
    let _env = EnvGuard::set(&[
        (ENV_NODE_NAME, "mac-ci-01"),
        (ENV_KUBECONFIG, "/tmp/rklet-kubeconfig"),
        (ENV_CERT, "/tmp/rklet.crt"),
        (ENV_KEY, "/tmp/rklet.key"),
    ]);
    let config = BridgeConfig::resolve(&Args::default());
    assert_eq!(config.node_name, "mac-ci-01");
    assert_eq!(config.kubeconfig_path, PathBuf::from("/tmp/rklet-kubeconfig"));
    assert_eq!(config.server_cert_path, Some(PathBuf::from("/tmp/rklet.crt")));
    assert_eq!(config.server_key_path, Some(PathBuf::from("/tmp/rklet.key")));
}

#[test]
#[serial]
fn test_flags_override_process_environment() {
    let _env = EnvGuard::set(&[(ENV_NODE_NAME, "from-env")]);
    let args = Args {
        nodename: Some("from-flag".into()),
        ..Default::default()
    };
    assert_eq!(BridgeConfig::resolve(&args).node_name, "from-flag");
}
