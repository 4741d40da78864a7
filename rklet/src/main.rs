use clap::Parser;
use rklet::cli::Args;
use rklet::config::BridgeConfig;
use rklet::daemon;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    daemon::init_crypto();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = BridgeConfig::resolve(&args);
    let log = info_span!("rklet", node = %config.node_name);

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    match daemon::run(config, token, log).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            info!("[daemon] cancelled before the node became ready");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "[daemon] fatal error");
            Err(e.into())
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutting down...");
    token.cancel();
}
