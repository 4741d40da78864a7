//! TLS status endpoint of the kubelet API.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Layer;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tracing::{Span, debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::ServerError;

pub mod routes;
pub mod tls;

pub use routes::{ApiState, PodLister};

/// Outcome of bringing up the kubelet API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerBinding {
    Bound(SocketAddr),
    /// No TLS material was configured, so nothing listens.
    Skipped,
}

pub struct StatusServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    app: NormalizePath<axum::Router>,
    log: Span,
}

impl StatusServer {
    /// Load TLS material and bind the listener on `0.0.0.0:<listen_port>`.
    ///
    /// Returns `Ok(None)` when the certificate or key path is missing.
    pub async fn bind(
        config: &BridgeConfig,
        state: ApiState,
        log: Span,
    ) -> Result<Option<StatusServer>, ServerError> {
        let (Some(cert), Some(key)) = (&config.server_cert_path, &config.server_key_path) else {
            error!(
                parent: &log,
                cert_path = ?config.server_cert_path,
                key_path = ?config.server_key_path,
                "[server] TLS certificates not provided, not setting up the kubelet API server"
            );
            return Ok(None);
        };

        let tls_config = tls::load_tls_config(cert, key)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(parent: &log, addr = %local_addr, "[server] kubelet API listening");

        let app = NormalizePathLayer::trim_trailing_slash().layer(routes::create_router(state));
        Ok(Some(StatusServer {
            listener,
            local_addr,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            app,
            log,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn binding(&self) -> ServerBinding {
        ServerBinding::Bound(self.local_addr)
    }

    /// Accept connections until `token` fires or the listener fails.
    pub async fn serve(self, token: CancellationToken) {
        let StatusServer {
            listener,
            acceptor,
            local_addr: _,
            app,
            log,
        } = self;

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                res = listener.accept() => res,
            };
            let (stream, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    if !token.is_cancelled() {
                        error!(parent: &log, error = %e, "[server] failed to setup the kubelet API server");
                    }
                    break;
                }
            };

            let acceptor = acceptor.clone();
            let app = app.clone();
            let token = token.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(parent: &log, %remote, error = %e, "[server] TLS handshake failed");
                        return;
                    }
                };

                let builder = HyperBuilder::new(TokioExecutor::new());
                let conn = builder
                    .serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(app));
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    _ = token.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = res {
                    debug!(parent: &log, %remote, error = %e, "[server] connection closed with error");
                }
            });
        }

        drop(listener);
        info!(parent: &log, "[server] kubelet API listener closed");
    }
}
