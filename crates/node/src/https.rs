//! The public HTTPS listener.
//!
//! TLS terminates here with the node's own origin certificate (issued over
//! http-01 and replicated through the store); requests then go to the
//! axum API router. Each connection runs in its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use hyper_util::service::TowerToHyperService;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use pinhost_acme::SelfCert;

use crate::error::{NodeError, Result};

/// Keep slow-loris clients from pinning connections: the request head must
/// arrive promptly. Response writes are bounded by the ACME pipeline's own
/// ten-minute timeout.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves the origin certificate for every handshake; renewal swaps the
/// underlying key atomically.
struct OriginCertResolver {
    self_cert: SelfCert,
}

impl std::fmt::Debug for OriginCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginCertResolver").finish()
    }
}

impl ResolvesServerCert for OriginCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.self_cert.current())
    }
}

/// Bind :443 and serve the router over TLS until cancelled.
pub async fn serve_https(
    listen_addr: SocketAddr,
    router: Router,
    self_cert: SelfCert,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let mut tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(OriginCertResolver { self_cert }));
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| NodeError::Bind { address: listen_addr.to_string(), source: e })?;
    tracing::info!(addr = %listen_addr, "https listener up");

    let task = tokio::spawn(accept_loop(listener, acceptor, router, cancel));
    Ok(task)
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    cancel: CancellationToken,
) {
    loop {
        let (stream, client_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("https accept error: {e}");
                        continue;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(addr = %client_addr, "tls handshake failed: {e}");
                    return;
                }
            };

            let service = TowerToHyperService::new(router);
            let mut builder = ServerBuilder::new(TokioExecutor::new());
            builder.http1().header_read_timeout(HEADER_READ_TIMEOUT);
            let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(addr = %client_addr, "https connection error: {e}");
                    }
                }
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    match tokio::time::timeout(Duration::from_secs(5), conn).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::debug!(addr = %client_addr, "https drain error: {e}"),
                        Err(_) => tracing::debug!(addr = %client_addr, "https drain timeout"),
                    }
                }
            }
        });
    }
}
