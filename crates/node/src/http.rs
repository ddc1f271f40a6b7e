//! The :80 listener: ACME http-01 answers for the node's own certificate,
//! and a redirect to HTTPS for everything else.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use pinhost_acme::ChallengeStore;

use crate::error::{NodeError, Result};

/// Bind :80 and serve until cancelled.
pub async fn serve_http(
    listen_addr: SocketAddr,
    origin: String,
    challenges: ChallengeStore,
    cancel: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| NodeError::Bind { address: listen_addr.to_string(), source: e })?;
    tracing::info!(addr = %listen_addr, "http listener up");

    let task = tokio::spawn(accept_loop(listener, origin, challenges, cancel));
    Ok(task)
}

async fn accept_loop(
    listener: TcpListener,
    origin: String,
    challenges: ChallengeStore,
    cancel: CancellationToken,
) {
    loop {
        let (stream, client_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("http accept error: {e}");
                        continue;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        };

        let origin = origin.clone();
        let challenges = challenges.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let origin = origin.clone();
                let challenges = challenges.clone();
                async move { handle_request(req, &origin, &challenges) }
            });

            let builder = ServerBuilder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(addr = %client_addr, "http connection error: {e}");
                    }
                }
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
                }
            }
        });
    }
}

fn handle_request(
    req: Request<Incoming>,
    origin: &str,
    challenges: &ChallengeStore,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if let Some(token) = req.uri().path().strip_prefix("/.well-known/acme-challenge/")
        && let Some(key_auth) = challenges.get(token)
    {
        return Ok(Response::new(Full::new(Bytes::from(key_auth))));
    }

    let location = format!("https://{origin}{}", req.uri().path());
    let resp = Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header("Location", location)
        .body(Full::new(Bytes::new()))
        .unwrap_or_default();
    Ok(resp)
}
