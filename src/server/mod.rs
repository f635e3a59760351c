//! # HTTP server
//!
//! - `GET /healthz`
//! - `GET /metrics` (Prometheus text format)
//! - `POST /v1/nodes/{name}/labels` (direct reports)
//!
//! ```text
//!  accept ──► TLS handshake ──► peer CN ──► request extension ──► router
//! ```
//!
//! With TLS files configured, the caller identity of a direct report is the
//! common name of its verified client certificate. The `x-client-cert-cn`
//! header is honoured only when the master is told to trust the front end
//! that sets it.

pub mod handlers;
pub mod state;
pub mod tls;

pub use handlers::{authorize, create_router, resolve_identity, CLIENT_CN_HEADER};
pub use state::ServerState;
pub use tls::{build_tls_acceptor, peer_identity, ClientIdentity, TlsError};

use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Upper bound of concurrently handled requests
pub const MAX_CONCURRENT_REQUESTS: usize = 256;

pub fn app(state: ServerState) -> axum::Router {
    create_router(state)
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
}

/// Serve on `listener` until `shutdown` fires
pub async fn serve_on(
    listener: TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on {}", addr);
    }
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Serve TLS on `listener` until `shutdown` fires
///
/// Each connection is handshaken on its own task; the verified peer name is
/// attached to every request of the connection.
pub async fn serve_tls_on(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTPS server listening on {}", addr);
    }
    let app = app(state);

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", remote, e);
                    return;
                }
            };
            let identity = peer_identity(stream.get_ref().1.peer_certificates());
            debug!("Connection from {} as {:?}", remote, identity);

            let service = ServiceBuilder::new()
                .map_request(move |mut request: Request<Incoming>| {
                    if let Some(identity) = &identity {
                        request.extensions_mut().insert(identity.clone());
                    }
                    request
                })
                .service(app);

            let builder = HyperAcceptor::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(service));
            tokio::pin!(conn);
            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                debug!("Connection from {} ended: {}", remote, e);
            }
        });
    }
}

/// Bind `addr` and serve, over TLS when an acceptor is given
pub async fn serve(
    addr: SocketAddr,
    state: ServerState,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    match tls {
        Some(acceptor) => serve_tls_on(listener, acceptor, state, shutdown).await,
        None => serve_on(listener, state, shutdown).await,
    }
}
