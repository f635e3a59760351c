use axum::{
    extract::{Path, State},
    http::{header, Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::apis::SetLabelsRequest;
use crate::master::MasterError;
use crate::server::state::ServerState;
use crate::server::tls::ClientIdentity;

/// Header set by a trusted TLS-terminating front end with the client
/// certificate's common name
pub const CLIENT_CN_HEADER: &str = "x-client-cert-cn";

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for MasterError {
    fn into_response(self) -> Response {
        let status = match &self {
            MasterError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            MasterError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Check that the caller may report for `node_name`
pub fn authorize(verify: bool, identity: Option<&str>, node_name: &str) -> Result<(), MasterError> {
    if !verify {
        return Ok(());
    }
    match identity {
        Some(id) if id == node_name => Ok(()),
        other => Err(MasterError::Unauthorized {
            claimed: node_name.to_string(),
            identity: other.unwrap_or("<none>").to_string(),
        }),
    }
}

/// Pick the caller identity for `node_name`.
///
/// The certificate presented on this connection wins. The forwarded header is
/// used only when the front end setting it is trusted; otherwise a request
/// carrying it is refused, since anyone can set a header.
pub fn resolve_identity<'a>(
    peer: Option<&'a ClientIdentity>,
    forwarded: Option<&'a str>,
    trust_forwarded: bool,
    node_name: &str,
) -> Result<Option<&'a str>, MasterError> {
    match (peer, forwarded) {
        (_, Some(cn)) if !trust_forwarded => Err(MasterError::Unauthorized {
            claimed: node_name.to_string(),
            identity: format!("untrusted {} header '{}'", CLIENT_CN_HEADER, cn),
        }),
        (Some(peer), _) => Ok(Some(peer.name())),
        (None, forwarded) => Ok(forwarded),
    }
}

/// Liveness probe
pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Prometheus exposition
pub async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], state.metrics.render())
}

/// Direct label report from a node agent
pub async fn set_labels(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    extensions: Extensions,
    headers: HeaderMap,
    Json(mut request): Json<SetLabelsRequest>,
) -> Response {
    if request.node_name.is_empty() {
        request.node_name = name.clone();
    }
    if request.node_name != name {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: format!("node name '{}' does not match path '{}'", request.node_name, name),
            }),
        )
            .into_response();
    }

    let forwarded = headers.get(CLIENT_CN_HEADER).and_then(|v| v.to_str().ok());
    let authorized = resolve_identity(
        extensions.get::<ClientIdentity>(),
        forwarded,
        state.trust_identity_header,
        &request.node_name,
    )
    .and_then(|identity| authorize(state.verify_node_name, identity, &request.node_name));
    if let Err(e) = authorized {
        warn!("Rejecting report: {}", e);
        return e.into_response();
    }

    debug!("Received labels for node {}", request.node_name);
    match state.master.set_labels(&request).await {
        Ok(outcome) => {
            debug!("Report for node {}: {:?}", request.node_name, outcome);
            (StatusCode::OK, Json(serde_json::json!({}))).into_response()
        }
        Err(e) => {
            warn!("Failed to apply report for node {}: {}", request.node_name, e);
            e.into_response()
        }
    }
}

/// Create the Axum router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/nodes/{name}/labels", post(set_labels))
        .with_state(state)
}
