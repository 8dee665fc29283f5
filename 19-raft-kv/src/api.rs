//! HTTP surface of a node.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | PUT    | `/kv/{key}` | leader-only, body is the value, 204 |
//! | GET    | `/kv/{key}` | linearizable, 200 with the value or 404 |
//! | DELETE | `/kv/{key}` | leader-only, 404 if absent, 204 |
//! | GET    | `/status` | identity, peers and raft state |
//! | GET    | `/members` | configured members |
//! | POST   | `/join` | leader-only, `{"id", "address"}`, 204 |
//! | DELETE | `/members/{id}` | leader-only, 204 |
//!
//! Mutating routes sit behind the bearer gate. The core blocks on the
//! consensus engine, so handlers run it on the blocking thread pool.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{require_bearer, AuthGate};
use crate::error::{KvError, KvResult};
use crate::membership::{ClusterMember, NodeStatus};
use crate::service::KvService;

/// Raft address of the current leader, set on not-leader rejections.
pub const LEADER_HEADER: &str = "x-leader";

type AppState = Arc<KvService>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: u64,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub members: Vec<ClusterMember>,
}

pub fn router(service: Arc<KvService>, gate: AuthGate) -> Router {
    let auth = from_fn_with_state(gate, require_bearer);
    Router::new()
        .route(
            "/kv/*key",
            get(get_key).merge(put(put_key).delete(delete_key).route_layer(auth.clone())),
        )
        .route("/status", get(status))
        .route("/members", get(members))
        .route("/members/:id", delete(remove_member).route_layer(auth.clone()))
        .route("/join", post(join).route_layer(auth))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Runs blocking core code off the async runtime.
async fn blocking<T, F>(f: F) -> KvResult<T>
where
    F: FnOnce() -> KvResult<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f).await.map_err(|err| {
        warn!(error = %err, "request task failed");
        KvError::Internal(err.to_string())
    })?
}

/// `/kv/` with nothing after it is a request for the empty key.
async fn not_found(uri: Uri) -> Response {
    if uri.path() == "/kv/" {
        return KvError::EmptyKey.into_response();
    }
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

async fn put_key(
    State(service): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, KvError> {
    blocking(move || service.put(&key, body.to_vec())).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_key(
    State(service): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, KvError> {
    let value = blocking(move || service.get(&key)).await?;
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))],
        value,
    )
        .into_response())
}

async fn delete_key(
    State(service): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, KvError> {
    blocking(move || service.delete(&key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(service): State<AppState>) -> Json<NodeStatus> {
    Json(service.membership().status())
}

async fn members(State(service): State<AppState>) -> Json<MembersResponse> {
    Json(MembersResponse {
        members: service.membership().members(),
    })
}

async fn join(
    State(service): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> Result<StatusCode, KvError> {
    blocking(move || service.membership().join(request.id, &request.address)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(service): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, KvError> {
    blocking(move || service.membership().remove(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

impl IntoResponse for KvError {
    fn into_response(self) -> Response {
        let status = match &self {
            KvError::EmptyKey | KvError::NotLeader { .. } | KvError::InvalidMember(_) => {
                StatusCode::BAD_REQUEST
            }
            KvError::KeyNotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut response = (status, self.to_string()).into_response();
        let leader = self
            .leader_hint()
            .and_then(|leader| leader.address.as_deref())
            .and_then(|address| HeaderValue::from_str(address).ok());
        if let Some(value) = leader {
            response.headers_mut().insert(LEADER_HEADER, value);
        }
        response
    }
}
