//! HTTP transport for the key-value service.
//!
//! Routes:
//!
//! | Method & path        | Operation            |
//! |----------------------|----------------------|
//! | `PUT /v1/key`        | set (JSON body)      |
//! | `GET /v1/key?k=`     | get                  |
//! | `DELETE /v1/key?k=`  | delete               |
//! | `GET /v1/exists?k=`  | existence test       |
//! | `GET /v1/ttl?k=`     | remaining TTL        |
//! | `GET /v1/stats`      | counters             |
//! | `POST /v1/snapshot`  | manual snapshot      |
//! | `GET /v1/health`     | liveness             |
//!
//! Every body is the `{code, data, msg}` envelope; the HTTP status is
//! derived from the error code, so clients can follow either.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;

use crate::error::KvError;
use crate::protocol::{
    ApiResponse, ExistsResponse, GetResponse, HealthResponse, SetRequest, SnapshotResponse,
    StatsResponse, TtlResponse,
};
use crate::service::KvService;

/// Builds the router over a running service.
pub fn router(svc: Arc<KvService>) -> Router {
    Router::new()
        .route("/v1/key", put(set_key).get(get_key).delete(delete_key))
        .route("/v1/exists", get(exists))
        .route("/v1/ttl", get(ttl))
        .route("/v1/stats", get(stats))
        .route("/v1/snapshot", post(snapshot))
        .route("/v1/health", get(health))
        .with_state(svc)
}

/// Wrapper so `?` on service calls produces an enveloped error response.
struct ApiError(KvError);

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ApiResponse::<()>::err(&self.0))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    k: Option<String>,
}

impl KeyQuery {
    fn key(self) -> Result<String, ApiError> {
        self.k
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ApiError(KvError::InvalidRequest("missing key".to_string())))
    }
}

async fn set_key(
    State(svc): State<Arc<KvService>>,
    payload: Result<Json<SetRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let Json(req) = payload
        .map_err(|_| ApiError(KvError::InvalidRequest("invalid json body".to_string())))?;
    let value = BASE64
        .decode(req.value.as_bytes())
        .map_err(|_| ApiError(KvError::InvalidRequest("value must be base64".to_string())))?;
    svc.set(&req.key, Bytes::from(value), req.ttl)?;
    Ok(Json(ApiResponse::empty()))
}

async fn get_key(
    State(svc): State<Arc<KvService>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ApiResponse<GetResponse>>, ApiError> {
    let key = query.key()?;
    let (value, ttl_remaining) = svc.get(&key)?;
    Ok(Json(ApiResponse::ok(GetResponse {
        value: BASE64.encode(&value),
        ttl_remaining,
    })))
}

async fn delete_key(
    State(svc): State<Arc<KvService>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let key = query.key()?;
    svc.delete(&key)?;
    Ok(Json(ApiResponse::empty()))
}

async fn exists(
    State(svc): State<Arc<KvService>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ApiResponse<ExistsResponse>>, ApiError> {
    let key = query.key()?;
    let exists = svc.exists(&key)?;
    Ok(Json(ApiResponse::ok(ExistsResponse { exists })))
}

async fn ttl(
    State(svc): State<Arc<KvService>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ApiResponse<TtlResponse>>, ApiError> {
    let key = query.key()?;
    let ttl = svc.ttl(&key)?;
    Ok(Json(ApiResponse::ok(TtlResponse { ttl })))
}

async fn stats(State(svc): State<Arc<KvService>>) -> Json<ApiResponse<StatsResponse>> {
    Json(ApiResponse::ok(svc.stats()))
}

async fn snapshot(
    State(svc): State<Arc<KvService>>,
) -> Result<Json<ApiResponse<SnapshotResponse>>, ApiError> {
    let path = svc.snapshot()?;
    Ok(Json(ApiResponse::ok(SnapshotResponse {
        status: "ok".to_string(),
        path: path.to_string_lossy().into_owned(),
    })))
}

async fn health() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::ok(HealthResponse {
        status: "healthy".to_string(),
    }))
}
