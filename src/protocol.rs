//! Wire types for the request/response surface.
//!
//! Every response body is wrapped in an envelope `{code, data, msg}` where
//! code `0` denotes success and any other value is one of the registry
//! codes carried by [`KvError`](crate::error::KvError). The same types are
//! used by the server handlers and the client library, so the two sides
//! cannot drift apart.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::KvError;

/// Envelope code for a successful response.
pub const CODE_OK: i32 = 0;

/// The uniform response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub data: Option<T>,
    pub msg: String,
}

impl<T> ApiResponse<T> {
    /// A successful response carrying a payload.
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_OK,
            data: Some(data),
            msg: "ok".to_string(),
        }
    }

    /// A successful response with an empty payload.
    pub fn empty() -> Self {
        Self {
            code: CODE_OK,
            data: None,
            msg: "ok".to_string(),
        }
    }

    /// An error response built from the shared error taxonomy.
    pub fn err(err: &KvError) -> Self {
        Self {
            code: err.code(),
            data: None,
            msg: err.to_string(),
        }
    }
}

/// Body of `PUT /v1/key`. The value travels base64 encoded so arbitrary
/// bytes survive the JSON envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub ttl: i64,
}

/// Payload of `GET /v1/key`. `ttl_remaining` is `-1` when no expiration is
/// set.
#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: String,
    pub ttl_remaining: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TtlResponse {
    pub ttl: i64,
}

/// Counter snapshot returned by `GET /v1/stats`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub keys: usize,
    pub memory: i64,
    pub hits: u64,
    pub misses: u64,
    pub requests: BTreeMap<String, u64>,
    pub uptime: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub status: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
