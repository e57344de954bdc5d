//! HTTP client for the key-value service.
//!
//! Speaks the `{code, data, msg}` envelope: transport-level failures and
//! non-zero envelope codes both surface as [`ClientError`].

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::protocol::{
    ApiResponse, ExistsResponse, GetResponse, SetRequest, SnapshotResponse, StatsResponse,
    TtlResponse, CODE_OK,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-zero envelope code.
    #[error("server error {code}: {msg}")]
    Api { code: i32, msg: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClientError {
    /// Envelope code of a server-side error, if that is what this is.
    pub fn api_code(&self) -> Option<i32> {
        match self {
            ClientError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A thin wrapper over one server endpoint.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(host: &str, port: u16) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url: format!("http://{host}:{port}"),
            http,
        })
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: i64) -> Result<(), ClientError> {
        let body = SetRequest {
            key: key.to_string(),
            value: BASE64.encode(value),
            ttl,
        };
        self.call::<serde_json::Value>(self.http.put(self.url("/v1/key")).json(&body))
            .await?;
        Ok(())
    }

    /// Fetches a value and its remaining TTL (`-1` for no expiry).
    pub async fn get(&self, key: &str) -> Result<(Vec<u8>, i64), ClientError> {
        let data: GetResponse = self
            .call(self.http.get(self.url("/v1/key")).query(&[("k", key)]))
            .await?
            .ok_or_else(|| ClientError::Malformed("get response without data".to_string()))?;
        let value = BASE64
            .decode(data.value.as_bytes())
            .map_err(|_| ClientError::Malformed("value is not base64".to_string()))?;
        Ok((value, data.ttl_remaining))
    }

    pub async fn delete(&self, key: &str) -> Result<(), ClientError> {
        self.call::<serde_json::Value>(
            self.http.delete(self.url("/v1/key")).query(&[("k", key)]),
        )
        .await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        let data: ExistsResponse = self
            .call(self.http.get(self.url("/v1/exists")).query(&[("k", key)]))
            .await?
            .ok_or_else(|| ClientError::Malformed("exists response without data".to_string()))?;
        Ok(data.exists)
    }

    pub async fn ttl(&self, key: &str) -> Result<i64, ClientError> {
        let data: TtlResponse = self
            .call(self.http.get(self.url("/v1/ttl")).query(&[("k", key)]))
            .await?
            .ok_or_else(|| ClientError::Malformed("ttl response without data".to_string()))?;
        Ok(data.ttl)
    }

    pub async fn stats(&self) -> Result<StatsResponse, ClientError> {
        self.call(self.http.get(self.url("/v1/stats")))
            .await?
            .ok_or_else(|| ClientError::Malformed("stats response without data".to_string()))
    }

    pub async fn snapshot(&self) -> Result<SnapshotResponse, ClientError> {
        self.call(self.http.post(self.url("/v1/snapshot")))
            .await?
            .ok_or_else(|| ClientError::Malformed("snapshot response without data".to_string()))
    }

    pub async fn health(&self) -> Result<(), ClientError> {
        self.call::<serde_json::Value>(self.http.get(self.url("/v1/health")))
            .await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, ClientError> {
        let response = request.send().await?;
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        if envelope.code != CODE_OK {
            return Err(ClientError::Api {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        Ok(envelope.data)
    }
}
