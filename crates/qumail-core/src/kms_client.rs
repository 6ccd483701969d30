//! Client for the remote key-management service.
//!
//! One POST per key, no retries. Retry policy belongs to the caller.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::key::{SymmetricKey, FALLBACK_KEY_ID};

pub const API_KEY_HEADER: &str = "X-API-KEY";
pub const DEFAULT_KEY_SIZE: usize = 32;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("KMS unreachable: {0}")]
    Unreachable(String),
    #[error("KMS rejected the request with status {0}")]
    Rejected(StatusCode),
    #[error("requested key size must be positive")]
    InvalidSize,
}

#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn fetch_key(&self, size_bytes: usize) -> Result<SymmetricKey, KmsError>;
}

#[derive(Clone)]
pub struct KmsConfig {
    pub endpoint: String,
    pub api_key: Zeroizing<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for KmsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsConfig")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct KeyResponse {
    #[serde(default, alias = "keyId", alias = "KeyId")]
    key_id: Option<String>,
    #[serde(default, alias = "keyBuffer", alias = "KeyBuffer")]
    key_buffer: Option<String>,
}

#[derive(Clone)]
pub struct KmsClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Zeroizing<String>,
}

impl KmsClient {
    pub fn new(config: &KmsConfig) -> Result<Self, KmsError> {
        let client = reqwest::Client::builder()
            .user_agent("qumail-client/0.1")
            .timeout(config.timeout)
            .build()
            .map_err(|e| KmsError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Reachability check: any HTTP response counts as online.
    pub async fn probe(&self) -> Result<StatusCode, KmsError> {
        let res = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| KmsError::Unreachable(e.to_string()))?;
        debug!(status = %res.status(), "kms probe answered");
        Ok(res.status())
    }
}

#[async_trait]
impl KeyProvider for KmsClient {
    async fn fetch_key(&self, size_bytes: usize) -> Result<SymmetricKey, KmsError> {
        if size_bytes == 0 {
            return Err(KmsError::InvalidSize);
        }
        let res = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(&serde_json::json!({ "size": size_bytes }))
            .send()
            .await
            .map_err(|e| KmsError::Unreachable(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            warn!(%status, "kms rejected key request");
            return Err(KmsError::Rejected(status));
        }

        let body = Zeroizing::new(
            res.bytes()
                .await
                .map_err(|e| KmsError::Unreachable(format!("read body: {e}")))?
                .to_vec(),
        );
        let parsed: KeyResponse = serde_json::from_slice(&body)
            .map_err(|e| KmsError::Unreachable(format!("parse response: {e}")))?;
        let encoded = parsed
            .key_buffer
            .map(Zeroizing::new)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| KmsError::Unreachable("response missing key_buffer".into()))?;
        let bytes = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| KmsError::Unreachable(format!("decode key_buffer: {e}")))?;
        if bytes.len() != size_bytes {
            let got = bytes.len();
            drop(Zeroizing::new(bytes));
            return Err(KmsError::Unreachable(format!(
                "key length mismatch: requested {size_bytes}, got {got}"
            )));
        }

        let key_id = parsed
            .key_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_KEY_ID.to_string());
        info!(key_id = %key_id, size = size_bytes, "kms key acquired");
        Ok(SymmetricKey::new(key_id, bytes))
    }
}
