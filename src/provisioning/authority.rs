//! Registration authority and key-management platform client
//!
//! Both services speak JSON over HTTP:
//! - `POST {ra}/register` accepts the device's encrypted seed
//! - `GET {platform}/identificationinfo/identificationinfo/keys?id=..`
//!   returns issued key material, empty until an operator approves it

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AddrConfig, Config};

use super::ProvisioningRequest;

#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Malformed response: {0}")]
    Decode(String),
}

/// Body of `POST /register`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBody {
    pub id: String,
    pub username: String,
    pub eid: String,
    /// Base64 of the identity-based ciphertext of the seed
    pub random: String,
    pub device_type: String,
}

impl From<&ProvisioningRequest> for RegisterBody {
    fn from(req: &ProvisioningRequest) -> Self {
        Self {
            id: req.id.clone(),
            username: req.device_name.clone(),
            eid: req.eid.clone(),
            random: BASE64.encode(&req.encrypted_seed),
            device_type: req.device_type.clone(),
        }
    }
}

/// Key material as issued: hex of the seed-encrypted DER keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedKeys {
    #[serde(rename = "signkey", default)]
    pub sign_key: String,
    #[serde(rename = "encryptkey", default)]
    pub encrypt_key: String,
}

impl IssuedKeys {
    /// Both keys have been issued. Blank fields mean "not yet".
    pub fn is_ready(&self) -> bool {
        !self.sign_key.trim().is_empty() && !self.encrypt_key.trim().is_empty()
    }
}

/// Envelope of the key query response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct KeyResponse {
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub data: Option<IssuedKeys>,
}

/// The two external services provisioning talks to.
#[async_trait]
pub trait KeyAuthority: Send + Sync {
    /// Submit a registration / key application.
    async fn register(&self, request: &ProvisioningRequest) -> Result<(), AuthorityError>;

    /// Fetch whatever key material has been issued for `id` so far.
    async fn query_keys(&self, id: &str) -> Result<IssuedKeys, AuthorityError>;
}

/// `KeyAuthority` over HTTP.
pub struct HttpKeyAuthority {
    client: reqwest::Client,
    register_url: String,
    keys_url: String,
    timeout: Duration,
}

impl HttpKeyAuthority {
    /// Endpoints from `addr`, per-request timeout from `provisioning`.
    pub fn from_config(config: &Config) -> Result<Self, AuthorityError> {
        Self::new(
            &config.addr,
            Duration::from_secs(config.provisioning.request_timeout_secs),
        )
    }


    pub fn new(addr: &AddrConfig, timeout: Duration) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            register_url: addr.register_url(),
            keys_url: addr.keys_url(),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl KeyAuthority for HttpKeyAuthority {
    async fn register(&self, request: &ProvisioningRequest) -> Result<(), AuthorityError> {
        let body = RegisterBody::from(request);
        let response = self
            .client
            .post(&self.register_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityError::Status(status.as_u16()));
        }
        Ok(())
    }

    async fn query_keys(&self, id: &str) -> Result<IssuedKeys, AuthorityError> {
        let response = self
            .client
            .get(&self.keys_url)
            .query(&[("id", id)])
            .send()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;
        parse_key_response(&body)
    }
}

/// Decode a key query response body.
pub fn parse_key_response(body: &[u8]) -> Result<IssuedKeys, AuthorityError> {
    let response: KeyResponse =
        serde_json::from_slice(body).map_err(|e| AuthorityError::Decode(e.to_string()))?;
    Ok(response.data.unwrap_or_default())
}
