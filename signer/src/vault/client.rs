//! HTTP client for a KV-v2 secret store.
//!
//! This is the thin transport layer: approle login, token self-renewal, and
//! versioned secret reads/writes against the `/v1` API. Interpretation of
//! secret payloads lives in the session layer.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::config::TlsConfig;
use crate::error::VaultError;

/// Timeout applied to every vault request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const TOKEN_HEADER: &str = "X-Vault-Token";

/// An issued auth token with its lease terms.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthLease {
    pub client_token: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: AuthLease,
}

/// A TLS-configured HTTP client bound to one vault endpoint.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    base: String,
}

impl VaultClient {
    pub fn new(vault_url: &str, tls: &TlsConfig) -> Result<Self, VaultError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT);

        if let Some(ca) = &tls.ca_cert {
            let pem = read_tls(ca)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
            let mut pem = read_tls(cert)?;
            pem.extend_from_slice(&read_tls(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        Ok(Self {
            http: builder.build()?,
            base: vault_url.trim_end_matches('/').to_string(),
        })
    }

    /// The base URL of the vault endpoint.
    pub fn address(&self) -> &str {
        &self.base
    }

    /// The URI of a secret location, without a version qualifier.
    pub fn secret_uri(&self, engine_path: &str, secret_path: &str) -> String {
        format!("{}/v1/{}/data/{}", self.base, engine_path, secret_path)
    }

    /// Exchange approle credentials for a token lease.
    pub async fn approle_login(
        &self,
        approle_path: &str,
        role_id: &str,
        secret_id: &str,
    ) -> Result<AuthLease, VaultError> {
        let approle = if approle_path.is_empty() {
            "approle"
        } else {
            approle_path
        };
        let url = format!("{}/v1/auth/{}/login", self.base, approle);

        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({"role_id": role_id, "secret_id": secret_id}))
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(response.json::<AuthResponse>().await?.auth)
    }

    /// Renew the calling token's lease.
    pub async fn renew_self(&self, token: &str) -> Result<AuthLease, VaultError> {
        let url = format!("{}/v1/auth/token/renew-self", self.base);

        let response = self
            .http
            .post(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(response.json::<AuthResponse>().await?.auth)
    }

    /// Read one version of a secret. Returns the full response body.
    pub async fn read_secret(
        &self,
        token: &str,
        engine_path: &str,
        secret_path: &str,
        version: u64,
    ) -> Result<Value, VaultError> {
        let url = format!(
            "{}/v1/{}/data/{}?version={}",
            self.base, engine_path, secret_path, version
        );

        let response = self
            .http
            .get(&url)
            .header(TOKEN_HEADER, token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VaultError::MissingSecret);
        }
        let response = check_status(response).await?;

        Ok(response.json().await?)
    }

    /// Write a secret. Returns the full response body, which carries the
    /// version the write produced.
    pub async fn write_secret(
        &self,
        token: &str,
        engine_path: &str,
        secret_path: &str,
        body: &Value,
    ) -> Result<Value, VaultError> {
        let url = format!("{}/v1/{}/data/{}", self.base, engine_path, secret_path);

        let response = self
            .http
            .post(&url)
            .header(TOKEN_HEADER, token)
            .json(body)
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(response.json().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VaultError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(VaultError::Status {
        status: status.as_u16(),
        message,
    })
}

fn read_tls(path: &Path) -> Result<Vec<u8>, VaultError> {
    fs::read(path).map_err(|source| VaultError::TlsMaterial {
        path: path.display().to_string(),
        source,
    })
}
