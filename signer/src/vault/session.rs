//! Authenticated vault sessions and the per-vault session pool.
//!
//! One session exists per (vault, authID) pair. Token credentials are attached
//! directly; approle credentials are exchanged for a lease, and if the lease
//! is renewable a renewal driver keeps it alive. When renewal stops (error
//! or max-TTL) the driver re-reads the credentials from the environment and
//! re-authenticates, retrying forever at a fixed back-off. Reads and writes
//! keep using whatever token is currently installed, so callers never
//! observe a missing session after construction.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::{AuthConfig, VaultConfig, VaultSecretConfig};
use crate::error::VaultError;

use super::client::{AuthLease, VaultClient};

pub const DEFAULT_ROLE_ID_ENV: &str = "QRM_HASHIVLT_ROLE_ID";
pub const DEFAULT_SECRET_ID_ENV: &str = "QRM_HASHIVLT_SECRET_ID";
pub const DEFAULT_TOKEN_ENV: &str = "QRM_HASHIVLT_TOKEN";

/// Delay between re-authentication attempts.
const REAUTH_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Credentials read from the environment at authentication time.
#[derive(Debug)]
struct Credentials {
    role_id: String,
    secret_id: String,
    token: String,
}

impl Credentials {
    fn using_approle(&self) -> bool {
        !self.role_id.is_empty() && !self.secret_id.is_empty()
    }
}

fn apply_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

/// Read the credential set named by `auth_id` from the environment,
/// rejecting invalid combinations.
fn read_credentials(auth_id: &str) -> Result<Credentials, VaultError> {
    let role_id_env = apply_prefix(auth_id, DEFAULT_ROLE_ID_ENV);
    let secret_id_env = apply_prefix(auth_id, DEFAULT_SECRET_ID_ENV);
    let token_env = apply_prefix(auth_id, DEFAULT_TOKEN_ENV);

    let role_id = env::var(&role_id_env).unwrap_or_default();
    let secret_id = env::var(&secret_id_env).unwrap_or_default();
    let token = env::var(&token_env).unwrap_or_default();

    if role_id.is_empty() && secret_id.is_empty() && token.is_empty() {
        return Err(VaultError::NoCredentials {
            role_id_env,
            secret_id_env,
            token_env,
        });
    }

    if role_id.is_empty() != secret_id.is_empty() {
        return Err(VaultError::IncompleteAppRole {
            role_id_env,
            secret_id_env,
        });
    }

    Ok(Credentials {
        role_id,
        secret_id,
        token,
    })
}

/// One authenticated session against a vault endpoint.
pub struct Session {
    client: VaultClient,
    /// Current access token. Always either the most recently issued token or
    /// one whose renewal has succeeded since issue.
    token: RwLock<String>,
    auth: AuthConfig,
}

impl Session {
    /// Authenticate a new session for the given credential set. Returns the
    /// session together with its renewal driver, when the issued lease is
    /// renewable.
    async fn authenticate(
        client: VaultClient,
        auth: AuthConfig,
    ) -> Result<(Arc<Self>, Option<JoinHandle<()>>), VaultError> {
        let creds = read_credentials(&auth.auth_id)?;

        if !creds.using_approle() {
            let session = Arc::new(Self {
                client,
                token: RwLock::new(creds.token),
                auth,
            });
            return Ok((session, None));
        }

        let lease = client
            .approle_login(&auth.approle_path, &creds.role_id, &creds.secret_id)
            .await?;

        let session = Arc::new(Self {
            client,
            token: RwLock::new(lease.client_token.clone()),
            auth,
        });

        let driver = if lease.renewable {
            let renewing = Arc::clone(&session);
            Some(tokio::spawn(renewing.renewal_loop(lease)))
        } else {
            None
        };

        Ok((session, driver))
    }

    fn current_token(&self) -> String {
        self.token.read().expect("token lock poisoned").clone()
    }

    fn install_token(&self, token: String) {
        *self.token.write().expect("token lock poisoned") = token;
    }

    /// Drive renewal until it can no longer continue, then re-authenticate;
    /// repeat for the life of the session.
    async fn renewal_loop(self: Arc<Self>, mut lease: AuthLease) {
        loop {
            self.drive_renewal(&mut lease).await;

            debug!(
                auth_id = %self.auth.auth_id,
                "renewal of vault auth token stopped, attempting re-authentication"
            );
            lease = self.reauthenticate_forever().await;
        }
    }

    /// Renew ahead of expiry for as long as the lease allows it.
    async fn drive_renewal(&self, lease: &mut AuthLease) {
        while lease.renewable && lease.lease_duration > 0 {
            let wait = Duration::from_millis((lease.lease_duration * 1000 / 2).max(250));
            tokio::time::sleep(wait).await;

            match self.client.renew_self(&self.current_token()).await {
                Ok(renewed) => {
                    debug!(auth_id = %self.auth.auth_id, "successfully renewed vault auth token");
                    if !renewed.client_token.is_empty() {
                        self.install_token(renewed.client_token.clone());
                    }
                    *lease = renewed;
                }
                Err(e) => {
                    debug!(auth_id = %self.auth.auth_id, error = %e, "vault token renewal failed");
                    return;
                }
            }
        }
    }

    /// Re-read credentials and log in again, retrying indefinitely. Reads
    /// continue on the previously installed token while this runs.
    async fn reauthenticate_forever(&self) -> AuthLease {
        for attempt in 1u64.. {
            match self.reauthenticate().await {
                Ok(lease) => {
                    debug!(
                        auth_id = %self.auth.auth_id,
                        "successfully re-authenticated with vault"
                    );
                    return lease;
                }
                Err(e) => {
                    error!(
                        auth_id = %self.auth.auth_id,
                        attempt,
                        error = %e,
                        "unable to re-authenticate with vault"
                    );
                    tokio::time::sleep(REAUTH_RETRY_INTERVAL).await;
                }
            }
        }
        unreachable!("re-authentication retries forever")
    }

    async fn reauthenticate(&self) -> Result<AuthLease, VaultError> {
        let creds = read_credentials(&self.auth.auth_id)?;

        let lease = self
            .client
            .approle_login(&self.auth.approle_path, &creds.role_id, &creds.secret_id)
            .await?;
        self.install_token(lease.client_token.clone());
        Ok(lease)
    }

    /// Read the key hex stored at the given secret location.
    ///
    /// The secret's `data` payload must hold exactly one key/value pair and
    /// the value must be a string; anything else is a malformed response.
    pub async fn read_secret(&self, secret: &VaultSecretConfig) -> Result<String, VaultError> {
        let response = self
            .client
            .read_secret(
                &self.current_token(),
                &secret.secret_engine_path,
                &secret.secret_path,
                secret.secret_version,
            )
            .await?;

        narrow_secret_data(&response)
    }

    /// Write a key under the given secret location, with CAS semantics
    /// unless the config opts out. Returns the secret URI (including the new
    /// version) and the version itself.
    pub async fn write_secret(
        &self,
        secret: &VaultSecretConfig,
        address_hex: &str,
        key_hex: &str,
    ) -> Result<(String, u64), VaultError> {
        let mut body = serde_json::json!({
            "data": { address_hex: key_hex },
        });
        if !secret.insecure_skip_cas {
            body["options"] = serde_json::json!({ "cas": secret.cas_value });
        }

        let response = self
            .client
            .write_secret(
                &self.current_token(),
                &secret.secret_engine_path,
                &secret.secret_path,
                &body,
            )
            .await?;

        let uri = self
            .client
            .secret_uri(&secret.secret_engine_path, &secret.secret_path);

        let version = response
            .get("data")
            .and_then(|d| d.get("version"))
            .and_then(Value::as_u64)
            .ok_or(VaultError::WriteOpaque { uri: uri.clone() })?;

        Ok((format!("{}?version={}", uri, version), version))
    }
}

/// Narrow a KV-v2 read response down to the single stored string.
fn narrow_secret_data(response: &Value) -> Result<String, VaultError> {
    let data = response
        .get("data")
        .and_then(|d| d.get("data"))
        .and_then(Value::as_object)
        .ok_or_else(|| VaultError::MalformedResponse("response does not contain data".into()))?;

    if data.len() != 1 {
        return Err(VaultError::MalformedResponse(
            "only one key/value pair is allowed in each secret".into(),
        ));
    }

    let value = data.values().next().expect("len checked above");
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| VaultError::MalformedResponse("secret data is not in string format".into()))
}

/// All authenticated sessions for one vault, keyed by authID.
pub struct SessionPool {
    vault_url: String,
    sessions: HashMap<String, Arc<Session>>,
    drivers: Vec<JoinHandle<()>>,
}

impl SessionPool {
    /// Authenticate one session per declared auth config. Any authentication
    /// failure here is fatal for plugin initialization.
    pub async fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        let client = VaultClient::new(&config.url, &config.tls)?;

        let mut sessions = HashMap::with_capacity(config.auth.len());
        let mut drivers = Vec::new();
        for auth in &config.auth {
            let auth_id = auth.auth_id.clone();
            let (session, driver) = Session::authenticate(client.clone(), auth.clone()).await?;
            sessions.insert(auth_id, session);
            if let Some(driver) = driver {
                drivers.push(driver);
            }
        }

        Ok(Self {
            vault_url: config.url.clone(),
            sessions,
            drivers,
        })
    }

    /// The session authenticated for the given authID.
    pub fn lookup(&self, auth_id: &str) -> Result<&Arc<Session>, VaultError> {
        self.sessions
            .get(auth_id)
            .ok_or_else(|| VaultError::UnknownAuthId {
                vault: self.vault_url.clone(),
                auth_id: auth_id.to_string(),
            })
    }

    pub fn vault_url(&self) -> &str {
        &self.vault_url
    }

    /// A pool with no sessions, for exercising layers above without a vault.
    #[cfg(test)]
    pub(crate) fn for_tests(vault_url: &str) -> Self {
        Self {
            vault_url: vault_url.to_string(),
            sessions: HashMap::new(),
            drivers: Vec::new(),
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        for driver in &self.drivers {
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own authID so the env names cannot collide across
    // concurrently running tests.

    #[test]
    fn test_credentials_require_some_env() {
        let err = read_credentials("CRED_T1").unwrap_err();
        assert!(matches!(err, VaultError::NoCredentials { .. }));
    }

    #[test]
    fn test_credentials_token_only() {
        env::set_var("CRED_T2_QRM_HASHIVLT_TOKEN", "s.token");
        let creds = read_credentials("CRED_T2").unwrap();
        assert!(!creds.using_approle());
        assert_eq!(creds.token, "s.token");
    }

    #[test]
    fn test_credentials_approle_pair() {
        env::set_var("CRED_T3_QRM_HASHIVLT_ROLE_ID", "role");
        env::set_var("CRED_T3_QRM_HASHIVLT_SECRET_ID", "secret");
        let creds = read_credentials("CRED_T3").unwrap();
        assert!(creds.using_approle());
    }

    #[test]
    fn test_credentials_partial_approle_rejected() {
        env::set_var("CRED_T4_QRM_HASHIVLT_ROLE_ID", "role");
        let err = read_credentials("CRED_T4").unwrap_err();
        assert!(matches!(err, VaultError::IncompleteAppRole { .. }));
    }

    #[test]
    fn test_unprefixed_env_names() {
        assert_eq!(apply_prefix("", DEFAULT_TOKEN_ENV), "QRM_HASHIVLT_TOKEN");
        assert_eq!(
            apply_prefix("FOO", DEFAULT_TOKEN_ENV),
            "FOO_QRM_HASHIVLT_TOKEN"
        );
    }

    #[test]
    fn test_narrow_secret_data() {
        let ok = serde_json::json!({"data": {"data": {"addr": "cafe"}}});
        assert_eq!(narrow_secret_data(&ok).unwrap(), "cafe");

        let no_data = serde_json::json!({"data": {}});
        assert!(matches!(
            narrow_secret_data(&no_data),
            Err(VaultError::MalformedResponse(_))
        ));

        let two_pairs = serde_json::json!({"data": {"data": {"a": "1", "b": "2"}}});
        assert!(matches!(
            narrow_secret_data(&two_pairs),
            Err(VaultError::MalformedResponse(_))
        ));

        let not_string = serde_json::json!({"data": {"data": {"a": 7}}});
        assert!(matches!(
            narrow_secret_data(&not_string),
            Err(VaultError::MalformedResponse(_))
        ));
    }
}
