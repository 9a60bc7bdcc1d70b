//! Error taxonomy for the vault signer.
//!
//! Configuration errors are fatal at plugin initialization. Vault transport
//! errors are surfaced to the caller verbatim and never retried within a
//! single call. Renewal failures never appear here at all; the session's
//! re-authentication loop recovers them internally.

use crate::account::{Account, Address};

/// Result alias for backend operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration problems, detected in full before any vault connection is
/// attempted.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config must define at least one vault")]
    NoVaults,

    #[error("vault config is missing a url")]
    MissingVaultUrl,

    #[error("vault url {url:?} is not a valid url: {reason}")]
    InvalidVaultUrl { url: String, reason: String },

    #[error("vault {vault} is missing an account config directory")]
    MissingAccountDir { vault: String },

    #[error("vault {vault} must define at least one auth entry")]
    NoAuthConfig { vault: String },

    #[error("vault {vault} defines authID {auth_id:?} more than once")]
    DuplicateAuthId { vault: String, auth_id: String },

    #[error("invalid unlock address {addr:?} for vault {vault}")]
    InvalidUnlockAddress { vault: String, addr: String },

    #[error("invalid new-account request: {0}")]
    InvalidNewAccount(String),

    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures talking to (or interpreting) the secret store.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error(
        "environment variables are necessary to authenticate with the vault: \
         set {role_id_env} and {secret_id_env} if using approle authentication, \
         else set {token_env}"
    )]
    NoCredentials {
        role_id_env: String,
        secret_id_env: String,
        token_env: String,
    },

    #[error(
        "both {role_id_env} and {secret_id_env} environment variables must be \
         set if using approle authentication"
    )]
    IncompleteAppRole {
        role_id_env: String,
        secret_id_env: String,
    },

    #[error("no session configured for vault {vault} and authID {auth_id:?}")]
    UnknownAuthId { vault: String, auth_id: String },

    #[error("unable to load TLS material from {path}: {source}")]
    TlsMaterial {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("vault request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("vault returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed vault response: {0}")]
    MalformedResponse(String),

    #[error("no data for secret in vault")]
    MissingSecret,

    #[error("secret was written but the response version is unusable: secret uri: {uri}")]
    WriteOpaque { uri: String },

    #[error("secret written to vault but unable to write account file: secret uri: {uri}: {source}")]
    StoredKeyFileFailed {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no vault configured with address {0}")]
    UnknownVault(String),
}

/// Account lookup failures. Surfaced without side effects.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no key for given address or file")]
    NoMatch,

    #[error("multiple keys match address ({})", format_matches(.matches))]
    Ambiguous {
        address: Address,
        matches: Vec<Account>,
    },
}

fn format_matches(matches: &[Account]) -> String {
    matches
        .iter()
        .map(|a| a.url.path.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Wallet-level failures.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("unknown wallet: {0}")]
    UnknownWallet(String),

    #[error("wallet has been dropped")]
    Dropped,

    #[error("account is locked; unlock it or sign with a passphrase")]
    Locked,

    #[error("recovered key has address {have}, metadata declares {want}")]
    AddressMismatch { have: Address, want: Address },

    #[error("account {0} is not contained in this wallet")]
    NotContained(Account),

    #[error("account metadata mismatch: file {path} declares {have}, requested {want}")]
    MetadataMismatch {
        path: String,
        have: Address,
        want: Address,
    },

    #[error("unable to read account metadata {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("account metadata {path} is invalid: {reason}")]
    InvalidMetadata { path: String, reason: String },
}

/// Top-level error for backend operations, aggregating the layer taxonomies.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Tx(#[from] crate::tx::TxError),

    #[error("key error: {0}")]
    Key(#[from] qvs_crypto_secp256k1::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::WalletUrl;

    #[test]
    fn test_ambiguous_lists_paths() {
        let addr = Address([1u8; 20]);
        let err = CacheError::Ambiguous {
            address: addr,
            matches: vec![
                Account::new(addr, WalletUrl::parse("file://v:1/a.json")),
                Account::new(addr, WalletUrl::parse("file://v:1/b.json")),
            ],
        };
        assert_eq!(
            err.to_string(),
            "multiple keys match address (/a.json, /b.json)"
        );
    }

    #[test]
    fn test_credentials_error_names_env_vars() {
        let err = VaultError::NoCredentials {
            role_id_env: "FOO_QRM_HASHIVLT_ROLE_ID".into(),
            secret_id_env: "FOO_QRM_HASHIVLT_SECRET_ID".into(),
            token_env: "FOO_QRM_HASHIVLT_TOKEN".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("FOO_QRM_HASHIVLT_ROLE_ID"));
        assert!(msg.contains("FOO_QRM_HASHIVLT_TOKEN"));
    }
}
