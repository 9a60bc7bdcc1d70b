//! Plugin configuration and account metadata files.
//!
//! The host hands the plugin its configuration as raw JSON bytes at `Init`.
//! Validation is total and happens before any vault connection is attempted.
//! Account metadata files are small JSON documents in each vault's account
//! config directory, one per account, pointing at the vault secret that
//! holds the private key.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::account::{Account, Address, WalletUrl};
use crate::error::ConfigError;

/// Current metadata file schema version.
pub const METADATA_VERSION: u32 = 1;

/// Top-level plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub vaults: Vec<VaultConfig>,
}

impl PluginConfig {
    /// Parse and validate raw configuration bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vaults.is_empty() {
            return Err(ConfigError::NoVaults);
        }
        for vault in &self.vaults {
            vault.validate()?;
        }
        Ok(())
    }
}

/// Configuration for one vault endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// Base URL of the vault server.
    pub url: String,

    /// Directory holding the account metadata files for this vault.
    pub account_config_dir: PathBuf,

    /// TLS material for vault communications.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Authentication credential sets, one session each.
    pub auth: Vec<AuthConfig>,

    /// Addresses to unlock indefinitely as soon as they arrive in the cache.
    #[serde(default)]
    pub unlocked_accounts: Vec<String>,
}

impl VaultConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingVaultUrl);
        }
        if let Err(e) = reqwest::Url::parse(&self.url) {
            return Err(ConfigError::InvalidVaultUrl {
                url: self.url.clone(),
                reason: e.to_string(),
            });
        }
        if self.account_config_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingAccountDir {
                vault: self.url.clone(),
            });
        }
        if self.auth.is_empty() {
            return Err(ConfigError::NoAuthConfig {
                vault: self.url.clone(),
            });
        }
        for (i, auth) in self.auth.iter().enumerate() {
            if self.auth[..i].iter().any(|a| a.auth_id == auth.auth_id) {
                return Err(ConfigError::DuplicateAuthId {
                    vault: self.url.clone(),
                    auth_id: auth.auth_id.clone(),
                });
            }
        }
        for addr in &self.unlocked_accounts {
            if Address::from_hex(addr).is_err() {
                return Err(ConfigError::InvalidUnlockAddress {
                    vault: self.url.clone(),
                    addr: addr.clone(),
                });
            }
        }
        Ok(())
    }

    /// The parsed auto-unlock list. Only valid after `validate`.
    pub fn unlock_addresses(&self) -> Vec<Address> {
        self.unlocked_accounts
            .iter()
            .filter_map(|a| Address::from_hex(a).ok())
            .collect()
    }
}

/// TLS material for the vault HTTP client. All fields optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

/// One authentication credential set for a vault.
///
/// The credentials themselves are read from the environment when the session
/// authenticates; this only names them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Names the credential set; prefixes the environment variable names.
    /// May be empty when a vault uses a single unprefixed credential set.
    #[serde(default, rename = "authID")]
    pub auth_id: String,

    /// Mount path of the approle auth method. Defaults to "approle".
    #[serde(default)]
    pub approle_path: String,
}

/// Where one account's key lives inside a vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSecretConfig {
    pub secret_engine_path: String,
    pub secret_path: String,
    #[serde(default)]
    pub secret_version: u64,
    #[serde(default, rename = "authID")]
    pub auth_id: String,
    #[serde(default)]
    pub insecure_skip_cas: bool,
    #[serde(default)]
    pub cas_value: u64,
}

impl VaultSecretConfig {
    /// Validation for configs arriving in account-creation requests, where
    /// the version is assigned by the vault write.
    pub fn validate_for_creation(&self) -> Result<(), String> {
        if self.secret_engine_path.is_empty() {
            return Err("secretEnginePath must be set".to_string());
        }
        if self.secret_path.is_empty() {
            return Err("secretPath must be set".to_string());
        }
        Ok(())
    }
}

/// On-disk account metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountMetadata {
    /// Hex account address, no prefix required.
    pub address: String,
    pub vault_secret: VaultSecretConfig,
    /// Stable identifier assigned at creation.
    pub id: String,
    /// Metadata schema version.
    pub version: u32,
}

impl AccountMetadata {
    /// Decode one metadata file from bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Read and decode a metadata file.
    pub fn load(path: &Path) -> std::io::Result<Result<Self, serde_json::Error>> {
        let raw = fs::read(path)?;
        Ok(Self::from_bytes(&raw))
    }

    /// Semantic validation, applied to every decoded file before it can
    /// enter the account cache.
    pub fn validate(&self) -> Result<(), String> {
        Address::from_hex(&self.address).map_err(|e| e.to_string())?;
        self.vault_secret.validate_for_creation()?;
        if self.vault_secret.secret_version == 0 {
            return Err("secretVersion must be set".to_string());
        }
        Ok(())
    }

    /// The account this file describes, for the given vault endpoint.
    pub fn to_account(&self, vault_url: &str, path: &Path) -> Result<Account, String> {
        let address = Address::from_hex(&self.address).map_err(|e| e.to_string())?;
        Ok(Account::new(address, WalletUrl::new(vault_url, path)))
    }

    /// Write the metadata to `path` atomically: a temporary file in the same
    /// directory is written first, then renamed into place.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let contents = serde_json::to_vec(self)?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "account".to_string());
        let tmp_path = dir.join(format!(".{}.tmp{}", file_name, std::process::id()));

        fs::write(&tmp_path, &contents)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        match fs::rename(&tmp_path, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_config() -> &'static str {
        r#"{
            "vaults": [{
                "url": "https://vault.example:8200",
                "accountConfigDir": "/data/accts",
                "tls": {"caCert": "/tls/ca.pem"},
                "auth": [{"authID": "FOO", "approlePath": "approle"}],
                "unlockedAccounts": ["0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f"]
            }]
        }"#
    }

    #[test]
    fn test_parse_and_validate() {
        let config = PluginConfig::from_bytes(sample_config().as_bytes()).unwrap();
        assert_eq!(config.vaults.len(), 1);

        let vault = &config.vaults[0];
        assert_eq!(vault.url, "https://vault.example:8200");
        assert_eq!(vault.auth[0].auth_id, "FOO");
        assert_eq!(vault.tls.ca_cert, Some(PathBuf::from("/tls/ca.pem")));
        assert_eq!(vault.unlock_addresses().len(), 1);
    }

    #[test]
    fn test_rejects_empty_vaults() {
        let err = PluginConfig::from_bytes(br#"{"vaults": []}"#).unwrap_err();
        assert!(matches!(err, ConfigError::NoVaults));
    }

    #[test]
    fn test_rejects_unparseable_url() {
        let raw = r#"{"vaults": [{"url": "not a url", "accountConfigDir": "/d", "auth": [{}]}]}"#;
        let err = PluginConfig::from_bytes(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVaultUrl { .. }));
    }

    #[test]
    fn test_rejects_missing_auth() {
        let raw = r#"{"vaults": [{"url": "https://v:1", "accountConfigDir": "/d", "auth": []}]}"#;
        let err = PluginConfig::from_bytes(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::NoAuthConfig { .. }));
    }

    #[test]
    fn test_rejects_duplicate_auth_ids() {
        let raw = r#"{"vaults": [{
            "url": "https://v:1", "accountConfigDir": "/d",
            "auth": [{"authID": "A"}, {"authID": "A"}]
        }]}"#;
        let err = PluginConfig::from_bytes(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAuthId { .. }));
    }

    #[test]
    fn test_rejects_bad_unlock_address() {
        let raw = r#"{"vaults": [{
            "url": "https://v:1", "accountConfigDir": "/d",
            "auth": [{}], "unlockedAccounts": ["nope"]
        }]}"#;
        let err = PluginConfig::from_bytes(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUnlockAddress { .. }));
    }

    fn sample_metadata() -> AccountMetadata {
        AccountMetadata {
            address: "9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f".to_string(),
            vault_secret: VaultSecretConfig {
                secret_engine_path: "secret".to_string(),
                secret_path: "myacct".to_string(),
                secret_version: 1,
                auth_id: "FOO".to_string(),
                insecure_skip_cas: false,
                cas_value: 0,
            },
            id: "af5c8dd0-09d1-4d7b-a2ca-bbd84c97e031".to_string(),
            version: METADATA_VERSION,
        }
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acct1.json");

        let metadata = sample_metadata();
        metadata.save(&path).unwrap();

        let loaded = AccountMetadata::load(&path).unwrap().unwrap();
        assert_eq!(loaded.address, metadata.address);
        assert_eq!(loaded.vault_secret, metadata.vault_secret);
        loaded.validate().unwrap();

        // camelCase field names on disk
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("secretEnginePath"));
        assert!(raw.contains("authID"));
    }

    #[test]
    fn test_metadata_validation() {
        let mut bad = sample_metadata();
        bad.address = "xyz".to_string();
        assert!(bad.validate().is_err());

        let mut bad = sample_metadata();
        bad.vault_secret.secret_path.clear();
        assert!(bad.validate().is_err());

        let mut bad = sample_metadata();
        bad.vault_secret.secret_version = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_metadata_to_account() {
        let metadata = sample_metadata();
        let account = metadata
            .to_account("https://vault.example:8200", Path::new("/data/accts/acct1.json"))
            .unwrap();
        assert_eq!(
            account.url.to_string(),
            "file://vault.example:8200/data/accts/acct1.json"
        );
    }
}
