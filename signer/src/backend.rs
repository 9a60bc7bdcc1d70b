//! The account backend: one assembly per configured vault, routing by
//! wallet URL or account specifier, and account creation.
//!
//! Each vault brings its own session pool, account cache, wallet registry
//! and unlock manager. The backend multiplexes the signing API across them
//! and owns the shared event bus.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qvs_crypto_secp256k1::Keypair;
use tracing::{debug, info};
use uuid::Uuid;

use crate::account::Account;
use crate::cache::{AccountCache, ChangeListener, Unlocker};
use crate::config::{
    AccountMetadata, PluginConfig, VaultConfig, VaultSecretConfig, METADATA_VERSION,
};
use crate::error::{CacheError, ConfigError, Error, VaultError, WalletError};
use crate::events::{EventBus, Subscription};
use crate::unlock::UnlockManager;
use crate::vault::SessionPool;
use crate::wallet::Wallet;

/// Keeps one wallet per cached account, creating and retiring them as the
/// cache reports membership changes, and publishes the lifecycle events.
struct WalletRegistry {
    wallets: Mutex<std::collections::BTreeMap<String, Arc<Wallet>>>,
    bus: EventBus,
    unlock: Arc<UnlockManager>,
}

impl WalletRegistry {
    fn new(bus: EventBus, unlock: Arc<UnlockManager>) -> Self {
        Self {
            wallets: Mutex::new(std::collections::BTreeMap::new()),
            bus,
            unlock,
        }
    }

    fn get(&self, url: &str) -> Option<Arc<Wallet>> {
        self.lock().get(url).cloned()
    }

    fn all(&self) -> Vec<Arc<Wallet>> {
        // BTreeMap iteration is already URL-ordered
        self.lock().values().cloned().collect()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::BTreeMap<String, Arc<Wallet>>> {
        self.wallets.lock().expect("wallet registry poisoned")
    }
}

impl ChangeListener for WalletRegistry {
    fn account_arrived(&self, account: &Account, initial: bool) {
        let url = account.url.to_string();
        let wallet = Wallet::new(account.clone(), self.unlock.clone(), self.bus.clone());
        self.lock().insert(url.clone(), wallet);
        if !initial {
            self.bus.wallet_arrived(&url);
        }
    }

    fn account_dropped(&self, account: &Account) {
        let url = account.url.to_string();
        if let Some(wallet) = self.lock().remove(&url) {
            wallet.mark_dropped();
            self.bus.wallet_dropped(&url);
        }
    }
}

/// Bridges cache arrivals to the unlock manager without blocking the scan.
struct AutoUnlocker {
    unlock: Arc<UnlockManager>,
}

impl Unlocker for AutoUnlocker {
    fn unlock_indefinitely(&self, account: &Account) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let unlock = self.unlock.clone();
        let account = account.clone();
        handle.spawn(async move {
            match unlock.timed_unlock(&account, "", Duration::ZERO).await {
                Ok(()) => debug!(account = %account, "auto-unlocked configured account"),
                Err(e) => debug!(account = %account, error = %e, "failed to auto-unlock account"),
            }
        });
    }
}

/// Everything the backend runs for one configured vault.
pub struct VaultAccounts {
    url: String,
    dir: PathBuf,
    sessions: Arc<SessionPool>,
    unlock: Arc<UnlockManager>,
    registry: Arc<WalletRegistry>,
    cache: Arc<AccountCache>,
}

impl VaultAccounts {
    /// Authenticate the vault's sessions, load the account directory, and
    /// start watching it. Authentication failure here is fatal.
    pub async fn open(config: &VaultConfig, bus: EventBus) -> Result<Arc<Self>, Error> {
        let sessions = Arc::new(SessionPool::new(config).await?);
        let unlock = Arc::new(UnlockManager::new(sessions.clone()));
        let registry = Arc::new(WalletRegistry::new(bus, unlock.clone()));
        let cache = Arc::new(AccountCache::new(
            config.url.clone(),
            config.account_config_dir.clone(),
            registry.clone(),
            Arc::new(AutoUnlocker {
                unlock: unlock.clone(),
            }),
            config.unlock_addresses(),
        ));
        cache.start();

        info!(vault = %config.url, dir = %config.account_config_dir.display(), "vault account backend ready");

        Ok(Arc::new(Self {
            url: config.url.clone(),
            dir: config.account_config_dir.clone(),
            sessions,
            unlock,
            registry,
            cache,
        }))
    }

    pub fn vault_url(&self) -> &str {
        &self.url
    }

    pub fn wallet(&self, url: &str) -> Option<Arc<Wallet>> {
        self.cache.maybe_reload();
        self.registry.get(url)
    }

    pub fn wallets(&self) -> Vec<Arc<Wallet>> {
        self.cache.maybe_reload();
        self.registry.all()
    }

    pub fn find(&self, target: &Account) -> Result<Account, CacheError> {
        self.cache.find(target)
    }

    pub fn unlock_manager(&self) -> &Arc<UnlockManager> {
        &self.unlock
    }

    /// Generate a fresh key, store it in the vault, and write the metadata
    /// file that will make the account arrive in the cache.
    pub async fn new_account(
        &self,
        secret: VaultSecretConfig,
    ) -> Result<(Account, String), Error> {
        self.store_key(secret, Keypair::generate()).await
    }

    /// Store an externally supplied raw key.
    pub async fn import_raw_key(
        &self,
        secret: VaultSecretConfig,
        raw_key_hex: &str,
    ) -> Result<(Account, String), Error> {
        let keypair = Keypair::from_hex(raw_key_hex)?;
        self.store_key(secret, keypair).await
    }

    async fn store_key(
        &self,
        mut secret: VaultSecretConfig,
        keypair: Keypair,
    ) -> Result<(Account, String), Error> {
        secret
            .validate_for_creation()
            .map_err(ConfigError::InvalidNewAccount)?;

        let session = self.sessions.lookup(&secret.auth_id)?;
        let address_hex = hex::encode(keypair.address());
        let key_hex = keypair.to_hex();

        let (secret_uri, version) = session
            .write_secret(&secret, &address_hex, &key_hex)
            .await?;

        // Record the version the write produced so reads pin to it
        secret.secret_version = version;
        let metadata = AccountMetadata {
            address: address_hex.clone(),
            vault_secret: secret,
            id: Uuid::new_v4().to_string(),
            version: METADATA_VERSION,
        };

        let path = self.dir.join(keyfile_name(&address_hex));
        metadata
            .save(&path)
            .map_err(|source| VaultError::StoredKeyFileFailed {
                uri: secret_uri.clone(),
                source,
            })?;

        let account = metadata
            .to_account(&self.url, &path)
            .map_err(|reason| WalletError::InvalidMetadata {
                path: path.display().to_string(),
                reason,
            })?;

        Ok((account, secret_uri))
    }
}

impl Drop for VaultAccounts {
    fn drop(&mut self) {
        // The watcher task holds the cache alive; stop it explicitly
        self.cache.close();
    }
}

/// Keyfile naming in the keystore convention: creation time then address.
fn keyfile_name(address_hex: &str) -> String {
    format!(
        "UTC--{}--{}",
        chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.9fZ"),
        address_hex
    )
}

/// The account backend the RPC adapter drives.
pub struct Backend {
    vaults: Vec<Arc<VaultAccounts>>,
    bus: EventBus,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl Backend {
    /// Build the backend from validated configuration. Every declared
    /// session must authenticate for initialization to succeed.
    pub async fn new(config: &PluginConfig) -> Result<Self, Error> {
        let bus = EventBus::new(4 * config.vaults.len());

        let mut vaults = Vec::with_capacity(config.vaults.len());
        for vault_config in &config.vaults {
            vaults.push(VaultAccounts::open(vault_config, bus.clone()).await?);
        }

        Ok(Self { vaults, bus })
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// All wallets across every vault, URL-sorted.
    pub fn wallets(&self) -> Vec<Arc<Wallet>> {
        let mut wallets: Vec<Arc<Wallet>> =
            self.vaults.iter().flat_map(|v| v.wallets()).collect();
        wallets.sort_by_key(|w| w.url_string());
        wallets
    }

    /// The wallet serving the given URL.
    pub fn wallet(&self, url: &str) -> Result<Arc<Wallet>, Error> {
        for vault in &self.vaults {
            if let Some(wallet) = vault.wallet(url) {
                return Ok(wallet);
            }
        }
        Err(WalletError::UnknownWallet(url.to_string()).into())
    }

    /// Resolve an account specifier to its owning vault and unique account.
    fn find_account(&self, target: &Account) -> Result<(Arc<VaultAccounts>, Account), Error> {
        for vault in &self.vaults {
            match vault.find(target) {
                Ok(account) => return Ok((vault.clone(), account)),
                Err(CacheError::NoMatch) => continue,
                Err(ambiguous) => return Err(ambiguous.into()),
            }
        }
        Err(CacheError::NoMatch.into())
    }

    pub async fn timed_unlock(
        &self,
        target: &Account,
        passphrase: &str,
        duration: Duration,
    ) -> Result<(), Error> {
        let (vault, account) = self.find_account(target)?;
        vault
            .unlock_manager()
            .timed_unlock(&account, passphrase, duration)
            .await
    }

    pub async fn lock(&self, target: &Account) -> Result<(), Error> {
        match self.find_account(target) {
            Ok((vault, account)) => {
                vault.unlock_manager().lock(account.address);
                Ok(())
            }
            // Locking an unknown account is a no-op, not an error
            Err(Error::Cache(CacheError::NoMatch)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The vault assembly that creates accounts for the given vault address.
    pub fn account_creator(&self, vault_url: &str) -> Result<&Arc<VaultAccounts>, Error> {
        self.vaults
            .iter()
            .find(|v| v.vault_url() == vault_url)
            .ok_or_else(|| VaultError::UnknownVault(vault_url.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyfile_name_shape() {
        let name = keyfile_name("9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f");
        assert!(name.starts_with("UTC--"));
        assert!(name.ends_with("--9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f"));
    }
}
