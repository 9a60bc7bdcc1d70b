//! The unlock manager: decrypted keys held in memory, with timed eviction.
//!
//! Each unlocked entry carries a generation number. An expiry timer removes
//! its entry only while the generation still matches, so a newer unlock that
//! replaced an older one can never be evicted by the older timer. Signing
//! lifts the key out of the map first; the map lock is never held across a
//! vault call or a signing operation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qvs_crypto_secp256k1::Keypair;
use tokio::sync::oneshot;
use tracing::debug;

use crate::account::{Account, Address};
use crate::config::AccountMetadata;
use crate::error::{Error, WalletError};
use crate::vault::SessionPool;

struct Unlocked {
    keypair: Keypair,
    generation: u64,
    indefinite: bool,
    /// Cancels the expiry timer, for time-bounded entries.
    abort: Option<oneshot::Sender<()>>,
}

/// Holds decrypted private keys, optionally for a bounded duration.
pub struct UnlockManager {
    sessions: Arc<SessionPool>,
    unlocked: Mutex<HashMap<Address, Unlocked>>,
    next_generation: AtomicU64,
}

impl UnlockManager {
    pub fn new(sessions: Arc<SessionPool>) -> Self {
        Self {
            sessions,
            unlocked: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Fetch the account's key from the vault, verify it matches the account
    /// address, and keep it unlocked. A zero duration means indefinitely; an
    /// already-indefinite entry is never downgraded to a timed one.
    pub async fn timed_unlock(
        self: &Arc<Self>,
        account: &Account,
        _passphrase: &str,
        duration: Duration,
    ) -> Result<(), Error> {
        let keypair = self.fetch_key(account).await?;
        self.install(account.address, keypair, duration);
        Ok(())
    }

    /// Drop the key for `address`, cancelling any expiry timer.
    pub fn lock(&self, address: Address) {
        let removed = self.lock_map().remove(&address);
        if let Some(entry) = removed {
            if let Some(abort) = entry.abort {
                let _ = abort.send(());
            }
        }
    }

    /// Sign a 32-byte hash with the unlocked key for the account.
    pub fn sign(&self, account: &Account, hash: &[u8; 32]) -> Result<[u8; 65], Error> {
        let keypair = {
            let map = self.lock_map();
            let entry = map.get(&account.address).ok_or(WalletError::Locked)?;
            entry.keypair.clone()
        };
        // Sign outside the critical section
        Ok(keypair.sign_hash(hash))
    }

    /// Fetch, verify, sign, forget. The key never enters the unlocked map.
    pub async fn sign_with_passphrase(
        &self,
        account: &Account,
        _passphrase: &str,
        hash: &[u8; 32],
    ) -> Result<[u8; 65], Error> {
        let keypair = self.fetch_key(account).await?;
        Ok(keypair.sign_hash(hash))
    }

    pub fn is_unlocked(&self, address: Address) -> bool {
        self.lock_map().contains_key(&address)
    }

    /// Install an already-verified key. Exposed to the rest of the crate so
    /// expiry behavior is testable without a vault round-trip.
    pub(crate) fn install(self: &Arc<Self>, address: Address, keypair: Keypair, duration: Duration) {
        let mut map = self.lock_map();

        if let Some(existing) = map.get(&address) {
            if existing.indefinite && !duration.is_zero() {
                // An indefinite unlock is never downgraded to a timed one
                return;
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let abort = if duration.is_zero() {
            None
        } else {
            let (abort_tx, abort_rx) = oneshot::channel();
            let manager = Arc::clone(self);
            tokio::spawn(manager.expire(address, generation, duration, abort_rx));
            Some(abort_tx)
        };

        let previous = map.insert(
            address,
            Unlocked {
                keypair,
                generation,
                indefinite: duration.is_zero(),
                abort,
            },
        );
        if let Some(previous) = previous {
            if let Some(abort) = previous.abort {
                let _ = abort.send(());
            }
        }
    }

    async fn expire(
        self: Arc<Self>,
        address: Address,
        generation: u64,
        duration: Duration,
        mut abort: oneshot::Receiver<()>,
    ) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                let mut map = self.lock_map();
                // Only evict the same generation; a replacement keeps its own timer
                if map.get(&address).is_some_and(|e| e.generation == generation) {
                    map.remove(&address);
                    debug!(%address, "timed unlock expired");
                }
            }
            _ = &mut abort => {}
        }
    }

    /// Resolve the account's metadata file, read its key from the vault, and
    /// verify the recovered key really is for the requested address.
    pub(crate) async fn fetch_key(&self, account: &Account) -> Result<Keypair, Error> {
        let path = Path::new(&account.url.path);
        let decoded = AccountMetadata::load(path).map_err(|source| WalletError::Metadata {
            path: account.url.path.clone(),
            source,
        })?;
        let metadata = decoded.map_err(|e| WalletError::InvalidMetadata {
            path: account.url.path.clone(),
            reason: e.to_string(),
        })?;
        metadata.validate().map_err(|reason| WalletError::InvalidMetadata {
            path: account.url.path.clone(),
            reason,
        })?;

        // The file contents must describe the account we were asked about
        let declared = Address::from_hex(&metadata.address)
            .map_err(|e| WalletError::InvalidMetadata {
                path: account.url.path.clone(),
                reason: e.to_string(),
            })?;
        if declared != account.address {
            return Err(WalletError::MetadataMismatch {
                path: account.url.path.clone(),
                have: declared,
                want: account.address,
            }
            .into());
        }

        let session = self.sessions.lookup(&metadata.vault_secret.auth_id)?;
        let key_hex = session.read_secret(&metadata.vault_secret).await?;
        let keypair = Keypair::from_hex(&key_hex)?;

        let recovered = Address(keypair.address());
        if recovered != account.address {
            return Err(WalletError::AddressMismatch {
                have: recovered,
                want: account.address,
            }
            .into());
        }
        Ok(keypair)
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<Address, Unlocked>> {
        self.unlocked.lock().expect("unlock map poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::WalletUrl;
    use crate::vault::SessionPool;
    use tokio::time::{advance, Duration};

    fn manager() -> Arc<UnlockManager> {
        Arc::new(UnlockManager::new(Arc::new(SessionPool::for_tests(
            "https://vault.example:8200",
        ))))
    }

    fn account(keypair: &Keypair) -> Account {
        Account::new(
            Address(keypair.address()),
            WalletUrl::parse("file://vault.example:8200/accts/a.json"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_entry_expires() {
        let manager = manager();
        let keypair = Keypair::generate();
        let account = account(&keypair);

        manager.install(account.address, keypair, Duration::from_millis(500));
        assert!(manager.sign(&account, &[0u8; 32]).is_ok());

        advance(Duration::from_millis(250)).await;
        assert!(manager.sign(&account, &[0u8; 32]).is_ok());

        advance(Duration::from_millis(600)).await;
        // Yield so the expiry task runs after the advance
        tokio::task::yield_now().await;
        let err = manager.sign(&account, &[0u8; 32]).unwrap_err();
        assert!(matches!(err, Error::Wallet(WalletError::Locked)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_indefinite_entry_survives_until_lock() {
        let manager = manager();
        let keypair = Keypair::generate();
        let account = account(&keypair);

        manager.install(account.address, keypair, Duration::ZERO);

        advance(Duration::from_secs(3600)).await;
        tokio::task::yield_now().await;
        assert!(manager.sign(&account, &[0u8; 32]).is_ok());

        manager.lock(account.address);
        assert!(matches!(
            manager.sign(&account, &[0u8; 32]).unwrap_err(),
            Error::Wallet(WalletError::Locked)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_indefinite_not_downgraded_by_timed() {
        let manager = manager();
        let keypair = Keypair::generate();
        let account = account(&keypair);

        manager.install(account.address, keypair.clone(), Duration::ZERO);
        manager.install(account.address, keypair, Duration::from_millis(100));

        advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(manager.sign(&account, &[0u8; 32]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_cancels_old_timer() {
        let manager = manager();
        let keypair = Keypair::generate();
        let account = account(&keypair);

        manager.install(account.address, keypair.clone(), Duration::from_millis(100));
        manager.install(account.address, keypair, Duration::from_millis(800));

        // Past the first timer but not the second: still unlocked
        advance(Duration::from_millis(400)).await;
        tokio::task::yield_now().await;
        assert!(manager.sign(&account, &[0u8; 32]).is_ok());

        advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(matches!(
            manager.sign(&account, &[0u8; 32]).unwrap_err(),
            Error::Wallet(WalletError::Locked)
        ));
    }

    #[tokio::test]
    async fn test_sign_when_locked_fails() {
        let manager = manager();
        let account = account(&Keypair::generate());
        assert!(matches!(
            manager.sign(&account, &[0u8; 32]).unwrap_err(),
            Error::Wallet(WalletError::Locked)
        ));
    }

    #[tokio::test]
    async fn test_lock_is_idempotent() {
        let manager = manager();
        let account = account(&Keypair::generate());
        manager.lock(account.address);
        manager.lock(account.address);
    }

    #[tokio::test]
    async fn test_signature_recovers_to_signer() {
        let manager = manager();
        let keypair = Keypair::generate();
        let account = account(&keypair);
        let expected = keypair.address();

        manager.install(account.address, keypair, Duration::ZERO);
        let hash = [0u8; 32];
        let signature = manager.sign(&account, &hash).unwrap();
        assert_eq!(
            qvs_crypto_secp256k1::recover_address(&hash, &signature).unwrap(),
            expected
        );
    }
}
