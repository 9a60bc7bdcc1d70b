//! One wallet per cached metadata file.
//!
//! A wallet moves between `Closed` and `Open` under host control and ends in
//! `Dropped` when its file disappears from the config directory. Operations
//! on a single wallet are serialized; wallets do not order against each
//! other.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::account::Account;
use crate::error::{Error, WalletError};
use crate::events::EventBus;
use crate::tx::{chain_id_from_bytes, LegacyTransaction};
use crate::unlock::UnlockManager;

/// Wallet lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletState {
    Closed,
    Open,
    Dropped,
}

impl fmt::Display for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletState::Closed => write!(f, "closed"),
            WalletState::Open => write!(f, "open"),
            WalletState::Dropped => write!(f, "dropped"),
        }
    }
}

pub struct Wallet {
    account: Account,
    state: Mutex<WalletState>,
    /// Serializes Open/Close/Sign per wallet.
    op_lock: tokio::sync::Mutex<()>,
    unlock: Arc<UnlockManager>,
    bus: EventBus,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet").finish_non_exhaustive()
    }
}

impl Wallet {
    pub fn new(account: Account, unlock: Arc<UnlockManager>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            account,
            state: Mutex::new(WalletState::Closed),
            op_lock: tokio::sync::Mutex::new(()),
            unlock,
            bus,
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn url_string(&self) -> String {
        self.account.url.to_string()
    }

    /// Human-readable state. Valid in every state.
    pub fn status(&self) -> String {
        self.current_state().to_string()
    }

    pub async fn open(&self, _passphrase: &str) -> Result<(), Error> {
        let _guard = self.op_lock.lock().await;
        let mut state = self.state.lock().expect("wallet state poisoned");
        match *state {
            WalletState::Dropped => Err(WalletError::Dropped.into()),
            WalletState::Open => Ok(()), // idempotent
            WalletState::Closed => {
                *state = WalletState::Open;
                drop(state);
                self.bus.wallet_opened(&self.url_string());
                Ok(())
            }
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        let _guard = self.op_lock.lock().await;
        let mut state = self.state.lock().expect("wallet state poisoned");
        match *state {
            WalletState::Dropped => Err(WalletError::Dropped.into()),
            WalletState::Closed => Ok(()), // no-op
            WalletState::Open => {
                *state = WalletState::Closed;
                Ok(())
            }
        }
    }

    /// The accounts held by this wallet: exactly one, unless dropped.
    pub fn accounts(&self) -> Result<Vec<Account>, Error> {
        self.ensure_live()?;
        Ok(vec![self.account.clone()])
    }

    /// Whether the given account specifier names this wallet's account.
    pub fn contains(&self, account: &Account) -> Result<bool, Error> {
        self.ensure_live()?;
        Ok(self.matches(account))
    }

    pub async fn sign_hash(&self, account: &Account, hash: &[u8; 32]) -> Result<[u8; 65], Error> {
        let _guard = self.op_lock.lock().await;
        self.ensure_holds(account)?;
        self.unlock.sign(&self.account, hash)
    }

    pub async fn sign_tx(
        &self,
        account: &Account,
        rlp_tx: &[u8],
        chain_id_bytes: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let _guard = self.op_lock.lock().await;
        self.ensure_holds(account)?;

        let chain_id = chain_id_from_bytes(chain_id_bytes)?;
        let tx = LegacyTransaction::decode(rlp_tx)?;
        let signature = self.unlock.sign(&self.account, &tx.sighash(chain_id))?;
        Ok(tx.with_signature(&signature, chain_id).encode())
    }

    pub async fn sign_hash_with_passphrase(
        &self,
        account: &Account,
        passphrase: &str,
        hash: &[u8; 32],
    ) -> Result<[u8; 65], Error> {
        let _guard = self.op_lock.lock().await;
        self.ensure_holds(account)?;
        self.unlock
            .sign_with_passphrase(&self.account, passphrase, hash)
            .await
    }

    pub async fn sign_tx_with_passphrase(
        &self,
        account: &Account,
        passphrase: &str,
        rlp_tx: &[u8],
        chain_id_bytes: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let _guard = self.op_lock.lock().await;
        self.ensure_holds(account)?;

        let chain_id = chain_id_from_bytes(chain_id_bytes)?;
        let tx = LegacyTransaction::decode(rlp_tx)?;
        let signature = self
            .unlock
            .sign_with_passphrase(&self.account, passphrase, &tx.sighash(chain_id))
            .await?;
        Ok(tx.with_signature(&signature, chain_id).encode())
    }

    /// Retire the wallet. Called when the underlying file disappears.
    pub(crate) fn mark_dropped(&self) {
        *self.state.lock().expect("wallet state poisoned") = WalletState::Dropped;
    }

    fn current_state(&self) -> WalletState {
        *self.state.lock().expect("wallet state poisoned")
    }

    fn ensure_live(&self) -> Result<(), WalletError> {
        if self.current_state() == WalletState::Dropped {
            return Err(WalletError::Dropped);
        }
        Ok(())
    }

    fn ensure_holds(&self, account: &Account) -> Result<(), WalletError> {
        self.ensure_live()?;
        if !self.matches(account) {
            return Err(WalletError::NotContained(account.clone()));
        }
        Ok(())
    }

    fn matches(&self, account: &Account) -> bool {
        account.address == self.account.address
            && (account.url.path.is_empty() || account.url == self.account.url)
    }
}
