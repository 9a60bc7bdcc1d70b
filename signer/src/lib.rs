//! Out-of-process account store for Quorum nodes, backed by a
//! HashiCorp-Vault-compatible secret store.
//!
//! Account private keys never live on disk here: each account is a small
//! metadata file pointing at a versioned vault secret. The plugin maintains
//! authenticated vault sessions (with token renewal and indefinite
//! re-authentication), keeps a live index of the metadata directory, and
//! exposes wallet open/close/sign semantics to the host over gRPC.
//!
//! ## Security model
//!
//! - Raw keys exist in memory only while unlocked or for the duration of a
//!   single passphrase-signing call, and are zeroized on release
//! - Vault credentials are read from the environment at authentication time
//!   and never cached beyond the session that used them
//! - The host node is trusted; the vault is reached only over the configured
//!   TLS material

pub mod account;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod rpc;
pub mod tx;
pub mod unlock;
pub mod vault;
pub mod wallet;

pub use account::{Account, Address, WalletUrl};
pub use backend::Backend;
pub use config::PluginConfig;
pub use error::Error;
pub use events::{EventBus, Subscription, WalletEvent};
pub use rpc::SignerService;
