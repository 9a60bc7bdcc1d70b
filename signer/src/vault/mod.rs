//! Vault access: the HTTP client and the authenticated session pool.

mod client;
mod session;

pub use client::{AuthLease, VaultClient};
pub use session::{Session, SessionPool, DEFAULT_ROLE_ID_ENV, DEFAULT_SECRET_ID_ENV, DEFAULT_TOKEN_ENV};
