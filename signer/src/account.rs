//! Account identity types.
//!
//! An account is the pair of a 20-byte Ethereum address and the wallet URL
//! of the metadata file that describes where its key lives. The URL embeds
//! the originating vault endpoint as its authority and the metadata file
//! path as its path, so an account is globally identifiable regardless of
//! which vault it came from.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A 20-byte Ethereum account address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Parse from hex, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, AddressParseError> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|_| AddressParseError(s.to_string()))?;
        Self::from_slice(&bytes).ok_or_else(|| AddressParseError(s.to_string()))
    }

    /// Construct from a byte slice; `None` unless it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Address)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The all-zero address, used as "no address specified" in lookups.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hex address: {0}")]
pub struct AddressParseError(String);

/// The URL identifying one wallet: `file://{vault-authority}{metadata-path}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WalletUrl {
    /// Authority of the vault endpoint the wallet's key lives in (host:port).
    pub vault: String,
    /// Absolute path of the account metadata file.
    pub path: String,
}

impl WalletUrl {
    /// Build the URL for a metadata file served by the given vault endpoint.
    pub fn new(vault_url: &str, path: &Path) -> Self {
        Self {
            vault: authority_of(vault_url),
            path: path.to_string_lossy().into_owned(),
        }
    }

    /// Parse a wallet URL. Accepts the full `file://authority/path` form and
    /// bare paths (no scheme), which carry no vault authority.
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("file://") {
            Some(rest) => match rest.find('/') {
                Some(i) => Self {
                    vault: rest[..i].to_string(),
                    path: rest[i..].to_string(),
                },
                None => Self {
                    vault: rest.to_string(),
                    path: String::new(),
                },
            },
            None => Self {
                vault: String::new(),
                path: s.to_string(),
            },
        }
    }
}

impl fmt::Display for WalletUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file://{}{}", self.vault, self.path)
    }
}

impl PartialOrd for WalletUrl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WalletUrl {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

/// Extract the authority (host:port) from a vault base URL.
fn authority_of(vault_url: &str) -> String {
    let rest = vault_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(vault_url);
    rest.split('/').next().unwrap_or_default().to_string()
}

/// One signable identity: address plus the wallet URL it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Account {
    pub address: Address,
    pub url: WalletUrl,
}

impl Account {
    pub fn new(address: Address, url: WalletUrl) -> Self {
        Self { address, url }
    }
}

impl PartialOrd for Account {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Account {
    fn cmp(&self, other: &Self) -> Ordering {
        self.url
            .cmp(&other.url)
            .then_with(|| self.address.cmp(&other.address))
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_address_hex_roundtrip() {
        let addr = Address::from_hex("0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f").unwrap();
        assert_eq!(addr.to_string(), "0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f");

        // Prefix is optional
        let bare = Address::from_hex("9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f").unwrap();
        assert_eq!(addr, bare);
    }

    #[test]
    fn test_address_rejects_bad_input() {
        assert!(Address::from_hex("0x1234").is_err());
        assert!(Address::from_hex("not hex").is_err());
    }

    #[test]
    fn test_zero_address() {
        assert!(Address::default().is_zero());
        assert!(!Address([1u8; 20]).is_zero());
    }

    #[test]
    fn test_wallet_url_display_and_parse() {
        let url = WalletUrl::new(
            "https://vault.example:8200",
            &PathBuf::from("/data/accts/acct1.json"),
        );
        assert_eq!(url.to_string(), "file://vault.example:8200/data/accts/acct1.json");

        let parsed = WalletUrl::parse(&url.to_string());
        assert_eq!(parsed, url);
    }

    #[test]
    fn test_wallet_url_parse_bare_path() {
        let parsed = WalletUrl::parse("acct1.json");
        assert_eq!(parsed.vault, "");
        assert_eq!(parsed.path, "acct1.json");
    }

    #[test]
    fn test_authority_extraction() {
        assert_eq!(authority_of("https://vault:8200"), "vault:8200");
        assert_eq!(authority_of("http://localhost:8200/v1"), "localhost:8200");
        assert_eq!(authority_of("vault:8200"), "vault:8200");
    }

    #[test]
    fn test_account_sorted_by_url() {
        let addr = Address([7u8; 20]);
        let a = Account::new(addr, WalletUrl::parse("file://v:1/a.json"));
        let b = Account::new(addr, WalletUrl::parse("file://v:1/b.json"));
        assert!(a < b);
    }
}
