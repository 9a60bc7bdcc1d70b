#![deny(unsafe_code)]

//! Secp256k1 key support for Ethereum-compatible account handling.
//!
//! This crate provides the key material type used by the vault signer:
//! construction from raw 32-byte secrets, random generation, Keccak-derived
//! Ethereum addresses, and recoverable ECDSA signatures over 32-byte hashes.
//!
//! # Examples
//!
//! ```
//! use qvs_crypto_secp256k1::Keypair;
//!
//! let keypair = Keypair::generate();
//! let signature = keypair.sign_hash(&[0u8; 32]);
//! assert_eq!(signature.len(), 65); // r (32) + s (32) + v (1)
//!
//! let recovered = qvs_crypto_secp256k1::recover_address(&[0u8; 32], &signature).unwrap();
//! assert_eq!(recovered, keypair.address());
//! ```

use k256::{
    ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey},
    SecretKey,
};
use sha3::{Digest, Keccak256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Errors that can occur during key operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("private key must be 32 bytes of hex")]
    InvalidKeyEncoding,

    #[error("signing failed: {0}")]
    SigningError(String),
}

/// A secp256k1 keypair for Ethereum-compatible signing.
#[derive(Clone, ZeroizeOnDrop)]
pub struct Keypair {
    #[zeroize(skip)] // SigningKey implements its own zeroization
    signing_key: SigningKey,
}

impl core::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Keypair {{ address: {} }}", self.checksum_address())
    }
}

impl Keypair {
    /// Generate a new keypair from the OS random source.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Create a keypair from raw 32-byte private key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        let secret_key =
            SecretKey::from_bytes(bytes.into()).map_err(|_| Error::InvalidPrivateKey)?;

        Ok(Self {
            signing_key: SigningKey::from(secret_key),
        })
    }

    /// Create a keypair from a hex-encoded private key (with or without a
    /// `0x` prefix).
    pub fn from_hex(hex_key: &str) -> Result<Self, Error> {
        let stripped = hex_key.strip_prefix("0x").unwrap_or(hex_key);
        let bytes = Zeroizing::new(hex::decode(stripped).map_err(|_| Error::InvalidKeyEncoding)?);
        let raw: &[u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKeyEncoding)?;
        Self::from_bytes(raw)
    }

    /// Export the private key as lowercase hex without a prefix.
    ///
    /// The returned buffer is zeroized when dropped.
    pub fn to_hex(&self) -> Zeroizing<String> {
        let mut bytes: [u8; 32] = self.signing_key.to_bytes().into();
        let encoded = Zeroizing::new(hex::encode(bytes));
        bytes.zeroize();
        encoded
    }

    /// Get the public key as uncompressed bytes (65 bytes: 0x04 || x || y).
    pub fn public_key_uncompressed(&self) -> [u8; 65] {
        let verifying_key = self.signing_key.verifying_key();
        let point = verifying_key.to_encoded_point(false);
        let mut result = [0u8; 65];
        result.copy_from_slice(point.as_bytes());
        result
    }

    /// Get the raw 20-byte Ethereum address derived from this keypair.
    ///
    /// The address is the last 20 bytes of keccak256(public_key), where
    /// public_key is the 64-byte uncompressed point without the 0x04 prefix.
    pub fn address(&self) -> [u8; 20] {
        let pubkey = self.public_key_uncompressed();
        let hash = Keccak256::digest(&pubkey[1..]);
        hash[12..32].try_into().unwrap()
    }

    /// Get the EIP-55 checksummed address string prefixed with "0x".
    pub fn checksum_address(&self) -> String {
        checksum_encode(&self.address())
    }

    /// Sign a raw 32-byte hash.
    ///
    /// Returns a 65-byte signature: r (32) || s (32) || v (1)
    /// where v is the recovery ID + 27.
    pub fn sign_hash(&self, hash: &[u8; 32]) -> [u8; 65] {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(hash)
            .expect("signing should not fail with valid key");

        let mut result = [0u8; 65];
        result[..64].copy_from_slice(&signature.to_bytes());
        result[64] = recovery_id.to_byte() + 27;
        result
    }
}

/// EIP-55 checksum encode an address.
pub fn checksum_encode(address: &[u8; 20]) -> String {
    let hex_addr = hex::encode(address);
    let hash = Keccak256::digest(hex_addr.as_bytes());

    let mut result = String::with_capacity(42);
    result.push_str("0x");

    for (i, c) in hex_addr.chars().enumerate() {
        if c.is_ascii_digit() {
            result.push(c);
        } else {
            // Get the corresponding nibble from the hash
            let hash_byte = hash[i / 2];
            let hash_nibble = if i % 2 == 0 {
                hash_byte >> 4
            } else {
                hash_byte & 0x0f
            };

            if hash_nibble >= 8 {
                result.push(c.to_ascii_uppercase());
            } else {
                result.push(c);
            }
        }
    }

    result
}

/// Recover the public key from a signature and message hash.
pub fn recover_public_key(hash: &[u8; 32], signature: &[u8; 65]) -> Option<[u8; 65]> {
    let r_s: [u8; 64] = signature[..64].try_into().ok()?;
    let v = signature[64];

    // v should be 27 or 28 (or 0/1 for some implementations)
    let recovery_id = if v >= 27 {
        RecoveryId::try_from(v - 27).ok()?
    } else {
        RecoveryId::try_from(v).ok()?
    };

    let sig = K256Signature::from_slice(&r_s).ok()?;
    let verifying_key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id).ok()?;

    let point = verifying_key.to_encoded_point(false);
    let mut result = [0u8; 65];
    result.copy_from_slice(point.as_bytes());
    Some(result)
}

/// Recover the Ethereum address from a signature over a 32-byte hash.
pub fn recover_address(hash: &[u8; 32], signature: &[u8; 65]) -> Option<[u8; 20]> {
    let pubkey = recover_public_key(hash, signature)?;

    let addr_hash = Keccak256::digest(&pubkey[1..]);
    Some(addr_hash[12..32].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The private key from the EIP-155 signing example (DO NOT USE IN PRODUCTION)
    const TEST_KEY_HEX: &str = "4646464646464646464646464646464646464646464646464646464646464646";
    const TEST_ADDRESS: &str = "0x9d8A62f656a8d1615C1294fd71e9CFb3E4855A4F";

    #[test]
    fn test_address_from_known_key() {
        let keypair = Keypair::from_hex(TEST_KEY_HEX).unwrap();
        assert_eq!(keypair.checksum_address(), TEST_ADDRESS);
    }

    #[test]
    fn test_hex_roundtrip() {
        let keypair = Keypair::from_hex(TEST_KEY_HEX).unwrap();
        assert_eq!(keypair.to_hex().as_str(), TEST_KEY_HEX);

        // 0x prefix is accepted
        let prefixed = Keypair::from_hex(&format!("0x{}", TEST_KEY_HEX)).unwrap();
        assert_eq!(prefixed.address(), keypair.address());
    }

    #[test]
    fn test_generate_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_sign_and_recover() {
        let keypair = Keypair::from_hex(TEST_KEY_HEX).unwrap();
        let hash: [u8; 32] = Keccak256::digest(b"payload to sign").into();

        let signature = keypair.sign_hash(&hash);
        assert!(signature[64] == 27 || signature[64] == 28);

        let recovered = recover_address(&hash, &signature).unwrap();
        assert_eq!(recovered, keypair.address());
    }

    #[test]
    fn test_recover_rejects_garbage() {
        let hash = [0x11u8; 32];
        let mut signature = [0u8; 65];
        signature[64] = 27;
        assert!(recover_address(&hash, &signature).is_none());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        // Zero is not a valid secp256k1 scalar
        assert!(Keypair::from_bytes(&[0u8; 32]).is_err());
        // Wrong length hex
        assert!(Keypair::from_hex("abcd").is_err());
        // Non-hex input
        assert!(Keypair::from_hex("zz").is_err());
    }

    #[test]
    fn test_checksum_encode_known_vector() {
        // Vector from the EIP-55 specification
        let addr: [u8; 20] = hex::decode("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            checksum_encode(&addr),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn test_public_key_format() {
        let keypair = Keypair::generate();
        let uncompressed = keypair.public_key_uncompressed();
        assert_eq!(uncompressed[0], 0x04);
    }
}
