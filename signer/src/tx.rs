//! Legacy Ethereum transaction codec and signature handling.
//!
//! The host hands us RLP-encoded transactions; we decode, compute the
//! signing hash (EIP-155 when a chain ID is supplied, homestead otherwise),
//! and re-encode with the signature folded in. Integer fields are kept as
//! the minimal big-endian byte strings RLP uses on the wire, which avoids
//! committing to a bignum representation the signer never does arithmetic
//! on.

use rlp::{Rlp, RlpStream};
use sha3::{Digest, Keccak256};

/// Errors arising from transaction decoding and signature folding.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("unable to decode transaction: {0}")]
    Decode(#[from] rlp::DecoderError),

    #[error("transaction must be an RLP list of 6 or 9 items, got {0}")]
    UnexpectedShape(usize),

    #[error("chain ID does not fit in 64 bits")]
    ChainIdTooLarge,
}

/// A legacy (pre-typed) Ethereum transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: Vec<u8>,
    pub gas_price: Vec<u8>,
    pub gas: Vec<u8>,
    /// Recipient address; empty for contract creation.
    pub to: Vec<u8>,
    pub value: Vec<u8>,
    pub payload: Vec<u8>,
    pub v: Vec<u8>,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

impl LegacyTransaction {
    /// Decode the canonical RLP form. Both the 9-item (signature fields
    /// present, possibly empty) and the bare 6-item shape are accepted.
    pub fn decode(bytes: &[u8]) -> Result<Self, TxError> {
        let rlp = Rlp::new(bytes);
        let items = rlp.item_count()?;
        if items != 6 && items != 9 {
            return Err(TxError::UnexpectedShape(items));
        }

        let mut tx = Self {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
            gas: rlp.val_at(2)?,
            to: rlp.val_at(3)?,
            value: rlp.val_at(4)?,
            payload: rlp.val_at(5)?,
            v: Vec::new(),
            r: Vec::new(),
            s: Vec::new(),
        };
        if items == 9 {
            tx.v = rlp.val_at(6)?;
            tx.r = rlp.val_at(7)?;
            tx.s = rlp.val_at(8)?;
        }
        Ok(tx)
    }

    /// Encode to the canonical 9-item RLP form.
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas);
        stream.append(&self.to);
        stream.append(&self.value);
        stream.append(&self.payload);
        stream.append(&self.v);
        stream.append(&self.r);
        stream.append(&self.s);
        stream.out().to_vec()
    }

    /// The 32-byte hash the sender signs.
    ///
    /// With a nonzero chain ID this is the EIP-155 preimage (the six payload
    /// fields followed by `chainId, 0, 0`); otherwise the homestead preimage
    /// of the six payload fields alone.
    pub fn sighash(&self, chain_id: u64) -> [u8; 32] {
        let mut stream = RlpStream::new_list(if chain_id != 0 { 9 } else { 6 });
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas);
        stream.append(&self.to);
        stream.append(&self.value);
        stream.append(&self.payload);
        if chain_id != 0 {
            stream.append(&chain_id);
            stream.append_empty_data();
            stream.append_empty_data();
        }
        Keccak256::digest(stream.out()).into()
    }

    /// Fold a 65-byte recoverable signature (r || s || v, v in 27/28) into
    /// the transaction, producing the signed form.
    pub fn with_signature(&self, signature: &[u8; 65], chain_id: u64) -> Self {
        let recovery_id = u64::from(signature[64] - 27);
        let v = if chain_id != 0 {
            recovery_id + 35 + 2 * chain_id
        } else {
            recovery_id + 27
        };

        let mut signed = self.clone();
        signed.v = trim_leading_zeros(&v.to_be_bytes());
        signed.r = trim_leading_zeros(&signature[..32]);
        signed.s = trim_leading_zeros(&signature[32..64]);
        signed
    }

    /// Reassemble the 65-byte recoverable signature from a signed
    /// transaction, if its signature fields are populated.
    pub fn signature_65(&self, chain_id: u64) -> Option<[u8; 65]> {
        if self.r.is_empty() || self.s.is_empty() || self.v.is_empty() {
            return None;
        }
        let v = be_bytes_to_u64(&self.v)?;
        let recovery_id = if chain_id != 0 {
            v.checked_sub(35 + 2 * chain_id)?
        } else {
            v.checked_sub(27)?
        };
        if recovery_id > 1 {
            return None;
        }

        let mut signature = [0u8; 65];
        copy_right_aligned(&mut signature[..32], &self.r)?;
        copy_right_aligned(&mut signature[32..64], &self.s)?;
        signature[64] = recovery_id as u8 + 27;
        Some(signature)
    }
}

/// Parse the big-endian chain-ID bytes supplied over the wire.
pub fn chain_id_from_bytes(bytes: &[u8]) -> Result<u64, TxError> {
    let trimmed = match bytes.iter().position(|&b| b != 0) {
        Some(i) => &bytes[i..],
        None => return Ok(0),
    };
    be_bytes_to_u64(trimmed).ok_or(TxError::ChainIdTooLarge)
}

fn be_bytes_to_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    match bytes.iter().position(|&b| b != 0) {
        Some(i) => bytes[i..].to_vec(),
        None => Vec::new(),
    }
}

fn copy_right_aligned(dest: &mut [u8], src: &[u8]) -> Option<()> {
    if src.len() > dest.len() {
        return None;
    }
    let offset = dest.len() - src.len();
    dest[offset..].copy_from_slice(src);
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The signed transaction from the EIP-155 specification example:
    // nonce 9, gas price 20 gwei, gas 21000, value 10^18, chain ID 1.
    const EIP155_SIGNED: &str = "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83";
    const EIP155_SIGHASH: &str = "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53";
    const EIP155_SENDER: &str = "9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f";

    fn signed_vector() -> LegacyTransaction {
        LegacyTransaction::decode(&hex::decode(EIP155_SIGNED).unwrap()).unwrap()
    }

    #[test]
    fn test_decode_known_fields() {
        let tx = signed_vector();
        assert_eq!(tx.nonce, vec![0x09]);
        assert_eq!(tx.gas, vec![0x52, 0x08]);
        assert_eq!(tx.to, vec![0x35; 20]);
        assert!(tx.payload.is_empty());
        assert_eq!(tx.v, vec![0x25]); // 37 = 0*2 + 35 + 2*1
    }

    #[test]
    fn test_encode_roundtrip() {
        let raw = hex::decode(EIP155_SIGNED).unwrap();
        let tx = LegacyTransaction::decode(&raw).unwrap();
        assert_eq!(tx.encode(), raw);
    }

    #[test]
    fn test_sighash_matches_eip155_example() {
        let tx = signed_vector();
        assert_eq!(hex::encode(tx.sighash(1)), EIP155_SIGHASH);
    }

    #[test]
    fn test_recover_sender_from_vector() {
        let tx = signed_vector();
        let signature = tx.signature_65(1).unwrap();
        let sender =
            qvs_crypto_secp256k1::recover_address(&tx.sighash(1), &signature).unwrap();
        assert_eq!(hex::encode(sender), EIP155_SENDER);
    }

    #[test]
    fn test_sign_and_fold() {
        let keypair = qvs_crypto_secp256k1::Keypair::from_hex(
            "4646464646464646464646464646464646464646464646464646464646464646",
        )
        .unwrap();

        let mut unsigned = signed_vector();
        unsigned.v.clear();
        unsigned.r.clear();
        unsigned.s.clear();

        let signature = keypair.sign_hash(&unsigned.sighash(1));
        let signed = unsigned.with_signature(&signature, 1);

        // v encodes the chain ID per EIP-155
        let v = be_bytes_to_u64(&signed.v).unwrap();
        assert!(v == 37 || v == 38);

        // The folded signature recovers to the signer
        let recovered = qvs_crypto_secp256k1::recover_address(
            &signed.sighash(1),
            &signed.signature_65(1).unwrap(),
        )
        .unwrap();
        assert_eq!(recovered, keypair.address());
    }

    #[test]
    fn test_homestead_v_values() {
        let keypair = qvs_crypto_secp256k1::Keypair::generate();
        let mut unsigned = signed_vector();
        unsigned.v.clear();
        unsigned.r.clear();
        unsigned.s.clear();

        let signature = keypair.sign_hash(&unsigned.sighash(0));
        let signed = unsigned.with_signature(&signature, 0);
        let v = be_bytes_to_u64(&signed.v).unwrap();
        assert!(v == 27 || v == 28);
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let mut stream = RlpStream::new_list(3);
        stream.append(&vec![0x01u8]);
        stream.append(&vec![0x02u8]);
        stream.append(&vec![0x03u8]);
        let err = LegacyTransaction::decode(&stream.out()).unwrap_err();
        assert!(matches!(err, TxError::UnexpectedShape(3)));

        assert!(LegacyTransaction::decode(b"not rlp at all").is_err());
    }

    #[test]
    fn test_chain_id_from_bytes() {
        assert_eq!(chain_id_from_bytes(&[]).unwrap(), 0);
        assert_eq!(chain_id_from_bytes(&[0, 0]).unwrap(), 0);
        assert_eq!(chain_id_from_bytes(&[0x01]).unwrap(), 1);
        assert_eq!(chain_id_from_bytes(&[0x05, 0x39]).unwrap(), 1337);
        assert_eq!(
            chain_id_from_bytes(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0x2a]).unwrap(),
            42
        );
        assert!(chain_id_from_bytes(&[1, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_contract_creation_encodes_empty_to() {
        let mut tx = signed_vector();
        tx.to.clear();
        let decoded = LegacyTransaction::decode(&tx.encode()).unwrap();
        assert!(decoded.to.is_empty());
    }
}
