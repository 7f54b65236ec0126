//! Transaction Codec
//!
//! Decodes raw transaction bytes into an envelope and re-encodes them in the
//! canonical EIP-2718 form. Accepts legacy (type 0) RLP lists, typed envelopes
//! (types 1-4), and the network form where a typed envelope is wrapped in an
//! RLP string header.

use alloy::consensus::{TxEnvelope, TxType};
use alloy::eips::eip2718::{Decodable2718, Eip2718Error, Encodable2718};
use alloy::primitives::{Bytes, TxHash};
use thiserror::Error;

/// Errors that can occur during transaction decoding
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Empty input data")]
    EmptyInput,

    #[error("Malformed transaction: {0}")]
    Malformed(String),

    #[error("Unsupported envelope type: {0:#04x}")]
    UnsupportedType(u8),

    #[error("Invalid hex payload: {0}")]
    InvalidHex(String),
}

impl From<Eip2718Error> for DecodeError {
    fn from(err: Eip2718Error) -> Self {
        match err {
            Eip2718Error::UnexpectedType(ty) => DecodeError::UnsupportedType(ty),
            other => DecodeError::Malformed(other.to_string()),
        }
    }
}

/// A decoded transaction together with its canonical hash
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransaction {
    /// The decoded envelope
    pub envelope: TxEnvelope,
    /// Canonical transaction hash
    pub hash: TxHash,
}

impl RawTransaction {
    /// Wrap an already decoded envelope, caching its hash
    pub fn from_envelope(envelope: TxEnvelope) -> Self {
        let hash = tx_hash(&envelope);
        Self { envelope, hash }
    }

    /// Hash as `0x`-prefixed lowercase hex
    pub fn hash_hex(&self) -> String {
        format!("{:#x}", self.hash)
    }

    /// Canonical envelope bytes as `0x`-prefixed lowercase hex
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(encode_raw(self)))
    }
}

/// Decode a transaction from raw envelope bytes
///
/// # Arguments
/// * `raw` - EIP-2718 envelope, legacy RLP list, or RLP-wrapped network form
///
/// # Returns
/// The decoded transaction with its canonical hash
pub fn decode_raw(raw: &[u8]) -> Result<RawTransaction, DecodeError> {
    let first = *raw.first().ok_or(DecodeError::EmptyInput)?;
    // below 0x7f is a type byte; the decoder reports unknown ones as plain RLP errors
    if first < 0x7f && TxType::try_from(first).is_err() {
        return Err(DecodeError::UnsupportedType(first));
    }

    let mut buf = raw;
    // 0x80..=0xbf is an RLP string header: the typed envelope is wrapped
    let envelope = if (0x80..=0xbf).contains(&first) {
        TxEnvelope::network_decode(&mut buf)?
    } else {
        TxEnvelope::decode_2718(&mut buf)?
    };

    Ok(RawTransaction::from_envelope(envelope))
}

/// Encode a transaction into its canonical EIP-2718 envelope form
pub fn encode_raw(tx: &RawTransaction) -> Bytes {
    Bytes::from(tx.envelope.encoded_2718())
}

/// Compute the canonical hash of an envelope
pub fn tx_hash(envelope: &TxEnvelope) -> TxHash {
    *envelope.tx_hash()
}

/// Parse a hex string to bytes (with or without 0x prefix)
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, DecodeError> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| DecodeError::InvalidHex(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{SignableTransaction, TxLegacy};
    use alloy::primitives::{address, b256, TxKind, U256};

    const SAMPLE_RAW: &str = "0x02f873018305643b840f2c19f08503f8bfbbb2832ab980940ed1bcc400acd34593451e76f854992198995f52808498e5b12ac080a051eb99ae13fd1ace55dd93a4b36eefa5d34e115cd7b9fd5d0ffac07300cbaeb2a0782d9ad12490b45af932d8c98cb3c2fd8c02cdd6317edb36bde2df7556fa9132";

    fn sample() -> RawTransaction {
        decode_raw(&hex_to_bytes(SAMPLE_RAW).unwrap()).unwrap()
    }

    fn legacy_from(sample: &RawTransaction) -> TxEnvelope {
        let TxEnvelope::Eip1559(signed) = &sample.envelope else {
            panic!("sample is an EIP-1559 transaction");
        };
        let legacy = TxLegacy {
            chain_id: Some(1),
            nonce: 7,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(address!("0ed1bcc400acd34593451e76f854992198995f52")),
            value: U256::from(1u64),
            input: Bytes::new(),
        };
        TxEnvelope::Legacy(legacy.into_signed(*signed.signature()))
    }

    // ==================== decode_raw tests ====================

    #[test]
    fn test_decode_sample_hash() {
        let tx = sample();
        assert_eq!(
            tx.hash,
            b256!("bb59e550e4730da43af01b7ae6e1d05b1df501baa4119b8ab6a3427d9b3635b1")
        );
        assert_eq!(
            tx.hash_hex(),
            "0xbb59e550e4730da43af01b7ae6e1d05b1df501baa4119b8ab6a3427d9b3635b1"
        );
    }

    #[test]
    fn test_decode_empty_input_returns_error() {
        assert!(matches!(decode_raw(&[]), Err(DecodeError::EmptyInput)));
    }

    #[test]
    fn test_decode_invalid_rlp_returns_error() {
        let result = decode_raw(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_unknown_type_returns_unsupported() {
        let result = decode_raw(&[0x7e, 0xc0]);
        assert!(matches!(result, Err(DecodeError::UnsupportedType(0x7e))));
    }

    #[test]
    fn test_decode_next_unassigned_type_is_unsupported() {
        let mut raw = hex_to_bytes(SAMPLE_RAW).unwrap();
        raw[0] = 0x05;
        let err = decode_raw(&raw).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedType(0x05)));
        assert_eq!(err.to_string(), "Unsupported envelope type: 0x05");
    }

    // ==================== encode_raw tests ====================

    #[test]
    fn test_encode_typed_is_byte_identical() {
        let raw = hex_to_bytes(SAMPLE_RAW).unwrap();
        let tx = decode_raw(&raw).unwrap();
        assert_eq!(encode_raw(&tx).to_vec(), raw);
        assert_eq!(tx.raw_hex(), SAMPLE_RAW);
    }

    #[test]
    fn test_network_form_is_normalized() {
        let tx = sample();
        let mut wrapped = Vec::new();
        tx.envelope.network_encode(&mut wrapped);
        assert_ne!(wrapped, encode_raw(&tx).to_vec());

        let decoded = decode_raw(&wrapped).unwrap();
        assert_eq!(decoded.hash, tx.hash);
        assert_eq!(encode_raw(&decoded), encode_raw(&tx));
    }

    #[test]
    fn test_legacy_round_trip_keeps_hash() {
        let legacy = legacy_from(&sample());
        let raw = legacy.encoded_2718();
        assert!(raw[0] >= 0xc0, "legacy envelopes are bare RLP lists");

        let first = decode_raw(&raw).unwrap();
        let second = decode_raw(&encode_raw(&first)).unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.hash, tx_hash(&legacy));
    }

    // ==================== hex_to_bytes tests ====================

    #[test]
    fn test_hex_to_bytes_with_prefix() {
        let result = hex_to_bytes("0x38ed1739").unwrap();
        assert_eq!(result, vec![0x38, 0xed, 0x17, 0x39]);
    }

    #[test]
    fn test_hex_to_bytes_without_prefix() {
        let result = hex_to_bytes("38ed1739").unwrap();
        assert_eq!(result, vec![0x38, 0xed, 0x17, 0x39]);
    }

    #[test]
    fn test_hex_to_bytes_invalid() {
        let result = hex_to_bytes("0xGGGG");
        assert!(matches!(result, Err(DecodeError::InvalidHex(_))));
    }
}
