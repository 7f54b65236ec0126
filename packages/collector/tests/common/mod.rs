//! Shared fixtures for integration tests

#![allow(dead_code)]

use alloy::consensus::{SignableTransaction, TxEnvelope};
use chrono::{DateTime, Utc};

use mempool_collector::codec::{decode_raw, hex_to_bytes, RawTransaction};

/// Mainnet EIP-1559 transaction used throughout the tests
pub const SAMPLE_RAW: &str = "0x02f873018305643b840f2c19f08503f8bfbbb2832ab980940ed1bcc400acd34593451e76f854992198995f52808498e5b12ac080a051eb99ae13fd1ace55dd93a4b36eefa5d34e115cd7b9fd5d0ffac07300cbaeb2a0782d9ad12490b45af932d8c98cb3c2fd8c02cdd6317edb36bde2df7556fa9132";

pub const SAMPLE_HASH: &str = "0xbb59e550e4730da43af01b7ae6e1d05b1df501baa4119b8ab6a3427d9b3635b1";

pub fn sample_tx() -> RawTransaction {
    decode_raw(&hex_to_bytes(SAMPLE_RAW).unwrap()).unwrap()
}

/// A distinct transaction per nonce, re-signed with the sample's signature
pub fn tx_with_nonce(nonce: u64) -> RawTransaction {
    let TxEnvelope::Eip1559(signed) = sample_tx().envelope else {
        panic!("sample is an EIP-1559 transaction");
    };
    let mut tx = signed.tx().clone();
    tx.nonce = nonce;
    RawTransaction::from_envelope(TxEnvelope::Eip1559(tx.into_signed(*signed.signature())))
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

pub fn at_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}
