//! Observation
//!
//! One sighting of a transaction by one upstream source.

use alloy::primitives::TxHash;
use chrono::{DateTime, Utc};

use crate::codec::RawTransaction;

/// A transaction as seen by a single source at a single instant
#[derive(Debug, Clone)]
pub struct Observation {
    /// Wall-clock arrival time at the connector
    pub arrival: DateTime<Utc>,
    /// Source tag (provider name or user alias)
    pub source: String,
    /// The decoded transaction
    pub tx: RawTransaction,
}

impl Observation {
    /// Stamp a transaction with the current time
    pub fn now(source: impl Into<String>, tx: RawTransaction) -> Self {
        Self::at(Utc::now(), source, tx)
    }

    pub fn at(arrival: DateTime<Utc>, source: impl Into<String>, tx: RawTransaction) -> Self {
        Self {
            arrival,
            source: source.into(),
            tx,
        }
    }

    /// Arrival as Unix epoch milliseconds
    pub fn arrival_ms(&self) -> i64 {
        self.arrival.timestamp_millis()
    }

    pub fn hash(&self) -> TxHash {
        self.tx.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_raw, hex_to_bytes};

    const SAMPLE_RAW: &str = "0x02f873018305643b840f2c19f08503f8bfbbb2832ab980940ed1bcc400acd34593451e76f854992198995f52808498e5b12ac080a051eb99ae13fd1ace55dd93a4b36eefa5d34e115cd7b9fd5d0ffac07300cbaeb2a0782d9ad12490b45af932d8c98cb3c2fd8c02cdd6317edb36bde2df7556fa9132";

    #[test]
    fn test_arrival_ms_is_unix_millis() {
        let tx = decode_raw(&hex_to_bytes(SAMPLE_RAW).unwrap()).unwrap();
        let at = DateTime::from_timestamp_millis(1_703_000_000_123).unwrap();
        let obs = Observation::at(at, "local", tx.clone());

        assert_eq!(obs.arrival_ms(), 1_703_000_000_123);
        assert_eq!(obs.source, "local");
        assert_eq!(obs.hash(), tx.hash);
    }

    #[test]
    fn test_now_is_reasonable() {
        let tx = decode_raw(&hex_to_bytes(SAMPLE_RAW).unwrap()).unwrap();
        let obs = Observation::now("blx", tx);
        // After Jan 1, 2024
        assert!(obs.arrival_ms() > 1_704_067_200_000);
    }
}
