// Persisted record types.
//
// One structural record backs both the canonical and the orphaned table of
// its kind: a block is a `BlockRecord` whether it lives in `blocks` or in
// `orphaned_blocks`, and likewise for transactions. Which table a record
// occupies is the only thing that changes when a fork flips.
//
// Bignum columns (difficulty, number, nonce, base fee, value, gas prices,
// balances) are carried as `BigUint` in memory and serialized as decimal
// strings, so no width is ever truncated. Hashes and addresses are
// 0x-prefixed hex strings; raw byte columns serialize as 0x-prefixed hex.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: String,
    pub size: u64,
    pub parent_hash: String,
    pub uncle_hash: String,
    pub coinbase: String,
    pub state_root: String,
    pub tx_root: String,
    pub receipt_root: String,
    #[serde(with = "hex_bytes")]
    pub bloom: Vec<u8>,
    #[serde(with = "decimal_string")]
    pub difficulty: BigUint,
    #[serde(with = "decimal_string")]
    pub number: BigUint,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    #[serde(with = "hex_bytes")]
    pub extra: Vec<u8>,
    pub mix_digest: String,
    #[serde(with = "decimal_string")]
    pub nonce: BigUint,
    #[serde(with = "decimal_string")]
    pub base_fee: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub size: u64,
    pub from: String,
    #[serde(rename = "type")]
    pub tx_type: u8,
    #[serde(with = "decimal_string")]
    pub chain_id: BigUint,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub gas: u64,
    #[serde(with = "decimal_string")]
    pub gas_price: BigUint,
    #[serde(with = "decimal_string")]
    pub gas_tip_cap: BigUint,
    #[serde(with = "decimal_string")]
    pub gas_fee_cap: BigUint,
    #[serde(with = "decimal_string")]
    pub value: BigUint,
    #[serde(with = "decimal_string")]
    pub nonce: BigUint,
    /// Empty string when the transaction creates a contract.
    pub to: String,
    /// FK to `blocks.hash` or `orphaned_blocks.hash`, depending on which
    /// table this record occupies.
    pub block_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub address: String,
    pub block_hash: String,
    #[serde(with = "decimal_string")]
    pub balance: BigUint,
}

/// Serialize a `BigUint` as a decimal string and parse one back.
pub mod decimal_string {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let text = String::deserialize(deserializer)?;
        BigUint::parse_bytes(text.as_bytes(), 10)
            .ok_or_else(|| de::Error::custom(format!("invalid decimal number: {}", text)))
    }
}

/// Serialize raw bytes as 0x-prefixed hex and parse them back.
pub mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim_start_matches("0x"))
            .map_err(|err| de::Error::custom(format!("invalid hex: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bignum_round_trips_without_truncation() {
        // Wider than u128.
        let value = BigUint::parse_bytes(b"340282366920938463463374607431768211456789", 10).unwrap();
        let record = BalanceRecord {
            address: "0x00112233445566778899aabbccddeeff00112233".to_string(),
            block_hash: "0xabc".to_string(),
            balance: value.clone(),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"340282366920938463463374607431768211456789\""));

        let back: BalanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.balance, value);
    }

    #[test]
    fn byte_columns_serialize_as_prefixed_hex() {
        #[derive(Serialize, Deserialize)]
        struct Wrap {
            #[serde(with = "hex_bytes")]
            data: Vec<u8>,
        }

        let json = serde_json::to_string(&Wrap { data: vec![0xde, 0xad] }).unwrap();
        assert_eq!(json, r#"{"data":"0xdead"}"#);
        let back: Wrap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, vec![0xde, 0xad]);
    }

    #[test]
    fn tx_type_serializes_under_wire_name() {
        let tx = TransactionRecord {
            hash: "0x01".into(),
            size: 0,
            from: "0x02".into(),
            tx_type: 2,
            chain_id: BigUint::from(1u8),
            data: vec![],
            gas: 21000,
            gas_price: BigUint::from(7u8),
            gas_tip_cap: BigUint::from(1u8),
            gas_fee_cap: BigUint::from(9u8),
            value: BigUint::from(0u8),
            nonce: BigUint::from(0u8),
            to: String::new(),
            block_hash: "0x03".into(),
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], 2);
    }
}
