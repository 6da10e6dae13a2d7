// Upstream node abstraction.
//
// The indexer needs exactly three things from the node it follows: a
// subscription producing new block headers, full blocks by hash, and an
// account balance at a block number. `ChainAdapter` narrows the upstream
// surface to those, so the protocol can run against the live websocket
// client or the in-memory mock interchangeably.

pub mod ws;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::models::{decimal_string, hex_bytes};

pub use ws::EthNodeClient;

/// A new-head notification. Only the hash drives the protocol; number and
/// parent are carried for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainHeader {
    pub hash: String,
    pub parent_hash: String,
    #[serde(with = "decimal_string")]
    pub number: BigUint,
}

/// A full block as reported by the upstream node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
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
    pub transactions: Vec<ChainTransaction>,
}

impl ChainBlock {
    pub fn header(&self) -> ChainHeader {
        ChainHeader {
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            number: self.number.clone(),
        }
    }
}

/// A transaction inside a `ChainBlock`. Sender recovery happens upstream;
/// the node reports `from` alongside the signed payload. `size` is the
/// node-reported encoded size, 0 when the node does not report one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    pub from: String,
    /// None for contract creation.
    pub to: Option<String>,
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
}

/// Handle on an open new-heads subscription.
///
/// `headers` is a lazy, infinite, non-restartable sequence: headers arrive
/// in publication order but may announce a different fork than the previous
/// one. `errors` fires at most once; any error ends the subscription.
pub struct HeadSubscription {
    pub headers: mpsc::Receiver<ChainHeader>,
    pub errors: oneshot::Receiver<Error>,
}

pub trait ChainAdapter {
    /// Open the new-heads subscription. Failure here, or any error emitted
    /// on the returned channel, terminates the indexing loop.
    fn subscribe_new_heads(&self) -> impl std::future::Future<Output = Result<HeadSubscription>> + Send;

    /// Fetch a full block by hash.
    fn fetch_block(&self, hash: &str) -> impl std::future::Future<Output = Result<ChainBlock>> + Send;

    /// Fetch an account balance at the given block number. May fail when
    /// the node lacks archival state for deep history; the caller surfaces
    /// that failure.
    fn fetch_balance_at(
        &self,
        address: &str,
        number: &BigUint,
    ) -> impl std::future::Future<Output = Result<BigUint>> + Send;
}
