// Query endpoints.
//
// The query surface reads the store only; indexing happens in a separate
// process. Responses serialize bignums as decimal strings and byte
// columns as 0x-prefixed hex, exactly as the records do.

use axum::extract::Path;
use axum::{Extension, Json};
use num_bigint::BigUint;
use serde::Serialize;
use tracing::debug;

use super::helpers::{bad_request, store_error, ApiResult};
use super::SharedStore;
use crate::config::is_hex_address;
use crate::metrics;
use crate::models::{BalanceRecord, BlockRecord, TransactionRecord};

/// GET /getHead: the canonical block of maximum number. 404 while the
/// store is empty.
pub async fn get_head(Extension(store): Extension<SharedStore>) -> ApiResult<BlockRecord> {
    let store = store.lock().await;
    store.get_head().map(Json).map_err(store_error)
}

/// GET /getBlockByHash/{blockHash}
pub async fn get_block_by_hash(
    Path(block_hash): Path<String>,
    Extension(store): Extension<SharedStore>,
) -> ApiResult<BlockRecord> {
    let store = store.lock().await;
    store.get_block_by_hash(&block_hash).map(Json).map_err(store_error)
}

/// GET /getBlockByNumber/{blockNumber}. The number is an
/// arbitrary-precision decimal.
pub async fn get_block_by_number(
    Path(block_number): Path<String>,
    Extension(store): Extension<SharedStore>,
) -> ApiResult<BlockRecord> {
    let number = match BigUint::parse_bytes(block_number.as_bytes(), 10) {
        Some(number) => number,
        None => return Err(bad_request(format!("invalid block number: {}", block_number))),
    };

    let store = store.lock().await;
    store.get_block_by_number(&number).map(Json).map_err(store_error)
}

#[derive(Debug, Serialize)]
pub struct BlocksByTransactionHash {
    pub canonical_block: BlockRecord,
    pub orphaned_blocks: Vec<BlockRecord>,
}

/// GET /getBlocksByTransactionHash/{transactionHash}: the canonical block
/// holding the transaction plus every orphaned block holding a copy.
pub async fn get_blocks_by_transaction_hash(
    Path(transaction_hash): Path<String>,
    Extension(store): Extension<SharedStore>,
) -> ApiResult<BlocksByTransactionHash> {
    let store = store.lock().await;

    let (_, block) = store
        .get_transaction_by_hash(&transaction_hash, true)
        .map_err(store_error)?;
    let canonical_block = match block {
        Some(block) => block,
        None => {
            debug!(hash = %transaction_hash, "transaction row without a joined block");
            return Err(store_error(crate::error::Error::NotFound));
        }
    };

    let orphaned_blocks = store
        .get_orphaned_transactions_by_hash(&transaction_hash)
        .map_err(store_error)?
        .into_iter()
        .map(|(_, block)| block)
        .collect();

    Ok(Json(BlocksByTransactionHash { canonical_block, orphaned_blocks }))
}

/// GET /getTransactionByHash/{transactionHash}
pub async fn get_transaction_by_hash(
    Path(transaction_hash): Path<String>,
    Extension(store): Extension<SharedStore>,
) -> ApiResult<TransactionRecord> {
    let store = store.lock().await;
    store
        .get_transaction_by_hash(&transaction_hash, false)
        .map(|(transaction, _)| Json(transaction))
        .map_err(store_error)
}

/// GET /getAddressBalanceByBlockHash/{address}/{blockHash}
pub async fn get_address_balance_by_block_hash(
    Path((address, block_hash)): Path<(String, String)>,
    Extension(store): Extension<SharedStore>,
) -> ApiResult<BalanceRecord> {
    if !is_hex_address(&address) {
        return Err(bad_request(format!("invalid address: {}", address)));
    }

    let store = store.lock().await;
    store.get_balance(&address, &block_hash).map(Json).map_err(store_error)
}

/// GET /metrics, Prometheus text exposition.
pub async fn get_metrics() -> String {
    metrics::encode()
}
