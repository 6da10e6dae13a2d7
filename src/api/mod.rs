// HTTP query surface.
//
// Serves the indexed store; never writes to it. The store handle is a
// separate read connection from the indexing process's.

mod handlers;
mod helpers;

use std::sync::Arc;

use axum::routing::get;
use axum::{Extension, Router};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::{Error, Result};
use crate::store::Store;

pub use handlers::BlocksByTransactionHash;
pub use helpers::ApiError;

pub type SharedStore = Arc<Mutex<Store>>;

pub fn router(store: SharedStore) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/getHead", get(handlers::get_head))
        .route("/getBlockByHash/{blockHash}", get(handlers::get_block_by_hash))
        .route("/getBlockByNumber/{blockNumber}", get(handlers::get_block_by_number))
        .route(
            "/getBlocksByTransactionHash/{transactionHash}",
            get(handlers::get_blocks_by_transaction_hash),
        )
        .route(
            "/getTransactionByHash/{transactionHash}",
            get(handlers::get_transaction_by_hash),
        )
        .route(
            "/getAddressBalanceByBlockHash/{address}/{blockHash}",
            get(handlers::get_address_balance_by_block_hash),
        )
        .route("/metrics", get(handlers::get_metrics))
        .layer(cors)
        .layer(Extension(store))
}

/// Bind and serve until the process exits.
pub async fn serve(bind: &str, store: Store) -> Result<()> {
    let app = router(Arc::new(Mutex::new(store)));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| Error::invalid_input(format!("binding {}: {}", bind, err)))?;
    info!(address = %bind, "listening for queries");

    axum::serve(listener, app)
        .await
        .map_err(|err| Error::invalid_input(format!("server failed: {}", err)))
}
