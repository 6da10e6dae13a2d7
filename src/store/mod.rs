// Persistent, queryable mirror of the data model.
//
// Five tables: blocks / orphaned_blocks (one record shape, two tables),
// transactions / orphaned_transactions, balances. The schema is migrated
// idempotently at open. Mutation protocols that must be all-or-nothing run
// through `in_transaction`; a crash mid-way leaves either the pre- or the
// post-state, never a partially migrated hash.

mod queries;

use std::path::Path;

use num_bigint::BigUint;
use rusqlite::Connection;

use crate::error::Result;
use crate::models::{BalanceRecord, BlockRecord, TransactionRecord};

use queries::{BlockTable, TxTable};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    hash         TEXT PRIMARY KEY,
    size         INTEGER NOT NULL,
    parent_hash  TEXT NOT NULL,
    uncle_hash   TEXT NOT NULL,
    coinbase     TEXT NOT NULL,
    state_root   TEXT NOT NULL,
    tx_root      TEXT NOT NULL,
    receipt_root TEXT NOT NULL,
    bloom        BLOB NOT NULL,
    difficulty   TEXT NOT NULL,
    number       TEXT NOT NULL,
    gas_limit    INTEGER NOT NULL,
    gas_used     INTEGER NOT NULL,
    time         INTEGER NOT NULL,
    extra        BLOB NOT NULL,
    mix_digest   TEXT NOT NULL,
    nonce        TEXT NOT NULL,
    base_fee     TEXT NOT NULL
);

-- Non-padded decimal strings order numerically when compared by length
-- first, so this serves number lookups and the O(log N) head probe.
CREATE INDEX IF NOT EXISTS blocks_number_desc
    ON blocks (length(number) DESC, number DESC);

CREATE TABLE IF NOT EXISTS orphaned_blocks (
    hash         TEXT PRIMARY KEY,
    size         INTEGER NOT NULL,
    parent_hash  TEXT NOT NULL,
    uncle_hash   TEXT NOT NULL,
    coinbase     TEXT NOT NULL,
    state_root   TEXT NOT NULL,
    tx_root      TEXT NOT NULL,
    receipt_root TEXT NOT NULL,
    bloom        BLOB NOT NULL,
    difficulty   TEXT NOT NULL,
    number       TEXT NOT NULL,
    gas_limit    INTEGER NOT NULL,
    gas_used     INTEGER NOT NULL,
    time         INTEGER NOT NULL,
    extra        BLOB NOT NULL,
    mix_digest   TEXT NOT NULL,
    nonce        TEXT NOT NULL,
    base_fee     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    hash        TEXT PRIMARY KEY,
    size        INTEGER NOT NULL,
    \"from\"      TEXT NOT NULL,
    type        INTEGER NOT NULL,
    chain_id    TEXT NOT NULL,
    data        BLOB NOT NULL,
    gas         INTEGER NOT NULL,
    gas_price   TEXT NOT NULL,
    gas_tip_cap TEXT NOT NULL,
    gas_fee_cap TEXT NOT NULL,
    value       TEXT NOT NULL,
    nonce       TEXT NOT NULL,
    \"to\"        TEXT NOT NULL,
    block_hash  TEXT NOT NULL REFERENCES blocks (hash)
);

CREATE INDEX IF NOT EXISTS transactions_block_hash
    ON transactions (block_hash);

CREATE TABLE IF NOT EXISTS orphaned_transactions (
    hash                TEXT NOT NULL,
    size                INTEGER NOT NULL,
    \"from\"              TEXT NOT NULL,
    type                INTEGER NOT NULL,
    chain_id            TEXT NOT NULL,
    data                BLOB NOT NULL,
    gas                 INTEGER NOT NULL,
    gas_price           TEXT NOT NULL,
    gas_tip_cap         TEXT NOT NULL,
    gas_fee_cap         TEXT NOT NULL,
    value               TEXT NOT NULL,
    nonce               TEXT NOT NULL,
    \"to\"                TEXT NOT NULL,
    orphaned_block_hash TEXT NOT NULL REFERENCES orphaned_blocks (hash),
    PRIMARY KEY (hash, orphaned_block_hash)
);

CREATE INDEX IF NOT EXISTS orphaned_transactions_block_hash
    ON orphaned_transactions (orphaned_block_hash);

CREATE TABLE IF NOT EXISTS balances (
    address    TEXT NOT NULL,
    block_hash TEXT NOT NULL REFERENCES blocks (hash),
    balance    TEXT NOT NULL,
    PRIMARY KEY (address, block_hash)
);
";

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if missing) the index database at `path` and run the
    /// idempotent schema migration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::initialize(conn)
    }

    /// In-memory store for tests and scenario replay.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store { conn })
    }

    /// Run `f` inside a single store transaction: committed when `f`
    /// returns Ok, rolled back when it returns Err.
    pub fn in_transaction<T>(&mut self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let tx = StoreTx { tx: self.conn.transaction()? };
        let out = f(&tx)?;
        tx.tx.commit()?;
        Ok(out)
    }

    // ---- reads -----------------------------------------------------------

    pub fn get_head(&self) -> Result<BlockRecord> {
        queries::get_head(&self.conn)
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Result<BlockRecord> {
        queries::get_block_by_hash(&self.conn, BlockTable::Blocks, hash)
    }

    pub fn get_block_by_number(&self, number: &BigUint) -> Result<BlockRecord> {
        queries::get_block_by_number(&self.conn, number)
    }

    pub fn get_orphaned_block_by_hash(&self, hash: &str) -> Result<BlockRecord> {
        queries::get_block_by_hash(&self.conn, BlockTable::OrphanedBlocks, hash)
    }

    /// Whether `hash` is present in either block table.
    pub fn contains_hash(&self, hash: &str) -> Result<bool> {
        queries::contains_hash(&self.conn, hash)
    }

    pub fn get_transactions_for_block(&self, block_hash: &str) -> Result<Vec<TransactionRecord>> {
        queries::transactions_for_block(&self.conn, TxTable::Transactions, block_hash)
    }

    pub fn get_orphaned_transactions_for_block(&self, block_hash: &str) -> Result<Vec<TransactionRecord>> {
        queries::transactions_for_block(&self.conn, TxTable::OrphanedTransactions, block_hash)
    }

    /// Canonical transaction lookup, optionally joined to its block.
    pub fn get_transaction_by_hash(
        &self,
        hash: &str,
        include_block: bool,
    ) -> Result<(TransactionRecord, Option<BlockRecord>)> {
        let tx = queries::get_transaction_by_hash(&self.conn, hash)?;
        let block = if include_block {
            Some(queries::get_block_by_hash(&self.conn, BlockTable::Blocks, &tx.block_hash)?)
        } else {
            None
        };
        Ok((tx, block))
    }

    /// Every orphaned copy of a transaction, each joined to its orphaned
    /// block.
    pub fn get_orphaned_transactions_by_hash(
        &self,
        hash: &str,
    ) -> Result<Vec<(TransactionRecord, BlockRecord)>> {
        queries::orphaned_transactions_by_hash(&self.conn, hash)
    }

    pub fn get_balance(&self, address: &str, block_hash: &str) -> Result<BalanceRecord> {
        queries::get_balance(&self.conn, address, block_hash)
    }

    pub fn get_most_expensive_transaction_for_block(&self, block_hash: &str) -> Result<TransactionRecord> {
        queries::most_expensive_transaction(&self.conn, block_hash)
    }

    /// Row counts as (blocks, orphaned_blocks, transactions,
    /// orphaned_transactions, balances).
    pub fn table_counts(&self) -> Result<[u64; 5]> {
        queries::table_counts(&self.conn)
    }

    // ---- writes ----------------------------------------------------------

    pub fn create_block(&self, block: &BlockRecord) -> Result<()> {
        queries::insert_block(&self.conn, BlockTable::Blocks, block)
    }

    pub fn create_orphaned_block(&self, block: &BlockRecord) -> Result<()> {
        queries::insert_block(&self.conn, BlockTable::OrphanedBlocks, block)
    }

    pub fn create_transaction(&self, tx: &TransactionRecord) -> Result<()> {
        queries::insert_transaction(&self.conn, TxTable::Transactions, tx)
    }

    pub fn create_orphaned_transaction(&self, tx: &TransactionRecord) -> Result<()> {
        queries::insert_transaction(&self.conn, TxTable::OrphanedTransactions, tx)
    }

    pub fn create_balance(&self, balance: &BalanceRecord) -> Result<()> {
        queries::insert_balance(&self.conn, balance)
    }

    pub fn delete_block(&self, hash: &str) -> Result<()> {
        queries::delete_block(&self.conn, BlockTable::Blocks, hash)
    }

    pub fn delete_orphaned_block(&self, hash: &str) -> Result<()> {
        queries::delete_block(&self.conn, BlockTable::OrphanedBlocks, hash)
    }

    pub fn delete_transactions_for_block(&self, block_hash: &str) -> Result<()> {
        queries::delete_transactions_for_block(&self.conn, TxTable::Transactions, block_hash)
    }

    pub fn delete_orphaned_transactions_for_block(&self, block_hash: &str) -> Result<()> {
        queries::delete_transactions_for_block(&self.conn, TxTable::OrphanedTransactions, block_hash)
    }

    pub fn delete_balances_for_block(&self, block_hash: &str) -> Result<()> {
        queries::delete_balances_for_block(&self.conn, block_hash)
    }

    /// Unscoped wipe in dependency-safe order: transactions, balances,
    /// blocks, orphaned transactions, orphaned blocks. Test harness only.
    pub fn clear_all(&self) -> Result<()> {
        queries::clear_all(&self.conn)
    }
}

/// An open store transaction. Exposes the same primitives as `Store`;
/// everything issued through it commits or rolls back together.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StoreTx<'_> {
    pub fn get_head(&self) -> Result<BlockRecord> {
        queries::get_head(&self.tx)
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Result<BlockRecord> {
        queries::get_block_by_hash(&self.tx, BlockTable::Blocks, hash)
    }

    pub fn get_orphaned_block_by_hash(&self, hash: &str) -> Result<BlockRecord> {
        queries::get_block_by_hash(&self.tx, BlockTable::OrphanedBlocks, hash)
    }

    pub fn get_transactions_for_block(&self, block_hash: &str) -> Result<Vec<TransactionRecord>> {
        queries::transactions_for_block(&self.tx, TxTable::Transactions, block_hash)
    }

    pub fn get_orphaned_transactions_for_block(&self, block_hash: &str) -> Result<Vec<TransactionRecord>> {
        queries::transactions_for_block(&self.tx, TxTable::OrphanedTransactions, block_hash)
    }

    pub fn create_block(&self, block: &BlockRecord) -> Result<()> {
        queries::insert_block(&self.tx, BlockTable::Blocks, block)
    }

    pub fn create_orphaned_block(&self, block: &BlockRecord) -> Result<()> {
        queries::insert_block(&self.tx, BlockTable::OrphanedBlocks, block)
    }

    pub fn create_transaction(&self, tx: &TransactionRecord) -> Result<()> {
        queries::insert_transaction(&self.tx, TxTable::Transactions, tx)
    }

    pub fn create_orphaned_transaction(&self, tx: &TransactionRecord) -> Result<()> {
        queries::insert_transaction(&self.tx, TxTable::OrphanedTransactions, tx)
    }

    pub fn create_balance(&self, balance: &BalanceRecord) -> Result<()> {
        queries::insert_balance(&self.tx, balance)
    }

    pub fn delete_block(&self, hash: &str) -> Result<()> {
        queries::delete_block(&self.tx, BlockTable::Blocks, hash)
    }

    pub fn delete_orphaned_block(&self, hash: &str) -> Result<()> {
        queries::delete_block(&self.tx, BlockTable::OrphanedBlocks, hash)
    }

    pub fn delete_transactions_for_block(&self, block_hash: &str) -> Result<()> {
        queries::delete_transactions_for_block(&self.tx, TxTable::Transactions, block_hash)
    }

    pub fn delete_orphaned_transactions_for_block(&self, block_hash: &str) -> Result<()> {
        queries::delete_transactions_for_block(&self.tx, TxTable::OrphanedTransactions, block_hash)
    }

    pub fn delete_balances_for_block(&self, block_hash: &str) -> Result<()> {
        queries::delete_balances_for_block(&self.tx, block_hash)
    }
}
