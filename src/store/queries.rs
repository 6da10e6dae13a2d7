// Row-level SQL for the five-table schema.
//
// The canonical and orphaned tables of a kind share one record type, so
// each statement is written once and parameterized by table. Arbitrary-
// precision columns are decimal TEXT; `big_text`/`read_big` convert at the
// boundary and never truncate.

use num_bigint::BigUint;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

use crate::error::{Error, Result};
use crate::models::{BalanceRecord, BlockRecord, TransactionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockTable {
    Blocks,
    OrphanedBlocks,
}

impl BlockTable {
    fn name(self) -> &'static str {
        match self {
            BlockTable::Blocks => "blocks",
            BlockTable::OrphanedBlocks => "orphaned_blocks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxTable {
    Transactions,
    OrphanedTransactions,
}

impl TxTable {
    fn name(self) -> &'static str {
        match self {
            TxTable::Transactions => "transactions",
            TxTable::OrphanedTransactions => "orphaned_transactions",
        }
    }

    fn fk_column(self) -> &'static str {
        match self {
            TxTable::Transactions => "block_hash",
            TxTable::OrphanedTransactions => "orphaned_block_hash",
        }
    }
}

const BLOCK_COLUMNS: &str = "hash, size, parent_hash, uncle_hash, coinbase, state_root, \
     tx_root, receipt_root, bloom, difficulty, number, gas_limit, gas_used, time, extra, \
     mix_digest, nonce, base_fee";

fn tx_columns(table: TxTable) -> String {
    format!(
        "hash, size, \"from\", type, chain_id, data, gas, gas_price, gas_tip_cap, \
         gas_fee_cap, value, nonce, \"to\", {}",
        table.fk_column()
    )
}

fn big_text(value: &BigUint) -> String {
    value.to_str_radix(10)
}

fn read_big(row: &Row<'_>, index: usize) -> rusqlite::Result<BigUint> {
    let text: String = row.get(index)?;
    BigUint::parse_bytes(text.as_bytes(), 10).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            format!("invalid decimal numeric: {}", text).into(),
        )
    })
}

fn block_from_row_at(row: &Row<'_>, at: usize) -> rusqlite::Result<BlockRecord> {
    Ok(BlockRecord {
        hash: row.get(at)?,
        size: row.get(at + 1)?,
        parent_hash: row.get(at + 2)?,
        uncle_hash: row.get(at + 3)?,
        coinbase: row.get(at + 4)?,
        state_root: row.get(at + 5)?,
        tx_root: row.get(at + 6)?,
        receipt_root: row.get(at + 7)?,
        bloom: row.get(at + 8)?,
        difficulty: read_big(row, at + 9)?,
        number: read_big(row, at + 10)?,
        gas_limit: row.get(at + 11)?,
        gas_used: row.get(at + 12)?,
        time: row.get(at + 13)?,
        extra: row.get(at + 14)?,
        mix_digest: row.get(at + 15)?,
        nonce: read_big(row, at + 16)?,
        base_fee: read_big(row, at + 17)?,
    })
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<BlockRecord> {
    block_from_row_at(row, 0)
}

fn tx_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        hash: row.get(0)?,
        size: row.get(1)?,
        from: row.get(2)?,
        tx_type: row.get(3)?,
        chain_id: read_big(row, 4)?,
        data: row.get(5)?,
        gas: row.get(6)?,
        gas_price: read_big(row, 7)?,
        gas_tip_cap: read_big(row, 8)?,
        gas_fee_cap: read_big(row, 9)?,
        value: read_big(row, 10)?,
        nonce: read_big(row, 11)?,
        to: row.get(12)?,
        block_hash: row.get(13)?,
    })
}

pub(crate) fn insert_block(conn: &Connection, table: BlockTable, block: &BlockRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        table.name(),
        BLOCK_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            block.hash,
            block.size,
            block.parent_hash,
            block.uncle_hash,
            block.coinbase,
            block.state_root,
            block.tx_root,
            block.receipt_root,
            block.bloom,
            big_text(&block.difficulty),
            big_text(&block.number),
            block.gas_limit,
            block.gas_used,
            block.time,
            block.extra,
            block.mix_digest,
            big_text(&block.nonce),
            big_text(&block.base_fee),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_block_by_hash(conn: &Connection, table: BlockTable, hash: &str) -> Result<BlockRecord> {
    let sql = format!("SELECT {} FROM {} WHERE hash = ?1", BLOCK_COLUMNS, table.name());
    Ok(conn.query_row(&sql, params![hash], block_from_row)?)
}

/// The head is the canonical block with the maximum number. Decimal strings
/// without leading zeros compare numerically when ordered by length first;
/// rowid prefers the most recently inserted block on a number tie.
pub(crate) fn get_head(conn: &Connection) -> Result<BlockRecord> {
    let sql = format!(
        "SELECT {} FROM blocks ORDER BY length(number) DESC, number DESC, rowid DESC LIMIT 1",
        BLOCK_COLUMNS
    );
    Ok(conn.query_row(&sql, [], block_from_row)?)
}

pub(crate) fn get_block_by_number(conn: &Connection, number: &BigUint) -> Result<BlockRecord> {
    let sql = format!("SELECT {} FROM blocks WHERE number = ?1", BLOCK_COLUMNS);
    Ok(conn.query_row(&sql, params![big_text(number)], block_from_row)?)
}

/// Dedup probe: is this hash present in either block table?
pub(crate) fn contains_hash(conn: &Connection, hash: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM blocks WHERE hash = ?1) \
             + (SELECT COUNT(*) FROM orphaned_blocks WHERE hash = ?1)",
        params![hash],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn delete_block(conn: &Connection, table: BlockTable, hash: &str) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE hash = ?1", table.name());
    conn.execute(&sql, params![hash])?;
    Ok(())
}

pub(crate) fn insert_transaction(conn: &Connection, table: TxTable, tx: &TransactionRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        table.name(),
        tx_columns(table)
    );
    conn.execute(
        &sql,
        params![
            tx.hash,
            tx.size,
            tx.from,
            tx.tx_type,
            big_text(&tx.chain_id),
            tx.data,
            tx.gas,
            big_text(&tx.gas_price),
            big_text(&tx.gas_tip_cap),
            big_text(&tx.gas_fee_cap),
            big_text(&tx.value),
            big_text(&tx.nonce),
            tx.to,
            tx.block_hash,
        ],
    )?;
    Ok(())
}

pub(crate) fn transactions_for_block(
    conn: &Connection,
    table: TxTable,
    block_hash: &str,
) -> Result<Vec<TransactionRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1 ORDER BY rowid",
        tx_columns(table),
        table.name(),
        table.fk_column()
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map(params![block_hash], tx_from_row)?;
    let mut transactions = Vec::new();
    for row in rows {
        transactions.push(row?);
    }
    Ok(transactions)
}

pub(crate) fn get_transaction_by_hash(conn: &Connection, hash: &str) -> Result<TransactionRecord> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE hash = ?1",
        tx_columns(TxTable::Transactions)
    );
    Ok(conn.query_row(&sql, params![hash], tx_from_row)?)
}

/// Every orphaned copy of a transaction hash, each joined to the orphaned
/// block holding it.
pub(crate) fn orphaned_transactions_by_hash(
    conn: &Connection,
    hash: &str,
) -> Result<Vec<(TransactionRecord, BlockRecord)>> {
    let block_columns: String = BLOCK_COLUMNS
        .split(", ")
        .map(|column| format!("b.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let tx_cols: String = tx_columns(TxTable::OrphanedTransactions)
        .split(", ")
        .map(|column| format!("t.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {}, {} FROM orphaned_transactions t \
         JOIN orphaned_blocks b ON b.hash = t.orphaned_block_hash \
         WHERE t.hash = ?1 ORDER BY t.rowid",
        tx_cols, block_columns
    );

    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map(params![hash], |row| {
        Ok((tx_from_row(row)?, block_from_row_at(row, 14)?))
    })?;
    let mut joined = Vec::new();
    for row in rows {
        joined.push(row?);
    }
    Ok(joined)
}

/// Highest `gas * gas_price` wins. The product is computed over the exact
/// decimal values, not a floating-point cast.
pub(crate) fn most_expensive_transaction(conn: &Connection, block_hash: &str) -> Result<TransactionRecord> {
    let transactions = transactions_for_block(conn, TxTable::Transactions, block_hash)?;
    transactions
        .into_iter()
        .max_by_key(|tx| BigUint::from(tx.gas) * &tx.gas_price)
        .ok_or(Error::NotFound)
}

pub(crate) fn delete_transactions_for_block(
    conn: &Connection,
    table: TxTable,
    block_hash: &str,
) -> Result<()> {
    let sql = format!("DELETE FROM {} WHERE {} = ?1", table.name(), table.fk_column());
    conn.execute(&sql, params![block_hash])?;
    Ok(())
}

pub(crate) fn insert_balance(conn: &Connection, balance: &BalanceRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO balances (address, block_hash, balance) VALUES (?1, ?2, ?3)",
        params![balance.address, balance.block_hash, big_text(&balance.balance)],
    )?;
    Ok(())
}

pub(crate) fn get_balance(conn: &Connection, address: &str, block_hash: &str) -> Result<BalanceRecord> {
    Ok(conn.query_row(
        "SELECT address, block_hash, balance FROM balances WHERE address = ?1 AND block_hash = ?2",
        params![address, block_hash],
        |row| {
            Ok(BalanceRecord {
                address: row.get(0)?,
                block_hash: row.get(1)?,
                balance: read_big(row, 2)?,
            })
        },
    )?)
}

pub(crate) fn delete_balances_for_block(conn: &Connection, block_hash: &str) -> Result<()> {
    conn.execute("DELETE FROM balances WHERE block_hash = ?1", params![block_hash])?;
    Ok(())
}

/// Unscoped wipe in dependency-safe order. Test-harness use only.
pub(crate) fn clear_all(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM transactions", [])?;
    conn.execute("DELETE FROM balances", [])?;
    conn.execute("DELETE FROM blocks", [])?;
    conn.execute("DELETE FROM orphaned_transactions", [])?;
    conn.execute("DELETE FROM orphaned_blocks", [])?;
    Ok(())
}

/// Row counts per table, for idempotence assertions in tests.
pub(crate) fn table_counts(conn: &Connection) -> Result<[u64; 5]> {
    let count = |table: &str| -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))? as u64)
    };
    Ok([
        count("blocks")?,
        count("orphaned_blocks")?,
        count("transactions")?,
        count("orphaned_transactions")?,
        count("balances")?,
    ])
}
