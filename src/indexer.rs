// The fork-aware indexing state machine.
//
// Per-block state lives in the store: a hash is absent, canonical, or
// orphaned, and the only transitions are the ones issued here. Each
// incoming header is resolved to a full block and classified as a
// duplicate, a cold start, a linear extension, or a fork; forks are
// decided by total difficulty accumulated since the common canonical
// ancestor. Headers are handled strictly one at a time.
//
// Every composite mutation (new canonical block, new orphan, and the whole
// of a reorg) runs in a single store transaction, so a crash leaves either
// the pre- or the post-state. Balance lookups hit the upstream node and
// are completed before the transaction opens.

use num_bigint::BigUint;
use num_traits::Zero;
use tracing::{debug, info, warn};

use crate::chain::{ChainAdapter, ChainBlock};
use crate::error::{Error, Result};
use crate::mapper::{to_balance_record, to_block_record, to_transaction_record};
use crate::models::{BalanceRecord, BlockRecord};
use crate::store::{Store, StoreTx};
use crate::telemetry::truncate_hex;
use crate::{config, metrics};

pub struct Indexer<C> {
    store: Store,
    chain: C,
    tracked_addresses: Vec<String>,
    max_reorg_depth: u64,
}

impl<C: ChainAdapter> Indexer<C> {
    /// Construct an indexer owning its store and adapter handles. Tracked
    /// addresses are validated here; a malformed one rejects the
    /// configuration.
    pub fn new(
        store: Store,
        chain: C,
        tracked_addresses: Vec<String>,
        max_reorg_depth: u64,
    ) -> Result<Self> {
        for address in &tracked_addresses {
            if !config::is_hex_address(address) {
                return Err(Error::invalid_input(format!(
                    "tracked address {} is not 20-byte 0x-prefixed hex",
                    address
                )));
            }
        }

        Ok(Indexer {
            store,
            chain,
            tracked_addresses,
            max_reorg_depth,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Give up the store handle, e.g. to hand it to the query surface.
    pub fn into_store(self) -> Store {
        self.store
    }

    /// Drive the event loop: open the new-heads subscription and index
    /// every header in receipt order. Returns only on failure: a
    /// subscription error, or any error a single `index` call could not
    /// recover.
    pub async fn run(&mut self) -> Result<()> {
        let mut subscription = self.chain.subscribe_new_heads().await?;
        info!("listening for new blocks");

        loop {
            tokio::select! {
                // Delivered headers are processed before a pending
                // subscription error terminates the loop.
                biased;

                header = subscription.headers.recv() => {
                    match header {
                        Some(header) => self.index(&header.hash).await?,
                        None => break,
                    }
                }
                error = &mut subscription.errors => {
                    return Err(match error {
                        Ok(error) => error,
                        Err(_) => Error::adapter("subscription dropped without an error"),
                    });
                }
            }
        }

        // The header stream closed; surface the terminal error if the
        // subscription delivered one.
        Err(match subscription.errors.try_recv() {
            Ok(error) => error,
            Err(_) => Error::adapter("header stream ended"),
        })
    }

    /// Handle one header: fetch the full block and move it into the store
    /// under the fork-aware protocol. Feeding an already-indexed hash is a
    /// no-op.
    pub async fn index(&mut self, block_hash: &str) -> Result<()> {
        let block = self.chain.fetch_block(block_hash).await?;

        if self.store.contains_hash(&block.hash)? {
            debug!(hash = %truncate_hex(&block.hash, 16), "block already indexed, skipping");
            return Ok(());
        }

        let head = match self.store.get_head() {
            Ok(head) => head,
            Err(error) if error.is_not_found() => {
                // Nothing indexed yet; the first block seen is canonical.
                return self.index_new_canonical(&block).await;
            }
            Err(error) => return Err(error),
        };

        if block.parent_hash == head.hash {
            return self.index_new_canonical(&block).await;
        }

        self.handle_fork(block, head).await
    }

    /// The new block does not extend the head. Back-fill any missed fork
    /// ancestors, find the canonical ancestor, and compare the total
    /// difficulty both chains accumulated since it.
    async fn handle_fork(&mut self, block: ChainBlock, head: BlockRecord) -> Result<()> {
        if !self.store.contains_hash(&block.parent_hash)? {
            self.index_missed_as_orphans(&block.parent_hash).await?;
        }

        let candidate = to_block_record(&block);
        let ancestor = self.find_canonical_ancestor_hash(&candidate.parent_hash)?;
        let canonical_difficulty = self.total_canonical_difficulty_since(&ancestor, &head)?;
        let fork_difficulty = self.total_orphaned_difficulty_since(&ancestor, &candidate)?;

        if fork_difficulty > canonical_difficulty {
            self.reorg(&block, &head, &ancestor).await
        } else if fork_difficulty == canonical_difficulty && candidate.number < head.number {
            // Equal total difficulty from a shorter fork: it accumulates
            // difficulty strictly faster per block, so it will win once it
            // reaches the head's number. Switch now.
            self.reorg(&block, &head, &ancestor).await
        } else {
            self.index_new_orphaned(&block)
        }
    }

    /// Insert a block, its transactions, and tracked-address balances as
    /// the new canonical tip.
    async fn index_new_canonical(&mut self, block: &ChainBlock) -> Result<()> {
        let record = to_block_record(block);
        let balances = self.fetch_balances(&record.number, &record.hash).await?;

        self.store.in_transaction(|tx| {
            tx.create_block(&record)?;
            for transaction in &block.transactions {
                tx.create_transaction(&to_transaction_record(transaction, &record.hash))?;
            }
            for balance in &balances {
                tx.create_balance(balance)?;
            }
            Ok(())
        })?;

        metrics::BLOCKS_INDEXED.inc();
        metrics::set_head_number(&record.number);
        info!(
            hash = %truncate_hex(&record.hash, 16),
            number = %record.number,
            transactions = block.transactions.len(),
            "indexed block"
        );
        Ok(())
    }

    /// Insert a block and its transactions on the orphaned side. No
    /// balances are materialized for orphans.
    fn index_new_orphaned(&mut self, block: &ChainBlock) -> Result<()> {
        let record = to_block_record(block);

        self.store.in_transaction(|tx| {
            tx.create_orphaned_block(&record)?;
            for transaction in &block.transactions {
                tx.create_orphaned_transaction(&to_transaction_record(transaction, &record.hash))?;
            }
            Ok(())
        })?;

        metrics::ORPHANED_BLOCKS_INDEXED.inc();
        info!(
            hash = %truncate_hex(&record.hash, 16),
            number = %record.number,
            "indexed orphaned block"
        );
        Ok(())
    }

    /// Walk backwards from a missing fork parent, fetching and inserting
    /// each ancestor as an orphan, until an already-indexed block (in
    /// either table) is reached. Converges because the common ancestor is
    /// assumed to lie within the indexed prefix; the depth bound catches
    /// the case where it does not.
    async fn index_missed_as_orphans(&mut self, first_missing: &str) -> Result<()> {
        let mut hash = first_missing.to_string();
        let mut depth: u64 = 0;

        while !self.store.contains_hash(&hash)? {
            depth += 1;
            if depth > self.max_reorg_depth {
                return Err(Error::ReorgTooDeep { depth: self.max_reorg_depth });
            }

            let block = self.chain.fetch_block(&hash).await?;
            let parent_hash = block.parent_hash.clone();
            warn!(
                hash = %truncate_hex(&hash, 16),
                number = %block.number,
                "back-filling missed block as orphan"
            );
            self.index_new_orphaned(&block)?;
            metrics::GAP_FILLED_BLOCKS.inc();
            hash = parent_hash;
        }

        Ok(())
    }

    /// Follow parent pointers through the orphaned table; the first hash
    /// with no orphaned row is the canonical ancestor. Assumes the fork's
    /// ancestors are already present (after gap fill).
    fn find_canonical_ancestor_hash(&self, orphaned_parent_hash: &str) -> Result<String> {
        let mut hash = orphaned_parent_hash.to_string();
        let mut depth: u64 = 0;

        loop {
            match self.store.get_orphaned_block_by_hash(&hash) {
                Ok(orphan) => {
                    hash = orphan.parent_hash;
                    depth += 1;
                    if depth > self.max_reorg_depth {
                        return Err(Error::ReorgTooDeep { depth: self.max_reorg_depth });
                    }
                }
                Err(error) if error.is_not_found() => return Ok(hash),
                Err(error) => return Err(error),
            }
        }
    }

    /// Sum of difficulty from `head` (inclusive) back to the ancestor
    /// (exclusive), walking canonical rows.
    fn total_canonical_difficulty_since(&self, ancestor: &str, head: &BlockRecord) -> Result<BigUint> {
        let mut total = BigUint::zero();
        let mut current = head.clone();

        while current.hash != ancestor {
            total += &current.difficulty;
            current = self.store.get_block_by_hash(&current.parent_hash)?;
        }

        Ok(total)
    }

    /// Sum of difficulty from the fork tip (inclusive, not yet stored)
    /// back to the ancestor (exclusive), walking orphaned rows.
    fn total_orphaned_difficulty_since(&self, ancestor: &str, tip: &BlockRecord) -> Result<BigUint> {
        let mut total = tip.difficulty.clone();
        let mut current = tip.clone();

        while current.parent_hash != ancestor {
            current = self.store.get_orphaned_block_by_hash(&current.parent_hash)?;
            total += &current.difficulty;
        }

        Ok(total)
    }

    /// Switch the canonical designation from the chain ending at
    /// `old_head` to the fork ending at `new_tip`, pivoting on their
    /// common ancestor. Runs as one store transaction.
    async fn reorg(&mut self, new_tip: &ChainBlock, old_head: &BlockRecord, ancestor: &str) -> Result<()> {
        // Old canonical prefix, head first, ancestor excluded.
        let mut to_orphan = Vec::new();
        let mut current = old_head.clone();
        while current.hash != ancestor {
            let parent_hash = current.parent_hash.clone();
            to_orphan.push(current);
            current = self.store.get_block_by_hash(&parent_hash)?;
        }

        // Fork prefix strictly between the new tip and the ancestor, tip
        // side first.
        let mut to_canonicalize = Vec::new();
        if new_tip.parent_hash != ancestor {
            let mut orphan = self.store.get_orphaned_block_by_hash(&new_tip.parent_hash)?;
            loop {
                let parent_hash = orphan.parent_hash.clone();
                to_canonicalize.push(orphan);
                if parent_hash == ancestor {
                    break;
                }
                orphan = self.store.get_orphaned_block_by_hash(&parent_hash)?;
            }
        }

        // Balance lookups complete before the store transaction opens; an
        // archival-state failure leaves the store untouched.
        let tip_record = to_block_record(new_tip);
        let tip_balances = self.fetch_balances(&tip_record.number, &tip_record.hash).await?;
        let mut fork_balances = Vec::with_capacity(to_canonicalize.len());
        for block in &to_canonicalize {
            fork_balances.push(self.fetch_balances(&block.number, &block.hash).await?);
        }

        self.store.in_transaction(|tx| {
            for block in &to_orphan {
                orphan_block(tx, block)?;
            }

            tx.create_block(&tip_record)?;
            for transaction in &new_tip.transactions {
                tx.create_transaction(&to_transaction_record(transaction, &tip_record.hash))?;
            }
            for balance in &tip_balances {
                tx.create_balance(balance)?;
            }

            for (block, balances) in to_canonicalize.iter().zip(&fork_balances) {
                canonicalize_block(tx, block, balances)?;
            }
            Ok(())
        })?;

        metrics::REORGS.inc();
        metrics::BLOCKS_INDEXED.inc();
        metrics::set_head_number(&tip_record.number);
        info!(
            old_head = %truncate_hex(&old_head.hash, 16),
            new_head = %truncate_hex(&tip_record.hash, 16),
            ancestor = %truncate_hex(ancestor, 16),
            orphaned = to_orphan.len(),
            canonicalized = to_canonicalize.len() + 1,
            "reorged chain"
        );
        Ok(())
    }

    /// Balance of every tracked address at `number`, bound to `block_hash`.
    async fn fetch_balances(&self, number: &BigUint, block_hash: &str) -> Result<Vec<BalanceRecord>> {
        let mut balances = Vec::with_capacity(self.tracked_addresses.len());
        for address in &self.tracked_addresses {
            let amount = self.chain.fetch_balance_at(address, number).await?;
            balances.push(to_balance_record(amount, address, block_hash));
        }
        Ok(balances)
    }
}

/// Move a canonical block to the orphaned side: its transactions migrate
/// with it and its balances are discarded.
pub fn orphan_block(tx: &StoreTx<'_>, block: &BlockRecord) -> Result<()> {
    let transactions = tx.get_transactions_for_block(&block.hash)?;

    tx.delete_transactions_for_block(&block.hash)?;
    tx.delete_balances_for_block(&block.hash)?;
    tx.delete_block(&block.hash)?;

    tx.create_orphaned_block(block)?;
    for transaction in &transactions {
        tx.create_orphaned_transaction(transaction)?;
    }
    Ok(())
}

/// Move an orphaned block to the canonical side, restoring its
/// transactions and materializing the supplied balances.
pub fn canonicalize_block(tx: &StoreTx<'_>, block: &BlockRecord, balances: &[BalanceRecord]) -> Result<()> {
    let transactions = tx.get_orphaned_transactions_for_block(&block.hash)?;

    tx.delete_orphaned_transactions_for_block(&block.hash)?;
    tx.delete_orphaned_block(&block.hash)?;

    tx.create_block(block)?;
    for transaction in &transactions {
        tx.create_transaction(transaction)?;
    }
    for balance in balances {
        tx.create_balance(balance)?;
    }
    Ok(())
}
