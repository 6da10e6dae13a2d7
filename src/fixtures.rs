// Scenario fixtures and the in-memory chain adapter.
//
// Reorg scenarios need exact control over parentage and difficulty, and
// hermetic runs need a node that serves saved blocks. `MockChain` plays
// the upstream node from memory; `save_blocks`/`blocks_from_dir` move
// fixture blocks between a live node and JSON files on disk.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use num_bigint::BigUint;
use tokio::sync::{mpsc, oneshot};

use crate::chain::{ChainAdapter, ChainBlock, ChainHeader, ChainTransaction, HeadSubscription};
use crate::error::{Error, Result};
use crate::indexer::Indexer;

/// Builder for a deterministic fixture block.
pub struct BlockFixture {
    block: ChainBlock,
}

impl BlockFixture {
    pub fn new(number: u64, hash: &str, parent_hash: &str) -> Self {
        BlockFixture {
            block: ChainBlock {
                hash: hash.to_string(),
                size: 1_000 + number,
                parent_hash: parent_hash.to_string(),
                uncle_hash: "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
                    .to_string(),
                coinbase: "0x2222222222222222222222222222222222222222".to_string(),
                state_root: format!("0x{:064x}", number * 3 + 1),
                tx_root: format!("0x{:064x}", number * 3 + 2),
                receipt_root: format!("0x{:064x}", number * 3 + 3),
                bloom: vec![0u8; 16],
                difficulty: BigUint::from(1u8),
                number: BigUint::from(number),
                gas_limit: 30_000_000,
                gas_used: 0,
                time: 1_600_000_000 + number * 13,
                extra: Vec::new(),
                mix_digest: format!("0x{:064x}", number),
                nonce: BigUint::from(number * 7 + 1),
                base_fee: BigUint::from(7u8),
                transactions: Vec::new(),
            },
        }
    }

    pub fn difficulty(mut self, difficulty: u64) -> Self {
        self.block.difficulty = BigUint::from(difficulty);
        self
    }

    pub fn difficulty_big(mut self, difficulty: BigUint) -> Self {
        self.block.difficulty = difficulty;
        self
    }

    pub fn with_transaction(self, hash: &str, from: &str, to: Option<&str>) -> Self {
        self.with_priced_transaction_to(hash, from, to, 21_000, 10)
    }

    pub fn with_priced_transaction(self, hash: &str, from: &str, gas: u64, gas_price: u64) -> Self {
        self.with_priced_transaction_to(hash, from, Some("0x3333333333333333333333333333333333333333"), gas, gas_price)
    }

    fn with_priced_transaction_to(
        mut self,
        hash: &str,
        from: &str,
        to: Option<&str>,
        gas: u64,
        gas_price: u64,
    ) -> Self {
        let nonce = self.block.transactions.len() as u64;
        self.block.transactions.push(ChainTransaction {
            hash: hash.to_string(),
            size: 110,
            from: from.to_string(),
            to: to.map(str::to_string),
            tx_type: 0,
            chain_id: BigUint::from(1u8),
            data: Vec::new(),
            gas,
            gas_price: BigUint::from(gas_price),
            gas_tip_cap: BigUint::from(1u8),
            gas_fee_cap: BigUint::from(gas_price),
            value: BigUint::from(1_000u16),
            nonce: BigUint::from(nonce),
        });
        self.block.gas_used += gas;
        self
    }

    pub fn build(self) -> ChainBlock {
        self.block
    }
}

#[derive(Default)]
struct MockState {
    blocks: HashMap<String, ChainBlock>,
    // (address, block number as decimal) -> balance
    balances: HashMap<(String, String), BigUint>,
    scripted_headers: Vec<ChainHeader>,
}

/// An upstream node played from memory. Blocks are served by hash,
/// balances by (address, number); a balance that was never set behaves
/// like missing archival state. Headers queued with `script_headers` are
/// emitted by the subscription in order, followed by a subscription error
/// so a driven event loop terminates.
#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<MockState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(blocks: impl IntoIterator<Item = ChainBlock>) -> Self {
        let chain = Self::new();
        for block in blocks {
            chain.add_block(block);
        }
        chain
    }

    pub fn add_block(&self, block: ChainBlock) {
        self.state.lock().unwrap().blocks.insert(block.hash.clone(), block);
    }

    pub fn set_balance(&self, address: &str, number: &BigUint, balance: BigUint) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert((address.to_string(), number.to_str_radix(10)), balance);
    }

    pub fn script_headers(&self, headers: impl IntoIterator<Item = ChainHeader>) {
        self.state.lock().unwrap().scripted_headers.extend(headers);
    }
}

impl ChainAdapter for MockChain {
    async fn subscribe_new_heads(&self) -> Result<HeadSubscription> {
        let queued: Vec<ChainHeader> = self.state.lock().unwrap().scripted_headers.drain(..).collect();
        let (header_tx, headers) = mpsc::channel(16);
        let (error_tx, errors) = oneshot::channel();

        tokio::spawn(async move {
            for header in queued {
                if header_tx.send(header).await.is_err() {
                    return;
                }
            }
            let _ = error_tx.send(Error::adapter("mock subscription drained"));
        });

        Ok(HeadSubscription { headers, errors })
    }

    async fn fetch_block(&self, hash: &str) -> Result<ChainBlock> {
        self.state
            .lock()
            .unwrap()
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::adapter(format!("mock node has no block {}", hash)))
    }

    async fn fetch_balance_at(&self, address: &str, number: &BigUint) -> Result<BigUint> {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(&(address.to_string(), number.to_str_radix(10)))
            .cloned()
            .ok_or_else(|| {
                Error::adapter(format!("no archival state for {} at block {}", address, number))
            })
    }
}

/// Feed saved blocks through the indexer in order, as if each had just
/// been announced.
pub async fn index_blocks<C: ChainAdapter>(indexer: &mut Indexer<C>, blocks: &[ChainBlock]) -> Result<()> {
    for block in blocks {
        indexer.index(&block.hash).await?;
    }
    Ok(())
}

/// Fetch each hash from the node and write it as a JSON fixture file.
/// Files are numbered so a later load replays in this order.
pub async fn save_blocks<C: ChainAdapter>(
    chain: &C,
    hashes: &[String],
    dir: impl AsRef<Path>,
) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .map_err(|err| Error::invalid_input(format!("creating {}: {}", dir.display(), err)))?;

    let mut written = Vec::with_capacity(hashes.len());
    for (index, hash) in hashes.iter().enumerate() {
        let block = chain.fetch_block(hash).await?;
        let name = format!("{:03}_{}.json", index, crate::telemetry::truncate_hex(hash, 18).trim_end_matches("..."));
        let path = dir.join(&name);
        let body = serde_json::to_string_pretty(&block)
            .map_err(|err| Error::invalid_input(format!("encoding {}: {}", hash, err)))?;
        fs::write(&path, body)
            .map_err(|err| Error::invalid_input(format!("writing {}: {}", path.display(), err)))?;
        written.push(name);
    }
    Ok(written)
}

/// Read every JSON fixture block in a directory, sorted by file name.
pub fn blocks_from_dir(dir: impl AsRef<Path>) -> Result<Vec<ChainBlock>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir)
        .map_err(|err| Error::invalid_input(format!("reading {}: {}", dir.display(), err)))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::invalid_input(format!("reading {}: {}", dir.display(), err)))?;
        paths.push(entry.path());
    }
    paths.sort();

    let mut blocks = Vec::with_capacity(paths.len());
    for path in paths {
        let body = fs::read_to_string(&path)
            .map_err(|err| Error::invalid_input(format!("reading {}: {}", path.display(), err)))?;
        let block = serde_json::from_str(&body)
            .map_err(|err| Error::invalid_input(format!("parsing {}: {}", path.display(), err)))?;
        blocks.push(block);
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_chain_serves_blocks_and_balances() {
        let chain = MockChain::with_blocks([BlockFixture::new(1, "0xa", "0x0").build()]);
        chain.set_balance("0xaddr", &BigUint::from(1u8), BigUint::from(99u8));

        assert_eq!(chain.fetch_block("0xa").await.unwrap().hash, "0xa");
        assert!(chain.fetch_block("0xmissing").await.is_err());
        assert_eq!(
            chain.fetch_balance_at("0xaddr", &BigUint::from(1u8)).await.unwrap(),
            BigUint::from(99u8)
        );
        assert!(chain.fetch_balance_at("0xaddr", &BigUint::from(2u8)).await.is_err());
    }

    #[tokio::test]
    async fn fixture_files_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = vec![
            BlockFixture::new(1, "0xaaa1", "0x0").build(),
            BlockFixture::new(2, "0xaaa2", "0xaaa1")
                .with_transaction("0xt1", "0xfrom", None)
                .build(),
        ];
        let chain = MockChain::with_blocks(blocks.clone());

        let hashes: Vec<String> = blocks.iter().map(|block| block.hash.clone()).collect();
        save_blocks(&chain, &hashes, dir.path()).await.unwrap();

        let loaded = blocks_from_dir(dir.path()).unwrap();
        assert_eq!(loaded, blocks);
    }
}
