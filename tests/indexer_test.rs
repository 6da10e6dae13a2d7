// End-to-end protocol scenarios: linear indexing, fork decisions, reorgs,
// gap fill, idempotent replay, and the query payloads built on top.
//
// Every test drives a real store (in-memory SQLite) through the indexer
// with blocks served by the in-memory chain adapter, exactly as the event
// loop would.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use num_bigint::BigUint;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceExt;

use etherblox::api;
use etherblox::chain::{ChainAdapter, ChainBlock};
use etherblox::error::Error;
use etherblox::fixtures::{index_blocks, BlockFixture, MockChain};
use etherblox::indexer::{canonicalize_block, orphan_block, Indexer};
use etherblox::mapper::{to_block_record, to_transaction_record};
use etherblox::store::Store;

const TRACKED: &str = "0x00112233445566778899aabbccddeeff00112233";

fn new_indexer(chain: &MockChain) -> Indexer<MockChain> {
    Indexer::new(Store::open_in_memory().unwrap(), chain.clone(), Vec::new(), 512).unwrap()
}

fn tracking_indexer(chain: &MockChain) -> Indexer<MockChain> {
    Indexer::new(
        Store::open_in_memory().unwrap(),
        chain.clone(),
        vec![TRACKED.to_string()],
        512,
    )
    .unwrap()
}

/// Every hash must be canonical or orphaned, never both, never gone.
fn assert_partition(store: &Store, canonical: &[&str], orphaned: &[&str]) {
    for hash in canonical {
        assert!(store.get_block_by_hash(hash).is_ok(), "{} should be canonical", hash);
        assert!(
            store.get_orphaned_block_by_hash(hash).unwrap_err().is_not_found(),
            "{} must not also be orphaned",
            hash
        );
    }
    for hash in orphaned {
        assert!(store.get_orphaned_block_by_hash(hash).is_ok(), "{} should be orphaned", hash);
        assert!(
            store.get_block_by_hash(hash).unwrap_err().is_not_found(),
            "{} must not also be canonical",
            hash
        );
    }
}

fn linear_chain() -> Vec<ChainBlock> {
    vec![
        BlockFixture::new(10, "0xg0", "0x00").difficulty(10).build(),
        BlockFixture::new(11, "0xg1", "0xg0").difficulty(10).build(),
        BlockFixture::new(12, "0xg2", "0xg1").difficulty(10).build(),
        BlockFixture::new(13, "0xg3", "0xg2").difficulty(10).build(),
    ]
}

// Blocks for the single-depth reorg scenario:
//
//  ----      ----      ----
// | b0 |----| b2 |----| b3 |
//  ---- \    ----      ----
//        \   ----
//         --| b1 |
//            ----
//
// b1 and b2 both carry the shared transaction hash.
fn reorg_chain() -> Vec<ChainBlock> {
    vec![
        BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build(),
        BlockFixture::new(11, "0xb1", "0xb0")
            .difficulty(10)
            .with_transaction("0xshared", "0xfrom1", Some("0xto1"))
            .build(),
        BlockFixture::new(11, "0xb2", "0xb0")
            .difficulty(12)
            .with_transaction("0xshared", "0xfrom1", Some("0xto1"))
            .build(),
        BlockFixture::new(12, "0xb3", "0xb2").difficulty(5).build(),
    ]
}

#[tokio::test]
async fn s1_linear_indexing() {
    let blocks = linear_chain();
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);

    index_blocks(&mut indexer, &blocks).await.unwrap();
    let store = indexer.store();

    let head = store.get_head().unwrap();
    assert_eq!(head.hash, "0xg3");

    // Walking parent pointers reaches the genesis fixture.
    let mut current = head;
    for expected in ["0xg2", "0xg1", "0xg0"] {
        current = store.get_block_by_hash(&current.parent_hash).unwrap();
        assert_eq!(current.hash, expected);
    }

    let [blocks_count, orphans, _, _, _] = store.table_counts().unwrap();
    assert_eq!(blocks_count, 4);
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn s2_single_depth_reorg() {
    let blocks = reorg_chain();
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);

    index_blocks(&mut indexer, &blocks).await.unwrap();
    let store = indexer.store();

    assert_eq!(store.get_head().unwrap().hash, "0xb3");
    assert_partition(store, &["0xb0", "0xb2", "0xb3"], &["0xb1"]);

    // The reorged-out transaction moved with its block.
    assert_eq!(store.get_transactions_for_block("0xb1").unwrap().len(), 0);
    assert_eq!(store.get_orphaned_transactions_for_block("0xb1").unwrap().len(), 1);
    assert_eq!(store.get_transactions_for_block("0xb2").unwrap().len(), 1);
}

// The fork stays orphaned until its child outweighs the canonical chain;
// the reorg then canonicalizes the whole fork prefix.
#[tokio::test]
async fn reorg_canonicalizes_fork_prefix() {
    let blocks = vec![
        BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build(),
        BlockFixture::new(11, "0xb1", "0xb0").difficulty(10).build(),
        BlockFixture::new(11, "0xb2", "0xb0").difficulty(5).build(),
        BlockFixture::new(12, "0xb3", "0xb2").difficulty(6).build(),
    ];
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);

    // b2 arrives weaker than b1 and is shelved as an orphan.
    index_blocks(&mut indexer, &blocks[..3]).await.unwrap();
    assert_partition(indexer.store(), &["0xb0", "0xb1"], &["0xb2"]);

    // b3 lifts the fork total to 11 > 10: b2 must flip canonical with it.
    index_blocks(&mut indexer, &blocks[3..]).await.unwrap();
    let store = indexer.store();
    assert_eq!(store.get_head().unwrap().hash, "0xb3");
    assert_partition(store, &["0xb0", "0xb2", "0xb3"], &["0xb1"]);
}

#[tokio::test]
async fn s3_equal_difficulty_lower_number_wins() {
    let blocks = vec![
        BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build(),
        BlockFixture::new(12, "0xb1", "0xb0").difficulty(20).build(),
        BlockFixture::new(11, "0xb2", "0xb0").difficulty(20).build(),
    ];
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);

    index_blocks(&mut indexer, &blocks).await.unwrap();
    let store = indexer.store();

    assert_eq!(store.get_head().unwrap().hash, "0xb2");
    assert_partition(store, &["0xb0", "0xb2"], &["0xb1"]);
}

#[tokio::test]
async fn equal_difficulty_higher_number_stays_orphaned() {
    let blocks = vec![
        BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build(),
        BlockFixture::new(11, "0xb1", "0xb0").difficulty(20).build(),
        BlockFixture::new(12, "0xb2", "0xb0").difficulty(20).build(),
    ];
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);

    index_blocks(&mut indexer, &blocks).await.unwrap();
    let store = indexer.store();

    assert_eq!(store.get_head().unwrap().hash, "0xb1");
    assert_partition(store, &["0xb0", "0xb1"], &["0xb2"]);
}

#[tokio::test]
async fn s4_replay_is_idempotent() {
    let blocks = reorg_chain();
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);

    index_blocks(&mut indexer, &blocks).await.unwrap();
    let counts = indexer.store().table_counts().unwrap();

    // Feeding the same headers again must change nothing and error nowhere.
    index_blocks(&mut indexer, &blocks).await.unwrap();
    assert_eq!(indexer.store().table_counts().unwrap(), counts);
    assert_eq!(indexer.store().get_head().unwrap().hash, "0xb3");
}

#[tokio::test]
async fn s5_gap_fill_backfills_missed_ancestors() {
    let b0 = BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build();
    let b1 = BlockFixture::new(11, "0xb1", "0xb0").difficulty(10).build();
    // b2 is published upstream but its header is never delivered.
    let b2 = BlockFixture::new(11, "0xb2", "0xb0").difficulty(8).build();
    let b3 = BlockFixture::new(12, "0xb3", "0xb2").difficulty(5).build();

    let chain = MockChain::with_blocks([b0.clone(), b1.clone(), b2.clone(), b3.clone()]);
    let mut indexer = new_indexer(&chain);

    index_blocks(&mut indexer, &[b0, b1]).await.unwrap();
    index_blocks(&mut indexer, &[b3]).await.unwrap();

    // b2 was fetched and back-filled, then the difficulty compare
    // (8 + 5 > 10) flipped the fork canonical.
    let store = indexer.store();
    assert_eq!(store.get_head().unwrap().hash, "0xb3");
    assert_partition(store, &["0xb0", "0xb2", "0xb3"], &["0xb1"]);
}

#[tokio::test]
async fn s5_gap_fill_losing_fork_stays_orphaned() {
    let b0 = BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build();
    let b1 = BlockFixture::new(11, "0xb1", "0xb0").difficulty(10).build();
    let b2 = BlockFixture::new(11, "0xb2", "0xb0").difficulty(4).build();
    let b3 = BlockFixture::new(12, "0xb3", "0xb2").difficulty(5).build();

    let chain = MockChain::with_blocks([b0.clone(), b1.clone(), b2.clone(), b3.clone()]);
    let mut indexer = new_indexer(&chain);

    index_blocks(&mut indexer, &[b0, b1]).await.unwrap();
    index_blocks(&mut indexer, &[b3]).await.unwrap();

    // 4 + 5 < 10: both fork blocks remain orphaned.
    let store = indexer.store();
    assert_eq!(store.get_head().unwrap().hash, "0xb1");
    assert_partition(store, &["0xb0", "0xb1"], &["0xb2", "0xb3"]);
}

#[tokio::test]
async fn s6_transaction_survives_reorg() {
    let blocks = reorg_chain();
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);
    index_blocks(&mut indexer, &blocks).await.unwrap();

    let store = indexer.store();
    let (transaction, block) = store.get_transaction_by_hash("0xshared", true).unwrap();
    assert_eq!(transaction.block_hash, "0xb2");
    assert_eq!(block.unwrap().hash, "0xb2");

    let orphaned = store.get_orphaned_transactions_by_hash("0xshared").unwrap();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].1.hash, "0xb1");
}

#[tokio::test]
async fn s6_query_surface_payload() {
    let blocks = reorg_chain();
    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer = new_indexer(&chain);
    index_blocks(&mut indexer, &blocks).await.unwrap();

    let app = api::router(Arc::new(Mutex::new(indexer.into_store())));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/getBlocksByTransactionHash/0xshared")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["canonical_block"]["hash"], "0xb2");
    assert_eq!(payload["orphaned_blocks"][0]["hash"], "0xb1");
    assert_eq!(payload["orphaned_blocks"].as_array().unwrap().len(), 1);

    // Head and number lookups ride the same router.
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/getHead").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let head: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(head["hash"], "0xb3");
    assert_eq!(head["number"], "12");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/getBlockByNumber/not-a-number")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/getAddressBalanceByBlockHash/bogus/0xb2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_store_returns_404_for_head() {
    let app = api::router(Arc::new(Mutex::new(Store::open_in_memory().unwrap())));
    let response = app
        .oneshot(Request::builder().uri("/getHead").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn balances_follow_the_canonical_side() {
    let blocks = reorg_chain();
    let chain = MockChain::with_blocks(blocks.clone());
    for number in [10u8, 11, 12] {
        chain.set_balance(TRACKED, &BigUint::from(number), BigUint::from(number) * 1000u32);
    }

    let mut indexer = tracking_indexer(&chain);
    index_blocks(&mut indexer, &blocks).await.unwrap();
    let store = indexer.store();

    // Canonical blocks carry balances; the orphaned block's were discarded.
    for hash in ["0xb0", "0xb2", "0xb3"] {
        assert!(store.get_balance(TRACKED, hash).is_ok(), "balance missing for {}", hash);
    }
    assert!(store.get_balance(TRACKED, "0xb1").unwrap_err().is_not_found());

    assert_eq!(
        store.get_balance(TRACKED, "0xb2").unwrap().balance,
        BigUint::from(11u8) * 1000u32
    );
}

#[tokio::test]
async fn archival_gap_surfaces_and_leaves_store_untouched() {
    let block = BlockFixture::new(10, "0xb0", "0x00").build();
    let chain = MockChain::with_blocks([block.clone()]);
    // No balance configured: the mock behaves like a node without
    // archival state.
    let mut indexer = tracking_indexer(&chain);

    let err = indexer.index("0xb0").await.unwrap_err();
    assert!(matches!(err, Error::Adapter(_)));
    assert!(!indexer.store().contains_hash("0xb0").unwrap());
}

#[tokio::test]
async fn rejects_malformed_tracked_address() {
    let err = Indexer::new(
        Store::open_in_memory().unwrap(),
        MockChain::new(),
        vec!["0xnot-an-address".to_string()],
        512,
    )
    .map(|_| ())
    .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn deep_gap_exceeds_walk_bound() {
    let b0 = BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build();
    let mut blocks = vec![b0.clone()];
    for i in 1..=5u64 {
        let parent = if i == 1 { "0xb0".to_string() } else { format!("0xc{}", i - 1) };
        blocks.push(
            BlockFixture::new(10 + i, &format!("0xc{}", i), &parent)
                .difficulty(1)
                .build(),
        );
    }

    let chain = MockChain::with_blocks(blocks.clone());
    let mut indexer =
        Indexer::new(Store::open_in_memory().unwrap(), chain.clone(), Vec::new(), 2).unwrap();

    index_blocks(&mut indexer, &blocks[..1]).await.unwrap();

    let err = indexer.index("0xc5").await.unwrap_err();
    assert!(matches!(err, Error::ReorgTooDeep { .. }));
}

// Orphaning and canonicalizing a block must restore every field of the
// block and its transactions exactly.
#[tokio::test]
async fn orphan_canonicalize_round_trip_preserves_fields() {
    let wide = BigUint::parse_bytes(b"123456789012345678901234567890123456789", 10).unwrap();
    let block = BlockFixture::new(11, "0xb1", "0xb0")
        .difficulty_big(wide)
        .with_transaction("0xt1", "0xfrom1", Some("0xto1"))
        .with_transaction("0xt2", "0xfrom2", None)
        .build();

    let mut store = Store::open_in_memory().unwrap();
    let record = to_block_record(&block);
    store.create_block(&record).unwrap();
    let original_txs: Vec<_> = block
        .transactions
        .iter()
        .map(|tx| to_transaction_record(tx, &block.hash))
        .collect();
    for tx in &original_txs {
        store.create_transaction(tx).unwrap();
    }

    store.in_transaction(|tx| orphan_block(tx, &record)).unwrap();
    assert_eq!(store.get_orphaned_block_by_hash("0xb1").unwrap(), record);
    assert_eq!(store.get_orphaned_transactions_for_block("0xb1").unwrap(), original_txs);
    assert!(store.get_block_by_hash("0xb1").unwrap_err().is_not_found());

    store
        .in_transaction(|tx| canonicalize_block(tx, &record, &[]))
        .unwrap();
    assert_eq!(store.get_block_by_hash("0xb1").unwrap(), record);
    assert_eq!(store.get_transactions_for_block("0xb1").unwrap(), original_txs);
    assert!(store.get_orphaned_block_by_hash("0xb1").unwrap_err().is_not_found());
}

// The event loop indexes scripted headers in order, then surfaces the
// subscription error and terminates.
#[tokio::test]
async fn run_loop_drains_subscription_then_fails() {
    let blocks = linear_chain();
    let chain = MockChain::with_blocks(blocks.clone());
    chain.script_headers(blocks.iter().map(|block| block.header()));

    let mut indexer = new_indexer(&chain);
    let err = indexer.run().await.unwrap_err();
    assert!(matches!(err, Error::Adapter(_)));

    assert_eq!(indexer.store().get_head().unwrap().hash, "0xg3");
}

#[tokio::test]
async fn fixture_replay_from_disk_matches_direct_feed() {
    let dir = tempfile::tempdir().unwrap();
    let blocks = reorg_chain();
    let chain = MockChain::with_blocks(blocks.clone());

    let hashes: Vec<String> = blocks.iter().map(|block| block.hash.clone()).collect();
    etherblox::fixtures::save_blocks(&chain, &hashes, dir.path()).await.unwrap();
    let replayed = etherblox::fixtures::blocks_from_dir(dir.path()).unwrap();

    let mut indexer = new_indexer(&MockChain::with_blocks(replayed.clone()));
    index_blocks(&mut indexer, &replayed).await.unwrap();
    assert_eq!(indexer.store().get_head().unwrap().hash, "0xb3");
}

// Deeper future reorg: a hash that already flipped orphaned can flip back.
#[tokio::test]
async fn no_terminal_states_under_deeper_reorg() {
    let b0 = BlockFixture::new(10, "0xb0", "0x00").difficulty(10).build();
    let b1 = BlockFixture::new(11, "0xb1", "0xb0").difficulty(10).build();
    let b2 = BlockFixture::new(11, "0xb2", "0xb0").difficulty(12).build();
    let b1c = BlockFixture::new(12, "0xb1c", "0xb1").difficulty(20).build();

    let chain = MockChain::with_blocks([b0.clone(), b1.clone(), b2.clone(), b1c.clone()]);
    let mut indexer = new_indexer(&chain);

    // b2 reorgs b1 out...
    index_blocks(&mut indexer, &[b0, b1, b2]).await.unwrap();
    assert_partition(indexer.store(), &["0xb0", "0xb2"], &["0xb1"]);

    // ...and b1's child pulls b1 straight back (10 + 20 > 12).
    index_blocks(&mut indexer, &[b1c]).await.unwrap();
    let store = indexer.store();
    assert_eq!(store.get_head().unwrap().hash, "0xb1c");
    assert_partition(store, &["0xb0", "0xb1", "0xb1c"], &["0xb2"]);
}

#[tokio::test]
async fn fetching_unknown_block_is_an_adapter_error() {
    let chain = MockChain::new();
    assert!(matches!(
        chain.fetch_block("0xmissing").await.unwrap_err(),
        Error::Adapter(_)
    ));
}
