// Adapter-value to record mapping.
//
// Total, pure functions. A block maps to the same `BlockRecord` whether it
// is about to be written canonically or as an orphan; the caller picks the
// table. Decimal values pass through `BigUint` untouched.

use num_bigint::BigUint;

use crate::chain::{ChainBlock, ChainTransaction};
use crate::models::{BalanceRecord, BlockRecord, TransactionRecord};

pub fn to_block_record(block: &ChainBlock) -> BlockRecord {
    BlockRecord {
        hash: block.hash.clone(),
        size: block.size,
        parent_hash: block.parent_hash.clone(),
        uncle_hash: block.uncle_hash.clone(),
        coinbase: block.coinbase.clone(),
        state_root: block.state_root.clone(),
        tx_root: block.tx_root.clone(),
        receipt_root: block.receipt_root.clone(),
        bloom: block.bloom.clone(),
        difficulty: block.difficulty.clone(),
        number: block.number.clone(),
        gas_limit: block.gas_limit,
        gas_used: block.gas_used,
        time: block.time,
        extra: block.extra.clone(),
        mix_digest: block.mix_digest.clone(),
        nonce: block.nonce.clone(),
        base_fee: block.base_fee.clone(),
    }
}

pub fn to_transaction_record(tx: &ChainTransaction, block_hash: &str) -> TransactionRecord {
    TransactionRecord {
        hash: tx.hash.clone(),
        size: tx.size,
        from: tx.from.clone(),
        tx_type: tx.tx_type,
        chain_id: tx.chain_id.clone(),
        data: tx.data.clone(),
        gas: tx.gas,
        gas_price: tx.gas_price.clone(),
        gas_tip_cap: tx.gas_tip_cap.clone(),
        gas_fee_cap: tx.gas_fee_cap.clone(),
        value: tx.value.clone(),
        nonce: tx.nonce.clone(),
        // Contract creation has no recipient.
        to: tx.to.clone().unwrap_or_default(),
        block_hash: block_hash.to_string(),
    }
}

pub fn to_balance_record(balance: BigUint, address: &str, block_hash: &str) -> BalanceRecord {
    BalanceRecord {
        address: address.to_string(),
        block_hash: block_hash.to_string(),
        balance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::BlockFixture;

    #[test]
    fn block_fields_carry_over_exactly() {
        let difficulty = BigUint::parse_bytes(b"123456789012345678901234567890", 10).unwrap();
        let block = BlockFixture::new(7, "0xb1", "0xb0")
            .difficulty_big(difficulty.clone())
            .build();

        let record = to_block_record(&block);
        assert_eq!(record.hash, "0xb1");
        assert_eq!(record.parent_hash, "0xb0");
        assert_eq!(record.number, BigUint::from(7u8));
        assert_eq!(record.difficulty, difficulty);
    }

    #[test]
    fn contract_creation_maps_to_empty_recipient() {
        let block = BlockFixture::new(1, "0xb1", "0xb0")
            .with_transaction("0xt1", "0xsender", None)
            .build();

        let record = to_transaction_record(&block.transactions[0], &block.hash);
        assert_eq!(record.to, "");
        assert_eq!(record.block_hash, "0xb1");
    }

    #[test]
    fn recipient_passes_through() {
        let block = BlockFixture::new(1, "0xb1", "0xb0")
            .with_transaction("0xt1", "0xsender", Some("0xrecipient"))
            .build();

        let record = to_transaction_record(&block.transactions[0], &block.hash);
        assert_eq!(record.to, "0xrecipient");
    }
}
