// Prometheus instrumentation for the indexing pipeline.
//
// Counters cover the three ways a block can enter the store plus reorgs;
// the head gauge tracks the canonical tip. Exposed by the query surface at
// GET /metrics.

use lazy_static::lazy_static;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Blocks indexed canonically (cold start, linear extension, reorg tip).
    pub static ref BLOCKS_INDEXED: IntCounter = IntCounter::new(
        "etherblox_blocks_indexed_total",
        "Blocks indexed canonically"
    ).unwrap();

    /// Blocks indexed as orphans (fork branches, losing forks, gap fill).
    pub static ref ORPHANED_BLOCKS_INDEXED: IntCounter = IntCounter::new(
        "etherblox_orphaned_blocks_indexed_total",
        "Blocks indexed as orphans"
    ).unwrap();

    /// Blocks back-filled as orphans because a fork parent was missing.
    pub static ref GAP_FILLED_BLOCKS: IntCounter = IntCounter::new(
        "etherblox_gap_filled_blocks_total",
        "Missed ancestor blocks back-filled as orphans"
    ).unwrap();

    /// Completed chain reorganizations.
    pub static ref REORGS: IntCounter = IntCounter::new(
        "etherblox_reorgs_total",
        "Completed chain reorganizations"
    ).unwrap();

    /// Number of the canonical head block (saturated at i64::MAX).
    pub static ref HEAD_NUMBER: IntGauge = IntGauge::new(
        "etherblox_head_number",
        "Number of the canonical head block"
    ).unwrap();
}

static REGISTER: Once = Once::new();

fn register_all() {
    REGISTER.call_once(|| {
        let _ = REGISTRY.register(Box::new(BLOCKS_INDEXED.clone()));
        let _ = REGISTRY.register(Box::new(ORPHANED_BLOCKS_INDEXED.clone()));
        let _ = REGISTRY.register(Box::new(GAP_FILLED_BLOCKS.clone()));
        let _ = REGISTRY.register(Box::new(REORGS.clone()));
        let _ = REGISTRY.register(Box::new(HEAD_NUMBER.clone()));
        #[cfg(target_os = "linux")]
        let _ = REGISTRY.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ));
    });
}

/// Record the canonical head number. Gauges are i64; numbers beyond that
/// saturate rather than wrap.
pub fn set_head_number(number: &BigUint) {
    HEAD_NUMBER.set(number.to_i64().unwrap_or(i64::MAX));
}

/// Encode the registry in the Prometheus text format.
pub fn encode() -> String {
    register_all();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        BLOCKS_INDEXED.inc();
        set_head_number(&BigUint::from(12u8));
        let text = encode();
        assert!(text.contains("etherblox_blocks_indexed_total"));
        assert!(text.contains("etherblox_head_number"));
    }

    #[test]
    fn head_gauge_saturates_beyond_i64() {
        let wide = BigUint::parse_bytes(b"99999999999999999999999999999", 10).unwrap();
        set_head_number(&wide);
        assert_eq!(HEAD_NUMBER.get(), i64::MAX);
    }
}
