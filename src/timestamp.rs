//! Hybrid logical timestamps.
//!
//! A timestamp packs wall-clock milliseconds into the high bits and a
//! logical counter into the low [`LOGICAL_BITS`] bits. Collection TTLs are
//! expressed as deltas in the same space.

use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;

/// Hybrid timestamp type used for row versions and tombstones.
pub type Timestamp = u64;

/// Compose a hybrid timestamp from physical milliseconds and a logical counter.
pub fn compose_ts(physical_ms: u64, logical: u64) -> Timestamp {
    (physical_ms << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1))
}

/// Physical milliseconds carried by a hybrid timestamp.
pub fn physical_ms(ts: Timestamp) -> u64 {
    ts >> LOGICAL_BITS
}

/// Hybrid timestamp for the current wall clock, logical part zero.
pub fn current_timestamp() -> Timestamp {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    compose_ts(ms, 0)
}

/// Whether a row written at `ts` has outlived `ttl` relative to `current_ts`.
///
/// A `ttl` of zero disables expiration entirely.
pub fn is_expired(ttl: u64, current_ts: Timestamp, ts: Timestamp) -> bool {
    ttl > 0 && ts.saturating_add(ttl) < current_ts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_and_extract_round_trip() {
        let ts = compose_ts(1_700_000_000_000, 7);
        assert_eq!(physical_ms(ts), 1_700_000_000_000);
        assert_eq!(ts & ((1 << LOGICAL_BITS) - 1), 7);
    }

    #[test]
    fn zero_ttl_never_expires() {
        assert!(!is_expired(0, u64::MAX, 0));
    }

    #[test]
    fn expiration_boundary_is_strict() {
        let current = compose_ts(1_000, 0);
        let ttl = compose_ts(100, 0);
        // ts + ttl == current survives, one unit older expires
        let ts = current - ttl;
        assert!(!is_expired(ttl, current, ts));
        assert!(is_expired(ttl, current, ts - 1));
    }
}
