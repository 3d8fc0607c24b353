//! Passive-liquidity order book for a single symbol.
//!
//! Maintains per-price levels in a sorted map, applies sequence-validated
//! depth diffs, and answers best-quote, band-sum, and level queries for the
//! preprocessor. Malformed or out-of-order input is counted and dropped;
//! it never propagates to consumers.

use crate::config::BookConfig;
use crate::error::EngineError;
use crate::fixed::{Qty, Ticks};
use crate::wire::DepthDiff;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// Rolling window for the apply-error circuit breaker.
const ERROR_WINDOW_MS: i64 = 60_000;

/// One price level of resting liquidity.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassiveLevel {
    pub price_ticks: Ticks,
    pub bid_qty: Qty,
    pub ask_qty: Qty,
    pub last_update_ms: i64,
    /// Same-millisecond delta accounting: how much each side shrank or
    /// grew within the current millisecond. Reset when the level's
    /// timestamp advances.
    pub consumed_bid: Qty,
    pub consumed_ask: Qty,
    pub added_bid: Qty,
    pub added_ask: Qty,
}

impl PassiveLevel {
    fn new(price_ticks: Ticks) -> Self {
        Self {
            price_ticks,
            bid_qty: 0,
            ask_qty: 0,
            last_update_ms: 0,
            consumed_bid: 0,
            consumed_ask: 0,
            added_bid: 0,
            added_ask: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.bid_qty == 0 && self.ask_qty == 0
    }
}

/// Aggregate passive liquidity over a symmetric price band.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandSum {
    pub bid_qty: Qty,
    pub ask_qty: Qty,
    pub level_count: usize,
}

/// Book health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookHealth {
    pub status: HealthStatus,
    pub last_update_ms: i64,
    pub book_size: usize,
    /// Apply errors in the rolling 60-second window.
    pub error_rate: usize,
    pub circuit_open: bool,
}

/// Outcome of a depth-diff application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    Applied,
    /// Sequence number at or below the last applied id.
    DiscardedStale,
    /// Book not recovered yet; diff buffered for replay.
    Buffered,
    /// Circuit breaker open; diff dropped.
    DroppedCircuitOpen,
}

/// Snapshot used to (re)initialise the book.
#[derive(Debug, Clone)]
pub struct BookSnapshot {
    pub last_update_id: i64,
    pub bids: Vec<(Ticks, Qty)>,
    pub asks: Vec<(Ticks, Qty)>,
}

/// Supplier of book snapshots. The exchange REST transport implements
/// this outside the engine; replay runs without one.
pub trait SnapshotSource: Send {
    fn fetch(&mut self) -> Result<BookSnapshot, EngineError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneStats {
    pub removed_stale: usize,
    pub removed_distant: usize,
    pub removed_excess: usize,
}

pub struct Book {
    cfg: BookConfig,
    levels: BTreeMap<Ticks, PassiveLevel>,
    bid_index: BTreeSet<Ticks>,
    ask_index: BTreeSet<Ticks>,
    last_applied_id: i64,
    last_update_ms: i64,
    error_times: VecDeque<i64>,
    circuit_open_until: i64,
    /// Diffs received before the initial snapshot, replayed by `recover`.
    buffered: Vec<DepthDiff>,
    ready: bool,
    stream_connected: bool,
    needs_recover: bool,
    dropped_while_open: u64,
}

impl Book {
    pub fn new(cfg: BookConfig) -> Self {
        Self {
            cfg,
            levels: BTreeMap::new(),
            bid_index: BTreeSet::new(),
            ask_index: BTreeSet::new(),
            last_applied_id: 0,
            last_update_ms: 0,
            error_times: VecDeque::new(),
            circuit_open_until: 0,
            buffered: Vec::new(),
            ready: false,
            stream_connected: true,
            needs_recover: false,
            dropped_while_open: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.cfg.symbol
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn needs_recover(&self) -> bool {
        self.needs_recover
    }

    pub fn last_applied_id(&self) -> i64 {
        self.last_applied_id
    }

    /// Load a snapshot (or initialise empty in replay mode) and replay any
    /// diffs buffered since the snapshot's update id. A snapshot fetch
    /// failure is a fatal initialisation error.
    pub fn recover(
        &mut self,
        source: Option<&mut dyn SnapshotSource>,
        now_ms: i64,
    ) -> Result<(), EngineError> {
        self.levels.clear();
        self.bid_index.clear();
        self.ask_index.clear();

        match source {
            Some(src) => {
                let snapshot = src
                    .fetch()
                    .map_err(|e| EngineError::Init(format!("book snapshot fetch failed: {e}")))?;
                self.last_applied_id = snapshot.last_update_id;
                for (price, qty) in snapshot.bids {
                    self.set_side(price, qty, true, now_ms);
                }
                for (price, qty) in snapshot.asks {
                    self.set_side(price, qty, false, now_ms);
                }
                info!(
                    symbol = %self.cfg.symbol,
                    last_update_id = snapshot.last_update_id,
                    levels = self.levels.len(),
                    "book recovered from snapshot"
                );
            }
            None => {
                self.last_applied_id = 0;
                info!(symbol = %self.cfg.symbol, "book initialised empty (replay mode)");
            }
        }

        self.ready = true;
        self.needs_recover = false;
        self.last_update_ms = now_ms;

        let buffered = std::mem::take(&mut self.buffered);
        let mut replayed = 0usize;
        for diff in buffered {
            if diff.final_update_id > self.last_applied_id {
                self.apply_levels(&diff, now_ms);
                replayed += 1;
            }
        }
        if replayed > 0 {
            debug!(symbol = %self.cfg.symbol, replayed, "replayed buffered depth diffs");
        }
        Ok(())
    }

    /// Apply one batch of level changes. Out-of-sequence and
    /// circuit-dropped diffs are reported through the outcome, not as
    /// errors; errors are reserved for malformed input, which the wire
    /// layer already rejected.
    pub fn apply_depth_diff(&mut self, diff: &DepthDiff, now_ms: i64) -> DiffOutcome {
        if self.circuit_open(now_ms) {
            self.dropped_while_open += 1;
            return DiffOutcome::DroppedCircuitOpen;
        }

        if !self.ready {
            self.buffered.push(diff.clone());
            return DiffOutcome::Buffered;
        }

        if !self.cfg.disable_sequence_validation {
            if diff.final_update_id <= self.last_applied_id {
                debug!(
                    symbol = %self.cfg.symbol,
                    final_update_id = diff.final_update_id,
                    last_applied = self.last_applied_id,
                    "discarding stale depth diff"
                );
                return DiffOutcome::DiscardedStale;
            }
            if diff.first_update_id > self.last_applied_id + 1 {
                warn!(
                    symbol = %self.cfg.symbol,
                    expected = self.last_applied_id + 1,
                    got = diff.first_update_id,
                    "gap in depth stream, scheduling recover"
                );
                self.needs_recover = true;
                self.record_error(now_ms);
                return DiffOutcome::DiscardedStale;
            }
        }

        self.apply_levels(diff, now_ms);

        // A crossed book after an apply means upstream state is corrupt.
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if ask <= bid {
                warn!(
                    symbol = %self.cfg.symbol,
                    best_bid = bid,
                    best_ask = ask,
                    "crossed book after depth diff, scheduling recover"
                );
                self.needs_recover = true;
                self.record_error(now_ms);
            }
        }

        DiffOutcome::Applied
    }

    fn apply_levels(&mut self, diff: &DepthDiff, now_ms: i64) {
        for &(price, qty) in &diff.bids {
            self.set_side(price, qty, true, now_ms);
        }
        for &(price, qty) in &diff.asks {
            self.set_side(price, qty, false, now_ms);
        }
        self.last_applied_id = diff.final_update_id.max(self.last_applied_id);
        self.last_update_ms = now_ms;
    }

    fn set_side(&mut self, price: Ticks, qty: Qty, is_bid: bool, now_ms: i64) {
        let level = self
            .levels
            .entry(price)
            .or_insert_with(|| PassiveLevel::new(price));

        if level.last_update_ms != now_ms {
            level.consumed_bid = 0;
            level.consumed_ask = 0;
            level.added_bid = 0;
            level.added_ask = 0;
        }
        level.last_update_ms = now_ms;

        let prev = if is_bid { level.bid_qty } else { level.ask_qty };
        if qty < prev {
            if is_bid {
                level.consumed_bid += prev - qty;
            } else {
                level.consumed_ask += prev - qty;
            }
        } else if is_bid {
            level.added_bid += qty - prev;
        } else {
            level.added_ask += qty - prev;
        }

        if is_bid {
            level.bid_qty = qty;
            if qty > 0 {
                self.bid_index.insert(price);
            } else {
                self.bid_index.remove(&price);
            }
        } else {
            level.ask_qty = qty;
            if qty > 0 {
                self.ask_index.insert(price);
            } else {
                self.ask_index.remove(&price);
            }
        }

        if level.is_empty() {
            self.levels.remove(&price);
        }
    }

    pub fn best_bid(&self) -> Option<Ticks> {
        self.bid_index.iter().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Ticks> {
        self.ask_index.iter().next().copied()
    }

    pub fn spread_ticks(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    pub fn mid_price_ticks(&self) -> Option<Ticks> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((a + b) / 2),
            _ => None,
        }
    }

    pub fn level_at(&self, price_ticks: Ticks) -> Option<&PassiveLevel> {
        self.levels.get(&price_ticks)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Sum passive quantities over `center ± band` ticks, inclusive.
    pub fn sum_band(&self, center_ticks: Ticks, band_ticks: i64) -> BandSum {
        self.sum_range(center_ticks - band_ticks, center_ticks + band_ticks)
    }

    /// Sum passive quantities over an inclusive tick range.
    pub fn sum_range(&self, lo_ticks: Ticks, hi_ticks: Ticks) -> BandSum {
        let mut out = BandSum::default();
        for (_, level) in self.levels.range(lo_ticks..=hi_ticks) {
            out.bid_qty += level.bid_qty;
            out.ask_qty += level.ask_qty;
            out.level_count += 1;
        }
        out
    }

    /// Count an apply error and open the circuit when the windowed rate is
    /// exceeded.
    pub fn record_error(&mut self, now_ms: i64) {
        self.error_times.push_back(now_ms);
        self.trim_errors(now_ms);
        if self.error_times.len() > self.cfg.max_error_rate_windowed
            && !self.circuit_open(now_ms)
        {
            self.circuit_open_until = now_ms + self.cfg.circuit_open_ms;
            warn!(
                symbol = %self.cfg.symbol,
                errors = self.error_times.len(),
                open_ms = self.cfg.circuit_open_ms,
                "book error circuit opened"
            );
        }
    }

    fn trim_errors(&mut self, now_ms: i64) {
        while let Some(&t) = self.error_times.front() {
            if now_ms - t > ERROR_WINDOW_MS {
                self.error_times.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn circuit_open(&self, now_ms: i64) -> bool {
        now_ms < self.circuit_open_until
    }

    /// Mark the upstream stream connected or not. While disconnected the
    /// staleness check is relaxed and a recover is scheduled for
    /// reconnect.
    pub fn set_stream_connected(&mut self, connected: bool) {
        if self.stream_connected && !connected {
            warn!(symbol = %self.cfg.symbol, "depth stream disconnected, relaxing staleness");
            self.needs_recover = true;
        }
        self.stream_connected = connected;
    }

    pub fn health(&mut self, now_ms: i64) -> BookHealth {
        self.trim_errors(now_ms);
        let circuit_open = self.circuit_open(now_ms);
        let error_rate = self.error_times.len();
        let stale = self.stream_connected
            && self.ready
            && now_ms - self.last_update_ms > self.cfg.stale_book_ms;

        let status = if circuit_open || error_rate > self.cfg.max_error_rate_windowed {
            HealthStatus::Unhealthy
        } else if !self.ready || stale || self.needs_recover {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        BookHealth {
            status,
            last_update_ms: self.last_update_ms,
            book_size: self.levels.len(),
            error_rate,
            circuit_open,
        }
    }

    /// Periodic pruning: stale levels, levels too far from mid, then the
    /// farthest levels down to the configured bound.
    pub fn prune(&mut self, now_ms: i64) -> PruneStats {
        let mut stats = PruneStats::default();

        let stale: Vec<Ticks> = self
            .levels
            .iter()
            .filter(|(_, l)| now_ms - l.last_update_ms > self.cfg.stale_level_ms)
            .map(|(&p, _)| p)
            .collect();
        for price in stale {
            self.remove_level(price);
            stats.removed_stale += 1;
        }

        if let Some(mid) = self.mid_price_ticks() {
            let distant: Vec<Ticks> = self
                .levels
                .keys()
                .filter(|&&p| (p - mid).abs() > self.cfg.max_distance_ticks)
                .copied()
                .collect();
            for price in distant {
                self.remove_level(price);
                stats.removed_distant += 1;
            }

            if self.levels.len() > self.cfg.max_levels {
                let mut by_distance: Vec<(i64, Ticks)> = self
                    .levels
                    .keys()
                    .map(|&p| ((p - mid).abs(), p))
                    .collect();
                by_distance.sort_unstable_by(|a, b| b.cmp(a));
                let excess = self.levels.len() - self.cfg.max_levels;
                for &(_, price) in by_distance.iter().take(excess) {
                    self.remove_level(price);
                    stats.removed_excess += 1;
                }
            }
        }

        if stats.removed_stale + stats.removed_distant + stats.removed_excess > 0 {
            debug!(
                symbol = %self.cfg.symbol,
                stale = stats.removed_stale,
                distant = stats.removed_distant,
                excess = stats.removed_excess,
                remaining = self.levels.len(),
                "pruned book levels"
            );
        }
        stats
    }

    fn remove_level(&mut self, price: Ticks) {
        self.levels.remove(&price);
        self.bid_index.remove(&price);
        self.ask_index.remove(&price);
    }

    pub fn dropped_while_open(&self) -> u64 {
        self.dropped_while_open
    }

    /// Idempotent teardown.
    pub fn cleanup(&mut self) {
        self.buffered.clear();
        self.error_times.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BookConfig {
        BookConfig {
            symbol: "BTCUSDT".into(),
            price_precision: 2,
            max_levels: 300,
            prune_interval_ms: 5_000,
            stale_level_ms: 300_000,
            max_distance_ticks: 200,
            max_error_rate_windowed: 5,
            circuit_open_ms: 10_000,
            stale_book_ms: 5_000,
            disable_sequence_validation: false,
        }
    }

    fn ready_book() -> Book {
        let mut book = Book::new(cfg());
        book.recover(None, 0).unwrap();
        book
    }

    fn diff(first: i64, last: i64, bids: &[(Ticks, Qty)], asks: &[(Ticks, Qty)]) -> DepthDiff {
        DepthDiff {
            first_update_id: first,
            final_update_id: last,
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        }
    }

    #[test]
    fn test_best_quotes_and_spread() {
        let mut book = ready_book();
        book.apply_depth_diff(
            &diff(1, 1, &[(9999, 100), (9998, 50)], &[(10001, 80), (10002, 70)]),
            0,
        );
        assert_eq!(book.best_bid(), Some(9999));
        assert_eq!(book.best_ask(), Some(10001));
        assert_eq!(book.spread_ticks(), Some(2));
        assert_eq!(book.mid_price_ticks(), Some(10000));
    }

    #[test]
    fn test_empty_book_returns_none() {
        let book = ready_book();
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), None);
        assert_eq!(book.spread_ticks(), None);
        assert_eq!(book.mid_price_ticks(), None);
    }

    #[test]
    fn test_zero_both_sides_removes_level() {
        let mut book = ready_book();
        book.apply_depth_diff(&diff(1, 1, &[(9999, 100)], &[]), 0);
        assert_eq!(book.level_count(), 1);
        book.apply_depth_diff(&diff(2, 2, &[(9999, 0)], &[]), 0);
        assert_eq!(book.level_count(), 0);
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn test_sequence_discard_is_idempotent() {
        let mut book = ready_book();
        let d = diff(1, 5, &[(9999, 100)], &[(10001, 80)]);
        assert_eq!(book.apply_depth_diff(&d, 0), DiffOutcome::Applied);
        let snapshot_before = (book.best_bid(), book.best_ask(), book.level_count());
        // Re-applying the same diff is a no-op thanks to the sequence check.
        assert_eq!(book.apply_depth_diff(&d, 1), DiffOutcome::DiscardedStale);
        assert_eq!(
            snapshot_before,
            (book.best_bid(), book.best_ask(), book.level_count())
        );
    }

    #[test]
    fn test_replay_mode_skips_sequence_validation() {
        let mut c = cfg();
        c.disable_sequence_validation = true;
        let mut book = Book::new(c);
        book.recover(None, 0).unwrap();
        let d = diff(1, 5, &[(9999, 100)], &[]);
        assert_eq!(book.apply_depth_diff(&d, 0), DiffOutcome::Applied);
        assert_eq!(book.apply_depth_diff(&d, 1), DiffOutcome::Applied);
    }

    #[test]
    fn test_gap_schedules_recover() {
        let mut book = ready_book();
        book.apply_depth_diff(&diff(1, 5, &[(9999, 100)], &[]), 0);
        let out = book.apply_depth_diff(&diff(10, 12, &[(9998, 100)], &[]), 1);
        assert_eq!(out, DiffOutcome::DiscardedStale);
        assert!(book.needs_recover());
    }

    #[test]
    fn test_buffered_diffs_replayed_on_recover() {
        let mut book = Book::new(cfg());
        assert_eq!(
            book.apply_depth_diff(&diff(90, 95, &[(9999, 100)], &[]), 0),
            DiffOutcome::Buffered
        );
        assert_eq!(
            book.apply_depth_diff(&diff(96, 101, &[(9998, 70)], &[]), 0),
            DiffOutcome::Buffered
        );

        struct Fixed;
        impl SnapshotSource for Fixed {
            fn fetch(&mut self) -> Result<BookSnapshot, EngineError> {
                Ok(BookSnapshot {
                    last_update_id: 95,
                    bids: vec![(9990, 10)],
                    asks: vec![(10010, 10)],
                })
            }
        }
        let mut src = Fixed;
        book.recover(Some(&mut src), 0).unwrap();
        // Diff ending at 95 is covered by the snapshot; the later one applies.
        assert!(book.level_at(9999).is_none());
        assert_eq!(book.level_at(9998).unwrap().bid_qty, 70);
    }

    #[test]
    fn test_snapshot_failure_is_init_error() {
        struct Failing;
        impl SnapshotSource for Failing {
            fn fetch(&mut self) -> Result<BookSnapshot, EngineError> {
                Err(EngineError::TransientStream("timeout".into()))
            }
        }
        let mut book = Book::new(cfg());
        let mut src = Failing;
        let err = book.recover(Some(&mut src), 0).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_band_sum() {
        let mut book = ready_book();
        book.apply_depth_diff(
            &diff(
                1,
                1,
                &[(9998, 100), (9999, 50)],
                &[(10001, 80), (10004, 999)],
            ),
            0,
        );
        let band = book.sum_band(10000, 2);
        assert_eq!(band.bid_qty, 150);
        assert_eq!(band.ask_qty, 80);
        assert_eq!(band.level_count, 3);
    }

    #[test]
    fn test_same_millisecond_delta_accounting() {
        let mut book = ready_book();
        book.apply_depth_diff(&diff(1, 1, &[(9999, 100)], &[]), 7);
        book.apply_depth_diff(&diff(2, 2, &[(9999, 60)], &[]), 7);
        let level = book.level_at(9999).unwrap();
        assert_eq!(level.consumed_bid, 40);
        assert_eq!(level.added_bid, 100);
        // Timestamp advance resets the counters.
        book.apply_depth_diff(&diff(3, 3, &[(9999, 80)], &[]), 8);
        let level = book.level_at(9999).unwrap();
        assert_eq!(level.consumed_bid, 0);
        assert_eq!(level.added_bid, 20);
    }

    #[test]
    fn test_circuit_breaker_opens_and_drops() {
        let mut book = ready_book();
        for i in 0..6 {
            book.record_error(i);
        }
        assert!(book.circuit_open(6));
        let out = book.apply_depth_diff(&diff(1, 1, &[(9999, 100)], &[]), 6);
        assert_eq!(out, DiffOutcome::DroppedCircuitOpen);
        assert_eq!(book.health(6).status, HealthStatus::Unhealthy);
        // Circuit closes after the open interval; errors age out of the window.
        let later = 6 + 10_000 + 60_001;
        assert!(!book.circuit_open(later));
    }

    #[test]
    fn test_prune_bounds_level_count_and_distance() {
        let mut book = ready_book();
        // 2000 levels spanning +/- 1000 ticks around mid 10000.
        let mut bids = Vec::new();
        let mut asks = Vec::new();
        for i in 0..1000 {
            bids.push((9999 - i, 10));
            asks.push((10001 + i, 10));
        }
        book.apply_depth_diff(&diff(1, 1, &bids, &asks), 0);
        assert_eq!(book.level_count(), 2000);

        let stats = book.prune(5_000);
        assert!(stats.removed_distant > 0);
        assert!(book.level_count() <= 300);
        let mid = book.mid_price_ticks().unwrap();
        for (&p, _) in book.levels.iter() {
            assert!((p - mid).abs() <= 200, "level {p} too far from mid {mid}");
        }
    }

    #[test]
    fn test_stale_levels_pruned() {
        let mut book = ready_book();
        book.apply_depth_diff(&diff(1, 1, &[(9999, 100)], &[(10001, 50)]), 0);
        let stats = book.prune(300_001);
        assert_eq!(stats.removed_stale, 2);
        assert_eq!(book.level_count(), 0);
    }

    #[test]
    fn test_health_degraded_when_stale_connected_only() {
        let mut book = ready_book();
        book.apply_depth_diff(&diff(1, 1, &[(9999, 100)], &[(10001, 50)]), 0);
        assert_eq!(book.health(1_000).status, HealthStatus::Healthy);
        assert_eq!(book.health(10_000).status, HealthStatus::Degraded);
        // Disconnected stream relaxes staleness but flags recover.
        book.set_stream_connected(false);
        assert!(book.needs_recover());
    }

    #[test]
    fn test_negative_quantities_never_stored() {
        // Wire parsing rejects negatives; the book's own invariant is that
        // every stored level is non-negative after arbitrary diffs.
        let mut book = ready_book();
        book.apply_depth_diff(&diff(1, 1, &[(9999, 100), (9998, 0)], &[(10001, 3)]), 0);
        for (_, l) in book.levels.iter() {
            assert!(l.bid_qty >= 0 && l.ask_qty >= 0);
        }
    }
}
