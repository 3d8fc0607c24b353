//! Pattern detectors over the enriched trade stream.
//!
//! Each detector is one state machine behind the [`Detector`] trait;
//! enhanced behaviour is a configuration branch of the same machine, never
//! a wrapper emitting its own copy of events.

pub mod absorption;
pub mod accumulation;
pub mod cvd;
pub mod distribution;
pub mod exhaustion;
mod flow_zone;

pub use absorption::AbsorptionDetector;
pub use accumulation::AccumulationDetector;
pub use cvd::CvdDivergenceDetector;
pub use distribution::DistributionDetector;
pub use exhaustion::ExhaustionDetector;

use crate::config::UniversalZoneConfig;
use crate::error::DetectorError;
use crate::events::{EnrichedTrade, SignalCandidate, ZoneData};
use crate::fixed::Ticks;
use crate::zones::{ZoneEngine, ZoneUpdate};

/// Shared mutable context handed to detectors for one pipeline turn.
pub struct DetectorContext<'a> {
    pub zones: &'a mut ZoneEngine,
    pub universal: &'a UniversalZoneConfig,
    /// Zone lifecycle events produced during this turn, drained by the
    /// pipeline after each detector runs.
    pub zone_updates: &'a mut Vec<ZoneUpdate>,
}

/// A zone-aware signal detector.
pub trait Detector {
    fn name(&self) -> &'static str;

    /// Process one enriched trade. Errors are isolated by the pipeline:
    /// they increment the detector error counter and never cancel the
    /// turn.
    fn on_trade(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &mut DetectorContext<'_>,
    ) -> Result<Vec<SignalCandidate>, DetectorError>;

    /// Idempotent periodic cleanup.
    fn cleanup(&mut self, _now_ms: i64) {}
}

/// Snapshots across all resolutions whose center lies within the
/// confluence distance of the price.
pub fn confluence_count(zone_data: &ZoneData, price_ticks: Ticks, max_distance_ticks: i64) -> usize {
    zone_data
        .all()
        .filter(|z| (z.center_ticks() - price_ticks).abs() <= max_distance_ticks)
        .count()
}

/// Confluence gate and boost shared by the enhanced detectors. Returns
/// `None` when the confluence filter is enabled and unmet; otherwise the
/// confidence boost to apply.
pub fn confluence_boost(
    zone_data: &ZoneData,
    price_ticks: Ticks,
    cfg: &UniversalZoneConfig,
) -> Option<f64> {
    let count = confluence_count(zone_data, price_ticks, cfg.max_zone_confluence_distance);
    if count >= cfg.min_zone_confluence_count {
        Some(cfg.confluence_confidence_boost)
    } else if cfg.enable_zone_confluence_filter {
        None
    } else {
        Some(0.0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::UniversalZoneConfig;
    use crate::events::{AggressiveTrade, EnrichedTrade, ZoneData};
    use crate::fixed::{Qty, Ticks, SCALE};
    use uuid::Uuid;

    /// Universal zone config with all enhanced behaviour off.
    pub fn universal_off() -> UniversalZoneConfig {
        UniversalZoneConfig {
            min_zone_confluence_count: 2,
            max_zone_confluence_distance: 15,
            confluence_confidence_boost: 0.1,
            enable_zone_confluence_filter: false,
            enable_cross_timeframe_analysis: false,
            cross_timeframe_boost: 0.1,
        }
    }

    pub struct EnrichedBuilder {
        pub price_ticks: Ticks,
        pub qty_units: i64,
        pub ts_ms: i64,
        pub buyer_is_maker: bool,
        pub passive_bid: Qty,
        pub passive_ask: Qty,
        pub zone_passive_bid: Qty,
        pub zone_passive_ask: Qty,
        pub zone_data: ZoneData,
    }

    impl EnrichedBuilder {
        pub fn new(price_ticks: Ticks, qty_units: i64, ts_ms: i64, buyer_is_maker: bool) -> Self {
            Self {
                price_ticks,
                qty_units,
                ts_ms,
                buyer_is_maker,
                passive_bid: 0,
                passive_ask: 0,
                zone_passive_bid: 0,
                zone_passive_ask: 0,
                zone_data: ZoneData::default(),
            }
        }

        pub fn zone_passive(mut self, bid_units: i64, ask_units: i64) -> Self {
            self.zone_passive_bid = bid_units * SCALE;
            self.zone_passive_ask = ask_units * SCALE;
            self
        }

        pub fn build(self, trade_id: u64) -> EnrichedTrade {
            EnrichedTrade {
                trade: AggressiveTrade {
                    trade_id,
                    price_ticks: self.price_ticks,
                    qty: self.qty_units * SCALE,
                    ts_ms: self.ts_ms,
                    buyer_is_maker: self.buyer_is_maker,
                },
                correlation_id: Uuid::new_v4(),
                best_bid: Some(self.price_ticks - 1),
                best_ask: Some(self.price_ticks + 1),
                spread_ticks: Some(2),
                passive_bid_qty: self.passive_bid,
                passive_ask_qty: self.passive_ask,
                zone_passive_bid_qty: self.zone_passive_bid,
                zone_passive_ask_qty: self.zone_passive_ask,
                book_unavailable: false,
                zone_data: self.zone_data,
            }
        }
    }
}
