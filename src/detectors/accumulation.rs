//! Accumulation detector: sustained sell-side flow absorbed by passive
//! bids inside a narrow price band.

use super::flow_zone::{FlowZoneParams, FlowZoneTracker};
use super::{Detector, DetectorContext};
use crate::config::AccumulationConfig;
use crate::error::DetectorError;
use crate::events::{EnrichedTrade, SignalCandidate};
use crate::fixed::decimal_to_scaled;
use crate::zones::ZoneType;

pub struct AccumulationDetector {
    tracker: FlowZoneTracker,
}

impl AccumulationDetector {
    pub fn new(cfg: &AccumulationConfig) -> Self {
        Self {
            tracker: FlowZoneTracker::new(FlowZoneParams {
                zone_type: ZoneType::Accumulation,
                window_ms: cfg.window_ms,
                min_duration_ms: cfg.min_duration_ms,
                zone_size_ticks: cfg.zone_size_ticks,
                min_ratio: cfg.min_ratio,
                min_recent_activity_ms: cfg.min_recent_activity_ms,
                min_agg_volume: decimal_to_scaled(cfg.min_agg_volume).unwrap_or(i64::MAX),
                track_side: cfg.track_side,
                min_side_ratio: cfg.min_sell_ratio,
                min_zone_volume: decimal_to_scaled(cfg.min_zone_volume).unwrap_or(i64::MAX),
                min_trade_count: cfg.min_trade_count,
                min_zone_strength: cfg.min_zone_strength,
                max_price_deviation_ticks: cfg.max_price_deviation_ticks,
            }),
        }
    }
}

impl Detector for AccumulationDetector {
    fn name(&self) -> &'static str {
        "accumulation"
    }

    fn on_trade(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &mut DetectorContext<'_>,
    ) -> Result<Vec<SignalCandidate>, DetectorError> {
        self.tracker.on_trade(trade, ctx)
    }

    fn cleanup(&mut self, now_ms: i64) {
        self.tracker.cleanup(now_ms);
    }
}
