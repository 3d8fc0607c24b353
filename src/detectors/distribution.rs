//! Distribution detector: sustained buy-side flow absorbed by passive
//! offers inside a narrow price band.

use super::flow_zone::{FlowZoneParams, FlowZoneTracker};
use super::{Detector, DetectorContext};
use crate::config::DistributionConfig;
use crate::error::DetectorError;
use crate::events::{EnrichedTrade, SignalCandidate};
use crate::fixed::decimal_to_scaled;
use crate::zones::ZoneType;

pub struct DistributionDetector {
    tracker: FlowZoneTracker,
}

impl DistributionDetector {
    pub fn new(cfg: &DistributionConfig) -> Self {
        Self {
            tracker: FlowZoneTracker::new(FlowZoneParams {
                zone_type: ZoneType::Distribution,
                window_ms: cfg.window_ms,
                min_duration_ms: cfg.min_duration_ms,
                zone_size_ticks: cfg.zone_size_ticks,
                min_ratio: cfg.min_ratio,
                min_recent_activity_ms: cfg.min_recent_activity_ms,
                min_agg_volume: decimal_to_scaled(cfg.min_agg_volume).unwrap_or(i64::MAX),
                track_side: cfg.track_side,
                min_side_ratio: cfg.min_buy_ratio,
                min_zone_volume: decimal_to_scaled(cfg.min_zone_volume).unwrap_or(i64::MAX),
                min_trade_count: cfg.min_trade_count,
                min_zone_strength: cfg.min_zone_strength,
                max_price_deviation_ticks: cfg.max_price_deviation_ticks,
            }),
        }
    }
}

impl Detector for DistributionDetector {
    fn name(&self) -> &'static str {
        "distribution"
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

#[cfg(test)]
mod tests {
    use super::super::test_support::{universal_off, EnrichedBuilder};
    use super::*;
    use crate::config::{ByZoneType, SignificanceMap, ZoneEngineConfig};
    use crate::events::{Side, SignalType};
    use crate::zones::{ZoneEngine, ZoneUpdate};
    use rust_decimal::Decimal;

    fn cfg() -> DistributionConfig {
        DistributionConfig {
            window_ms: 300_000,
            min_duration_ms: 120_000,
            zone_size_ticks: 5,
            min_ratio: 0.6,
            min_recent_activity_ms: 60_000,
            min_agg_volume: Decimal::from(500),
            track_side: true,
            min_buy_ratio: 0.62,
            min_zone_volume: Decimal::from(800),
            min_trade_count: 10,
            min_zone_strength: 0.45,
            max_price_deviation_ticks: 5,
        }
    }

    fn zone_cfg() -> ZoneEngineConfig {
        ZoneEngineConfig {
            max_active_zones: 8,
            zone_timeout_ms: 1_800_000,
            strength_change_threshold: 0.08,
            completion_threshold: 0.85,
            history_retention_ms: 3_600_000,
            max_history_per_symbol: 16,
            expected_volume_by_significance: SignificanceMap {
                minor: Decimal::from(500),
                moderate: Decimal::from(2000),
                major: Decimal::from(8000),
                institutional: Decimal::from(25000),
            },
            expected_time_by_significance_by_type: ByZoneType {
                accumulation: SignificanceMap {
                    minor: 600_000,
                    moderate: 1_200_000,
                    major: 2_400_000,
                    institutional: 4_800_000,
                },
                distribution: SignificanceMap {
                    minor: 300_000,
                    moderate: 600_000,
                    major: 1_200_000,
                    institutional: 2_400_000,
                },
            },
            strength_volume_ref: Decimal::from(1000),
            strength_time_ref_ms: 300_000,
            confidence_time_ref_ms: 600_000,
            merge_tolerance_ticks: 6,
            expire_interval_ms: 30_000,
            gc_interval_ms: 60_000,
        }
    }

    #[test]
    fn test_distribution_zone_created_from_buy_flow() {
        let mut detector = DistributionDetector::new(&cfg());
        let mut zones = ZoneEngine::new(&zone_cfg(), "BTCUSDT".into());
        let universal = universal_off();
        let mut updates: Vec<ZoneUpdate> = Vec::new();

        let mut signals = Vec::new();
        for i in 0..12i64 {
            let is_sell = i == 4 || i == 8;
            // buyer_is_maker=false is an aggressive buy.
            let t = EnrichedBuilder::new(8725 + (i % 3), 75, i * 13_636, is_sell)
                .zone_passive(400, 1500)
                .build(i as u64);
            let mut ctx = DetectorContext {
                zones: &mut zones,
                universal: &universal,
                zone_updates: &mut updates,
            };
            signals.extend(detector.on_trade(&t, &mut ctx).unwrap());
        }

        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::Distribution);
        assert_eq!(s.side, Side::Sell);
        assert_eq!(s.payload["transition"], "created");
        assert_eq!(zones.active_count(), 1);
    }

    #[test]
    fn test_sell_flow_does_not_promote_distribution() {
        let mut detector = DistributionDetector::new(&cfg());
        let mut zones = ZoneEngine::new(&zone_cfg(), "BTCUSDT".into());
        let universal = universal_off();
        let mut updates: Vec<ZoneUpdate> = Vec::new();

        let mut signals = Vec::new();
        for i in 0..12i64 {
            let t = EnrichedBuilder::new(8725 + (i % 3), 75, i * 13_636, true)
                .zone_passive(400, 1500)
                .build(i as u64);
            let mut ctx = DetectorContext {
                zones: &mut zones,
                universal: &universal,
                zone_updates: &mut updates,
            };
            signals.extend(detector.on_trade(&t, &mut ctx).unwrap());
        }
        assert!(signals.is_empty());
        assert_eq!(zones.active_count(), 0);
    }
}
