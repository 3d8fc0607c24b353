//! Cumulative-volume-delta divergence detector.
//!
//! Maintains rolling signed-volume sums over the configured windows and
//! gates on the z-score of the shortest window's delta against its own
//! sampled history. Enhancement mode folds in zone confluence,
//! per-resolution imbalance, and cross-resolution momentum alignment as
//! branches of the same state machine.

use super::{confluence_boost, Detector, DetectorContext};
use crate::config::{CvdConfig, EnhancementMode};
use crate::error::DetectorError;
use crate::events::{EnrichedTrade, Side, SignalCandidate, SignalType, ZoneData};
use crate::fixed::{clamp01, decimal_to_scaled, div_guard, Qty, Ticks, WindowedStats};
use serde_json::json;
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

/// Minimum spacing between delta samples entering the z-score history.
const SAMPLE_SPACING_MS: i64 = 1_000;

struct WindowLane {
    window_ms: i64,
    entries: VecDeque<(i64, i64, Ticks)>,
    /// Rolling Σ signed quantity.
    sum: i64,
    history: VecDeque<f64>,
    stats: WindowedStats,
    last_sample_ms: i64,
}

impl WindowLane {
    fn new(window_sec: u32) -> Self {
        Self {
            window_ms: window_sec as i64 * 1_000,
            entries: VecDeque::new(),
            sum: 0,
            history: VecDeque::new(),
            stats: WindowedStats::new(),
            last_sample_ms: i64::MIN,
        }
    }

    fn push(&mut self, ts_ms: i64, signed_qty: i64, price_ticks: Ticks) {
        while let Some(&(t, q, _)) = self.entries.front() {
            if ts_ms - t > self.window_ms {
                self.entries.pop_front();
                self.sum -= q;
            } else {
                break;
            }
        }
        self.entries.push_back((ts_ms, signed_qty, price_ticks));
        self.sum += signed_qty;
    }

    fn delta(&self) -> i64 {
        self.sum
    }

    /// Price drift across the retained window, in ticks.
    fn price_change_ticks(&self) -> i64 {
        match (self.entries.front(), self.entries.back()) {
            (Some(&(_, _, first)), Some(&(_, _, last))) => last - first,
            _ => 0,
        }
    }

    fn z_score(&self, min_samples: usize) -> Option<f64> {
        if (self.stats.count() as usize) < min_samples {
            return None;
        }
        Some(self.stats.z_score(self.delta() as f64))
    }

    fn sample(&mut self, ts_ms: i64, cap: usize) {
        if ts_ms - self.last_sample_ms < SAMPLE_SPACING_MS {
            return;
        }
        self.last_sample_ms = ts_ms;
        let value = self.delta() as f64;
        self.history.push_back(value);
        self.stats.push(value);
        while self.history.len() > cap {
            if let Some(old) = self.history.pop_front() {
                self.stats.pop(old);
            }
        }
    }

    /// Share of buy volume in the retained window.
    fn buy_share(&self) -> f64 {
        let buy: i64 = self.entries.iter().map(|&(_, q, _)| q.max(0)).sum();
        let total: i64 = self.entries.iter().map(|&(_, q, _)| q.abs()).sum();
        div_guard(buy as f64, total as f64)
    }
}

pub struct CvdDivergenceDetector {
    min_z: f64,
    base_confidence_required: f64,
    divergence_volume_threshold: Qty,
    divergence_strength_threshold: f64,
    significant_imbalance_threshold: f64,
    divergence_score_multiplier: f64,
    momentum_score_multiplier: f64,
    alignment_minimum_threshold: f64,
    mode: EnhancementMode,
    zscore_sample_cap: usize,
    min_history_samples: usize,
    event_cooldown_ms: i64,
    lanes: Vec<WindowLane>,
    last_emit_ms: i64,
}

impl CvdDivergenceDetector {
    pub fn new(cfg: &CvdConfig) -> Self {
        Self {
            min_z: cfg.min_z,
            base_confidence_required: cfg.base_confidence_required,
            divergence_volume_threshold: decimal_to_scaled(cfg.cvd_divergence_volume_threshold)
                .unwrap_or(i64::MAX),
            divergence_strength_threshold: cfg.cvd_divergence_strength_threshold,
            significant_imbalance_threshold: cfg.cvd_significant_imbalance_threshold,
            divergence_score_multiplier: cfg.cvd_divergence_score_multiplier,
            momentum_score_multiplier: cfg.momentum_score_multiplier,
            alignment_minimum_threshold: cfg.alignment_minimum_threshold,
            mode: cfg.enhancement_mode,
            zscore_sample_cap: cfg.zscore_sample_cap,
            min_history_samples: cfg.min_history_samples,
            event_cooldown_ms: cfg.event_cooldown_ms,
            lanes: cfg.windows_sec.iter().map(|&w| WindowLane::new(w)).collect(),
            last_emit_ms: i64::MIN / 2,
        }
    }

    /// Divergence strength: CVD pushing one way while price drifts the
    /// other. Zero unless the delta clears the volume threshold.
    fn divergence_score(&self, lane: &WindowLane) -> f64 {
        let delta = lane.delta();
        let drift = lane.price_change_ticks();
        if delta.abs() < self.divergence_volume_threshold {
            return 0.0;
        }
        if (delta > 0 && drift >= 0) || (delta < 0 && drift <= 0) {
            return 0.0;
        }
        let score = clamp01(delta.abs() as f64 / (2 * self.divergence_volume_threshold) as f64);
        if score >= self.divergence_strength_threshold {
            score
        } else {
            0.0
        }
    }

    /// Aggregate buy share across the observed zones; falls back to the
    /// lane's own window flow when no zones are in view.
    fn zone_buy_ratio(zone_data: &ZoneData, fallback: &WindowLane) -> f64 {
        let mut buy: Qty = 0;
        let mut total: Qty = 0;
        for z in zone_data.all() {
            buy += z.aggressive_buy_volume;
            total += z.aggressive_volume;
        }
        if total > 0 {
            buy as f64 / total as f64
        } else {
            fallback.buy_share()
        }
    }

    /// Fraction of resolutions whose net flow sign agrees with the
    /// overall net flow. Vacuously 1.0 with no zone data.
    fn momentum_alignment(zone_data: &ZoneData) -> f64 {
        let lane_net = |zones: &[crate::events::ZoneSnapshot]| -> i64 {
            zones
                .iter()
                .map(|z| z.aggressive_buy_volume - z.aggressive_sell_volume)
                .sum()
        };
        let nets: Vec<i64> = [
            lane_net(&zone_data.zones_5t),
            lane_net(&zone_data.zones_10t),
            lane_net(&zone_data.zones_20t),
        ]
        .into_iter()
        .filter(|&n| n != 0)
        .collect();
        if nets.is_empty() {
            return 1.0;
        }
        let overall: i64 = nets.iter().sum();
        if overall == 0 {
            return 0.0;
        }
        let agreeing = nets
            .iter()
            .filter(|&&n| n.signum() == overall.signum())
            .count();
        agreeing as f64 / nets.len() as f64
    }

    /// Count of zones in view with a significant one-sided imbalance.
    fn significant_imbalance_count(&self, zone_data: &ZoneData) -> usize {
        zone_data
            .all()
            .filter(|z| z.flow_imbalance().abs() >= self.significant_imbalance_threshold)
            .count()
    }
}

impl Detector for CvdDivergenceDetector {
    fn name(&self) -> &'static str {
        "cvd_divergence"
    }

    fn on_trade(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &mut DetectorContext<'_>,
    ) -> Result<Vec<SignalCandidate>, DetectorError> {
        let now_ms = trade.ts_ms();
        let signed = match trade.aggressor_side() {
            Side::Buy => trade.qty(),
            Side::Sell => -trade.qty(),
        };
        for lane in &mut self.lanes {
            lane.push(now_ms, signed, trade.price_ticks());
        }

        // Evaluate against the history as it stood before this trade,
        // then record the sample.
        let z = self.lanes[0].z_score(self.min_history_samples);
        for lane in &mut self.lanes {
            let cap = self.zscore_sample_cap;
            lane.sample(now_ms, cap);
        }
        let Some(z) = z else {
            return Ok(Vec::new());
        };
        if z.abs() < self.min_z {
            return Ok(Vec::new());
        }
        if now_ms - self.last_emit_ms < self.event_cooldown_ms {
            return Ok(Vec::new());
        }

        let lane = &self.lanes[0];
        let base_confidence = clamp01(0.2 + 0.6 * clamp01(z.abs() / (2.0 * self.min_z)));

        let divergence = self.divergence_score(lane);
        let momentum = Self::momentum_alignment(&trade.zone_data);
        let imbalanced_zones = self.significant_imbalance_count(&trade.zone_data);
        let Some(confluence) =
            confluence_boost(&trade.zone_data, trade.price_ticks(), ctx.universal)
        else {
            return Ok(Vec::new());
        };
        let enhanced_confidence = clamp01(
            base_confidence
                + divergence * self.divergence_score_multiplier
                + momentum * self.momentum_score_multiplier
                + confluence,
        );

        let (confidence, gated) = match self.mode {
            EnhancementMode::Disabled => {
                (base_confidence, base_confidence >= self.base_confidence_required)
            }
            EnhancementMode::Monitoring => {
                debug!(
                    correlation_id = %trade.correlation_id,
                    z,
                    base_confidence,
                    enhanced_confidence,
                    momentum,
                    divergence,
                    "cvd enhancement monitoring"
                );
                (base_confidence, base_confidence >= self.base_confidence_required)
            }
            EnhancementMode::Production => (
                enhanced_confidence,
                enhanced_confidence >= self.base_confidence_required
                    && momentum >= self.alignment_minimum_threshold,
            ),
        };
        if !gated {
            return Ok(Vec::new());
        }

        let buy_ratio = Self::zone_buy_ratio(&trade.zone_data, lane);
        let side = if buy_ratio > 0.6 {
            Side::Buy
        } else if buy_ratio < 0.4 {
            Side::Sell
        } else {
            // Neutral aggregate: suppressed.
            return Ok(Vec::new());
        };

        self.last_emit_ms = now_ms;

        debug!(
            correlation_id = %trade.correlation_id,
            z,
            buy_ratio,
            confidence,
            side = ?side,
            "cvd signal"
        );

        Ok(vec![SignalCandidate {
            id: Uuid::new_v4(),
            correlation_id: trade.correlation_id,
            signal_type: SignalType::CvdConfirmation,
            side,
            price_ticks: trade.price_ticks(),
            confidence,
            ts_ms: now_ms,
            payload: json!({
                "zScore": z,
                "windowDelta": lane.delta(),
                "windowSec": lane.window_ms / 1_000,
                "buyRatio": buy_ratio,
                "divergenceScore": divergence,
                "momentumAlignment": momentum,
                "imbalancedZones": imbalanced_zones,
                "mode": format!("{:?}", self.mode).to_lowercase(),
            }),
        }])
    }

    fn cleanup(&mut self, _now_ms: i64) {}
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{universal_off, EnrichedBuilder};
    use super::*;
    use crate::config::{ByZoneType, SignificanceMap, ZoneEngineConfig};
    use crate::events::ZoneSnapshot;
    use crate::zones::{ZoneEngine, ZoneUpdate};
    use rust_decimal::Decimal;

    fn cfg(mode: EnhancementMode) -> CvdConfig {
        CvdConfig {
            windows_sec: vec![60, 300],
            min_z: 2.0,
            base_confidence_required: 0.55,
            cvd_divergence_volume_threshold: Decimal::from(400),
            cvd_divergence_strength_threshold: 0.3,
            cvd_significant_imbalance_threshold: 0.35,
            cvd_divergence_score_multiplier: 0.25,
            momentum_score_multiplier: 0.2,
            alignment_minimum_threshold: 0.5,
            enhancement_mode: mode,
            zscore_sample_cap: 240,
            min_history_samples: 10,
            event_cooldown_ms: 20_000,
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

    fn snapshot(zone_key: Ticks, k: i64, buy: i64, sell: i64) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_key,
            resolution_ticks: k,
            aggressive_volume: buy + sell,
            aggressive_buy_volume: buy,
            aggressive_sell_volume: sell,
            passive_volume: 0,
            passive_bid_volume: 0,
            passive_ask_volume: 0,
            trade_count: 10,
            timespan_ms: 5_000,
            min_price_ticks: zone_key,
            max_price_ticks: zone_key + k - 1,
            last_update_ms: 0,
            vwap_ticks: zone_key as f64,
        }
    }

    struct Harness {
        detector: CvdDivergenceDetector,
        zones: ZoneEngine,
        universal: crate::config::UniversalZoneConfig,
        updates: Vec<ZoneUpdate>,
    }

    impl Harness {
        fn new(mode: EnhancementMode) -> Self {
            Self {
                detector: CvdDivergenceDetector::new(&cfg(mode)),
                zones: ZoneEngine::new(&zone_cfg(), "BTCUSDT".into()),
                universal: universal_off(),
                updates: Vec::new(),
            }
        }

        fn feed(&mut self, trade: &EnrichedTrade) -> Vec<SignalCandidate> {
            let mut ctx = DetectorContext {
                zones: &mut self.zones,
                universal: &self.universal,
                zone_updates: &mut self.updates,
            };
            self.detector.on_trade(trade, &mut ctx).unwrap()
        }

        /// Thirty seconds of balanced 1-unit churn to seed the z-score
        /// history, then a one-sided buy burst.
        fn seed_and_burst(&mut self) -> Vec<SignalCandidate> {
            let mut signals = Vec::new();
            for i in 0..30i64 {
                let t = EnrichedBuilder::new(8628, 1, i * 1_000, i % 2 == 0).build(i as u64);
                signals.extend(self.feed(&t));
            }
            for i in 0..6i64 {
                let t = EnrichedBuilder::new(8628, 80, 30_000 + i * 1_000, false).build(100 + i as u64);
                signals.extend(self.feed(&t));
            }
            signals
        }
    }

    #[test]
    fn test_buy_burst_emits_buy_signal() {
        let mut h = Harness::new(EnhancementMode::Disabled);
        let signals = h.seed_and_burst();
        assert_eq!(signals.len(), 1, "cooldown caps the burst at one signal");
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::CvdConfirmation);
        assert_eq!(s.side, Side::Buy);
        assert!(s.confidence >= 0.55);
        assert!(s.payload["zScore"].as_f64().unwrap() >= 2.0);
    }

    #[test]
    fn test_quiet_flow_never_signals() {
        let mut h = Harness::new(EnhancementMode::Disabled);
        let mut signals = Vec::new();
        for i in 0..120i64 {
            let t = EnrichedBuilder::new(8628, 1, i * 1_000, i % 2 == 0).build(i as u64);
            signals.extend(h.feed(&t));
        }
        assert!(signals.is_empty());
    }

    #[test]
    fn test_neutral_zone_aggregate_suppresses() {
        let mut h = Harness::new(EnhancementMode::Disabled);
        for i in 0..30i64 {
            let t = EnrichedBuilder::new(8628, 1, i * 1_000, i % 2 == 0).build(i as u64);
            h.feed(&t);
        }
        let mut signals = Vec::new();
        for i in 0..6i64 {
            let mut b = EnrichedBuilder::new(8628, 80, 30_000 + i * 1_000, false);
            // Balanced zones: buy ratio 0.5 inside the neutral band.
            b.zone_data.zones_5t = vec![snapshot(8625, 5, 500, 500)];
            signals.extend(h.feed(&b.build(100 + i as u64)));
        }
        assert!(signals.is_empty());
    }

    #[test]
    fn test_monitoring_mode_gates_like_disabled() {
        let mut disabled = Harness::new(EnhancementMode::Disabled);
        let mut monitoring = Harness::new(EnhancementMode::Monitoring);
        let a = disabled.seed_and_burst();
        let b = monitoring.seed_and_burst();
        assert_eq!(a.len(), b.len());
        if let (Some(x), Some(y)) = (a.first(), b.first()) {
            assert!((x.confidence - y.confidence).abs() < 1e-12);
        }
    }

    #[test]
    fn test_production_mode_requires_alignment() {
        let mut h = Harness::new(EnhancementMode::Production);
        // Raise the alignment floor so 2-of-3 agreement is insufficient.
        h.detector.alignment_minimum_threshold = 0.9;

        for i in 0..30i64 {
            let t = EnrichedBuilder::new(8628, 1, i * 1_000, i % 2 == 0).build(i as u64);
            h.feed(&t);
        }
        let mut signals = Vec::new();
        for i in 0..6i64 {
            let mut b = EnrichedBuilder::new(8628, 80, 30_000 + i * 1_000, false);
            // Buy-dominant at 5t and 10t, sell-dominant at 20t.
            b.zone_data.zones_5t = vec![snapshot(8625, 5, 900, 100)];
            b.zone_data.zones_10t = vec![snapshot(8620, 10, 800, 200)];
            b.zone_data.zones_20t = vec![snapshot(8620, 20, 200, 800)];
            signals.extend(h.feed(&b.build(100 + i as u64)));
        }
        assert!(signals.is_empty(), "misaligned resolutions must suppress");
    }

    #[test]
    fn test_production_mode_aligned_signal() {
        let mut h = Harness::new(EnhancementMode::Production);
        for i in 0..30i64 {
            let t = EnrichedBuilder::new(8628, 1, i * 1_000, i % 2 == 0).build(i as u64);
            h.feed(&t);
        }
        let mut signals = Vec::new();
        for i in 0..6i64 {
            let mut b = EnrichedBuilder::new(8628, 80, 30_000 + i * 1_000, false);
            b.zone_data.zones_5t = vec![snapshot(8625, 5, 900, 100)];
            b.zone_data.zones_10t = vec![snapshot(8620, 10, 800, 200)];
            b.zone_data.zones_20t = vec![snapshot(8620, 20, 700, 300)];
            signals.extend(h.feed(&b.build(100 + i as u64)));
        }
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
        assert_eq!(signals[0].payload["momentumAlignment"].as_f64().unwrap(), 1.0);
    }
}
