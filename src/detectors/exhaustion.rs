//! Exhaustion detector.
//!
//! Flags zones where aggressive flow on one side dries up or has eaten
//! through the liquidity it trades against, signalling reversal pressure
//! on the opposite side.

use super::{confluence_boost, Detector, DetectorContext};
use crate::config::ExhaustionConfig;
use crate::error::DetectorError;
use crate::events::{EnrichedTrade, Side, SignalCandidate, SignalType, ZoneData};
use crate::fixed::{clamp01, decimal_to_scaled, div_guard, zone_key, Qty, Ticks};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct TradeObs {
    ts_ms: i64,
    qty: Qty,
    side: Side,
}

#[derive(Debug, Default)]
struct ZoneState {
    trades: VecDeque<TradeObs>,
    buy_volume: Qty,
    sell_volume: Qty,
    last_emit_ms: Option<i64>,
}

pub struct ExhaustionDetector {
    window_ms: i64,
    min_agg_volume: Qty,
    exhaustion_threshold: f64,
    depletion_volume_threshold: Qty,
    depletion_ratio_threshold: f64,
    passive_ratio_balance_threshold: f64,
    passive_volume_exhaustion_ratio: f64,
    min_enhanced_confidence_threshold: f64,
    alignment_normalization_factor: f64,
    variance_reduction_factor: f64,
    zone_ticks: i64,
    flow_trade_count: usize,
    event_cooldown_ms: i64,
    zones: HashMap<Ticks, ZoneState>,
}

impl ExhaustionDetector {
    pub fn new(cfg: &ExhaustionConfig) -> Self {
        Self {
            window_ms: cfg.window_ms,
            min_agg_volume: decimal_to_scaled(cfg.min_agg_volume).unwrap_or(i64::MAX),
            exhaustion_threshold: cfg.exhaustion_threshold,
            depletion_volume_threshold: decimal_to_scaled(cfg.depletion_volume_threshold)
                .unwrap_or(0),
            depletion_ratio_threshold: cfg.depletion_ratio_threshold,
            passive_ratio_balance_threshold: cfg.passive_ratio_balance_threshold,
            passive_volume_exhaustion_ratio: cfg.passive_volume_exhaustion_ratio,
            min_enhanced_confidence_threshold: cfg.min_enhanced_confidence_threshold,
            alignment_normalization_factor: cfg.alignment_normalization_factor,
            variance_reduction_factor: cfg.variance_reduction_factor,
            zone_ticks: cfg.zone_ticks,
            flow_trade_count: cfg.flow_trade_count,
            event_cooldown_ms: cfg.event_cooldown_ms,
            zones: HashMap::new(),
        }
    }

    fn evict(state: &mut ZoneState, now_ms: i64, window_ms: i64) {
        while let Some(front) = state.trades.front() {
            if now_ms - front.ts_ms > window_ms {
                let gone = state.trades.pop_front().expect("front checked");
                match gone.side {
                    Side::Buy => state.buy_volume -= gone.qty,
                    Side::Sell => state.sell_volume -= gone.qty,
                }
            } else {
                break;
            }
        }
    }

    /// Volume decay over the last `flow_trade_count` trades on the
    /// dominant side: second-half volume over first-half volume.
    fn decay_ratio(state: &ZoneState, side: Side, flow_count: usize) -> Option<f64> {
        let n = state.trades.len().min(flow_count);
        if n < 2 {
            return None;
        }
        let recent: Vec<&TradeObs> = state.trades.iter().skip(state.trades.len() - n).collect();
        let half = n / 2;
        let first: Qty = recent[..half]
            .iter()
            .filter(|t| t.side == side)
            .map(|t| t.qty)
            .sum();
        let second: Qty = recent[half..]
            .iter()
            .filter(|t| t.side == side)
            .map(|t| t.qty)
            .sum();
        if first <= 0 {
            return None;
        }
        Some(second as f64 / first as f64)
    }

    /// Per-resolution exhaustion strength (dominant-side share of zone
    /// flow) and its alignment score `mean * (1 - variance)` across the
    /// resolutions that have a snapshot at this price.
    fn alignment_score(zone_data: &ZoneData, price_ticks: Ticks, side: Side) -> Option<f64> {
        let mut strengths = Vec::with_capacity(3);
        for (lane, k) in [
            (&zone_data.zones_5t, 5i64),
            (&zone_data.zones_10t, 10),
            (&zone_data.zones_20t, 20),
        ] {
            let key = zone_key(price_ticks, k);
            if let Some(z) = lane.iter().find(|z| z.zone_key == key) {
                if z.aggressive_volume > 0 {
                    let dominant = match side {
                        Side::Buy => z.aggressive_buy_volume,
                        Side::Sell => z.aggressive_sell_volume,
                    };
                    strengths.push(dominant as f64 / z.aggressive_volume as f64);
                }
            }
        }
        if strengths.len() < 2 {
            return None;
        }
        let mean = strengths.iter().sum::<f64>() / strengths.len() as f64;
        let variance = strengths
            .iter()
            .map(|s| (s - mean) * (s - mean))
            .sum::<f64>()
            / strengths.len() as f64;
        Some(mean * (1.0 - variance.min(1.0)))
    }
}

impl Detector for ExhaustionDetector {
    fn name(&self) -> &'static str {
        "exhaustion"
    }

    fn on_trade(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &mut DetectorContext<'_>,
    ) -> Result<Vec<SignalCandidate>, DetectorError> {
        let now_ms = trade.ts_ms();
        let key = zone_key(trade.price_ticks(), self.zone_ticks);
        let state = self.zones.entry(key).or_default();

        Self::evict(state, now_ms, self.window_ms);
        state.trades.push_back(TradeObs {
            ts_ms: now_ms,
            qty: trade.qty(),
            side: trade.aggressor_side(),
        });
        match trade.aggressor_side() {
            Side::Buy => state.buy_volume += trade.qty(),
            Side::Sell => state.sell_volume += trade.qty(),
        }

        if state.trades.len() < self.flow_trade_count {
            return Ok(Vec::new());
        }
        if let Some(last) = state.last_emit_ms {
            if now_ms - last < self.event_cooldown_ms {
                return Ok(Vec::new());
            }
        }

        let (exhausted_side, dominant_volume) = if state.buy_volume >= state.sell_volume {
            (Side::Buy, state.buy_volume)
        } else {
            (Side::Sell, state.sell_volume)
        };
        if dominant_volume < self.min_agg_volume {
            return Ok(Vec::new());
        }

        // Liquidity the exhausted flow has been consuming.
        let (passive_consumed, passive_other) = match exhausted_side {
            Side::Buy => (trade.zone_passive_ask_qty, trade.zone_passive_bid_qty),
            Side::Sell => (trade.zone_passive_bid_qty, trade.zone_passive_ask_qty),
        };
        let depleted = (passive_consumed as f64)
            < self.passive_volume_exhaustion_ratio * dominant_volume as f64
            || passive_consumed < self.depletion_volume_threshold;
        if !depleted {
            return Ok(Vec::new());
        }

        let Some(decay) = Self::decay_ratio(state, exhausted_side, self.flow_trade_count) else {
            return Ok(Vec::new());
        };
        if decay > self.exhaustion_threshold {
            return Ok(Vec::new());
        }

        // Enhanced branch: cross-resolution alignment must agree.
        let alignment = if ctx.universal.enable_cross_timeframe_analysis {
            match Self::alignment_score(&trade.zone_data, trade.price_ticks(), exhausted_side) {
                Some(score) if score >= self.alignment_normalization_factor => Some(score),
                Some(_) => return Ok(Vec::new()),
                None => None,
            }
        } else {
            None
        };

        let Some(confluence) =
            confluence_boost(&trade.zone_data, trade.price_ticks(), ctx.universal)
        else {
            return Ok(Vec::new());
        };

        let mut confidence = 0.4 + 0.4 * (1.0 - decay);
        confidence += confluence;
        if let Some(score) = alignment {
            confidence += ctx.universal.cross_timeframe_boost * score * self.variance_reduction_factor;
        }
        let consumed_fraction = div_guard(
            dominant_volume as f64,
            (dominant_volume + passive_consumed) as f64,
        );
        if consumed_fraction >= self.depletion_ratio_threshold {
            confidence += 0.05;
        }
        let balance = div_guard(passive_consumed as f64, passive_other as f64);
        if passive_other > 0 && balance < self.passive_ratio_balance_threshold {
            confidence += 0.05;
        }
        let confidence = clamp01(confidence);

        if confidence < self.min_enhanced_confidence_threshold {
            return Ok(Vec::new());
        }

        state.last_emit_ms = Some(now_ms);
        let signal_side = exhausted_side.opposite();

        debug!(
            correlation_id = %trade.correlation_id,
            zone = key,
            exhausted_side = ?exhausted_side,
            decay,
            confidence,
            "exhaustion detected"
        );

        Ok(vec![SignalCandidate {
            id: Uuid::new_v4(),
            correlation_id: trade.correlation_id,
            signal_type: SignalType::Exhaustion,
            side: signal_side,
            price_ticks: trade.price_ticks(),
            confidence,
            ts_ms: now_ms,
            payload: json!({
                "exhaustedSide": exhausted_side,
                "decayRatio": decay,
                "aggressiveVolume": dominant_volume,
                "passiveConsumedSide": passive_consumed,
                "alignmentScore": alignment,
                "consumedFraction": consumed_fraction,
            }),
        }])
    }

    fn cleanup(&mut self, now_ms: i64) {
        let window = self.window_ms;
        self.zones.retain(|_, s| {
            s.trades
                .back()
                .map_or(false, |t| now_ms - t.ts_ms <= window * 4)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{universal_off, EnrichedBuilder};
    use super::*;
    use crate::config::{ByZoneType, SignificanceMap, UniversalZoneConfig, ZoneEngineConfig};
    use crate::events::ZoneSnapshot;
    use crate::zones::ZoneEngine;
    use rust_decimal::Decimal;

    fn cfg() -> ExhaustionConfig {
        ExhaustionConfig {
            window_ms: 30_000,
            min_agg_volume: Decimal::from(600),
            exhaustion_threshold: 0.5,
            depletion_volume_threshold: Decimal::from(50),
            depletion_ratio_threshold: 0.75,
            passive_ratio_balance_threshold: 0.5,
            passive_volume_exhaustion_ratio: 0.5,
            min_enhanced_confidence_threshold: 0.6,
            alignment_normalization_factor: 0.4,
            variance_reduction_factor: 1.0,
            zone_ticks: 5,
            flow_trade_count: 20,
            event_cooldown_ms: 15_000,
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

    struct Harness {
        detector: ExhaustionDetector,
        zones: ZoneEngine,
        universal: UniversalZoneConfig,
        updates: Vec<crate::zones::ZoneUpdate>,
    }

    impl Harness {
        fn new(universal: UniversalZoneConfig) -> Self {
            Self {
                detector: ExhaustionDetector::new(&cfg()),
                zones: ZoneEngine::new(&zone_cfg(), "BTCUSDT".into()),
                universal,
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
    }

    /// Seed scenario: twenty aggressive buys, 900 units in the first ten
    /// and 250 in the next ten, against a nearly empty ask.
    #[test]
    fn test_exhaustion_sell_scenario() {
        let mut h = Harness::new(universal_off());
        let mut signals = Vec::new();
        for i in 0..20i64 {
            let qty = if i < 10 { 90 } else { 25 };
            let t = EnrichedBuilder::new(8630, qty, 1_000 + i * 300, false)
                .zone_passive(400, 100)
                .build(i as u64);
            signals.extend(h.feed(&t));
        }
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.signal_type, SignalType::Exhaustion);
        assert_eq!(s.side, Side::Sell);
        // The signal lands on the 20th trade itself.
        assert_eq!(s.ts_ms, 1_000 + 19 * 300);
        assert!(s.confidence >= 0.6);
    }

    #[test]
    fn test_no_signal_when_flow_sustained() {
        let mut h = Harness::new(universal_off());
        let mut signals = Vec::new();
        for i in 0..24i64 {
            // Constant 90-unit buys: decay ratio ~1.0.
            let t = EnrichedBuilder::new(8630, 90, 1_000 + i * 300, false)
                .zone_passive(400, 100)
                .build(i as u64);
            signals.extend(h.feed(&t));
        }
        assert!(signals.is_empty());
    }

    #[test]
    fn test_no_signal_when_passive_still_thick() {
        let mut h = Harness::new(universal_off());
        let mut signals = Vec::new();
        for i in 0..20i64 {
            let qty = if i < 10 { 90 } else { 25 };
            // Ask holds 2000 units: far above the exhaustion ratio.
            let t = EnrichedBuilder::new(8630, qty, 1_000 + i * 300, false)
                .zone_passive(400, 2000)
                .build(i as u64);
            signals.extend(h.feed(&t));
        }
        assert!(signals.is_empty());
    }

    #[test]
    fn test_sell_exhaustion_signals_buy() {
        let mut h = Harness::new(universal_off());
        let mut signals = Vec::new();
        for i in 0..20i64 {
            let qty = if i < 10 { 90 } else { 20 };
            let t = EnrichedBuilder::new(8630, qty, 1_000 + i * 300, true)
                .zone_passive(100, 400)
                .build(i as u64);
            signals.extend(h.feed(&t));
        }
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, Side::Buy);
    }

    #[test]
    fn test_alignment_gate_in_enhanced_mode() {
        let mut universal = universal_off();
        universal.enable_cross_timeframe_analysis = true;
        let mut h = Harness::new(universal);

        // Aligned buy-dominant zones at every resolution around 8630.
        let make_zone = |key: i64, k: i64| ZoneSnapshot {
            zone_key: key,
            resolution_ticks: k,
            aggressive_volume: 1000,
            aggressive_buy_volume: 800,
            aggressive_sell_volume: 200,
            passive_volume: 0,
            passive_bid_volume: 0,
            passive_ask_volume: 0,
            trade_count: 10,
            timespan_ms: 5_000,
            min_price_ticks: key,
            max_price_ticks: key + k - 1,
            last_update_ms: 0,
            vwap_ticks: key as f64,
        };

        let mut signals = Vec::new();
        for i in 0..20i64 {
            let qty = if i < 10 { 90 } else { 25 };
            let mut b = EnrichedBuilder::new(8630, qty, 1_000 + i * 300, false)
                .zone_passive(400, 100);
            b.zone_data.zones_5t = vec![make_zone(8630, 5)];
            b.zone_data.zones_10t = vec![make_zone(8630, 10)];
            b.zone_data.zones_20t = vec![make_zone(8620, 20)];
            signals.extend(h.feed(&b.build(i as u64)));
        }
        // Strengths are 0.8 at every resolution: variance 0, aligned.
        assert_eq!(signals.len(), 1);
        let alignment = signals[0].payload["alignmentScore"].as_f64().unwrap();
        assert!((alignment - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_misaligned_resolutions_suppress() {
        let mut universal = universal_off();
        universal.enable_cross_timeframe_analysis = true;
        let mut h = Harness::new(universal);

        let make_zone = |key: i64, k: i64, buy: i64| ZoneSnapshot {
            zone_key: key,
            resolution_ticks: k,
            aggressive_volume: 1000,
            aggressive_buy_volume: buy,
            aggressive_sell_volume: 1000 - buy,
            passive_volume: 0,
            passive_bid_volume: 0,
            passive_ask_volume: 0,
            trade_count: 10,
            timespan_ms: 5_000,
            min_price_ticks: key,
            max_price_ticks: key + k - 1,
            last_update_ms: 0,
            vwap_ticks: key as f64,
        };

        let mut signals = Vec::new();
        for i in 0..20i64 {
            let qty = if i < 10 { 90 } else { 25 };
            let mut b = EnrichedBuilder::new(8630, qty, 1_000 + i * 300, false)
                .zone_passive(400, 100);
            // Wildly different dominant shares across resolutions:
            // 0.9 / 0.1 / 0.2 gives mean 0.4, variance ~0.127, score ~0.35.
            b.zone_data.zones_5t = vec![make_zone(8630, 5, 900)];
            b.zone_data.zones_10t = vec![make_zone(8630, 10, 100)];
            b.zone_data.zones_20t = vec![make_zone(8620, 20, 200)];
            signals.extend(h.feed(&b.build(i as u64)));
        }
        assert!(signals.is_empty());
    }
}
