//! Absorption detector.
//!
//! Flags zones where a large run of aggressive volume on one side fails
//! to move price while the passive liquidity it consumes stays thick.
//! The signal follows the dominant aggressive side: aggressive buyers
//! grinding into a standing ask wall emit a buy signal.

use super::{Detector, DetectorContext};
use crate::config::AbsorptionConfig;
use crate::error::DetectorError;
use crate::events::{EnrichedTrade, Side, SignalCandidate, SignalType};
use crate::fixed::{clamp01, decimal_to_scaled, div_guard, zone_key, Qty, Ticks};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct TradeObs {
    ts_ms: i64,
    price_ticks: Ticks,
    qty: Qty,
    side: Side,
}

#[derive(Debug, Default)]
struct ZoneState {
    trades: VecDeque<TradeObs>,
    buy_volume: Qty,
    sell_volume: Qty,
    /// Opposite-side passive observations for the rolling average.
    passive_history: VecDeque<(i64, Qty)>,
    /// Dominant window volumes observed at past evaluations.
    volume_history: VecDeque<(i64, Qty)>,
    last_emit_ms: Option<i64>,
}

pub struct AbsorptionDetector {
    window_ms: i64,
    min_agg_volume: Qty,
    absorption_threshold: f64,
    max_absorption_ratio: f64,
    min_passive_multiplier: f64,
    price_efficiency_threshold: f64,
    zone_ticks: i64,
    event_cooldown_ms: i64,
    spread_impact_threshold: f64,
    velocity_increase_threshold: f64,
    recent_trade_count: usize,
    zones: HashMap<Ticks, ZoneState>,
}

impl AbsorptionDetector {
    pub fn new(cfg: &AbsorptionConfig) -> Self {
        Self {
            window_ms: cfg.window_ms,
            min_agg_volume: decimal_to_scaled(cfg.min_agg_volume).unwrap_or(i64::MAX),
            absorption_threshold: cfg.absorption_threshold,
            max_absorption_ratio: cfg.max_absorption_ratio,
            min_passive_multiplier: cfg.min_passive_multiplier,
            price_efficiency_threshold: cfg.price_efficiency_threshold,
            zone_ticks: cfg.zone_ticks,
            event_cooldown_ms: cfg.event_cooldown_ms,
            spread_impact_threshold: cfg.spread_impact_threshold,
            velocity_increase_threshold: cfg.velocity_increase_threshold,
            recent_trade_count: cfg.recent_trade_count,
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
        while let Some(&(ts, _)) = state.passive_history.front() {
            if now_ms - ts > window_ms {
                state.passive_history.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(ts, _)) = state.volume_history.front() {
            if now_ms - ts > window_ms * 4 {
                state.volume_history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fractional price range over the most recent trades.
    fn price_range_fraction(state: &ZoneState, recent: usize) -> f64 {
        let trades: Vec<&TradeObs> = state.trades.iter().rev().take(recent).collect();
        if trades.is_empty() {
            return 0.0;
        }
        let min = trades.iter().map(|t| t.price_ticks).min().unwrap_or(0);
        let max = trades.iter().map(|t| t.price_ticks).max().unwrap_or(0);
        if min <= 0 {
            return 0.0;
        }
        (max - min) as f64 / min as f64
    }

    /// Second-half vs first-half trade-count ratio over the window.
    fn velocity_ratio(state: &ZoneState) -> f64 {
        let n = state.trades.len();
        if n < 2 {
            return 1.0;
        }
        let first = (n / 2).max(1);
        let second = n - first;
        second as f64 / first as f64
    }
}

impl Detector for AbsorptionDetector {
    fn name(&self) -> &'static str {
        "absorption"
    }

    fn on_trade(
        &mut self,
        trade: &EnrichedTrade,
        _ctx: &mut DetectorContext<'_>,
    ) -> Result<Vec<SignalCandidate>, DetectorError> {
        let now_ms = trade.ts_ms();
        let key = zone_key(trade.price_ticks(), self.zone_ticks);
        let state = self.zones.entry(key).or_default();

        Self::evict(state, now_ms, self.window_ms);
        state.trades.push_back(TradeObs {
            ts_ms: now_ms,
            price_ticks: trade.price_ticks(),
            qty: trade.qty(),
            side: trade.aggressor_side(),
        });
        match trade.aggressor_side() {
            Side::Buy => state.buy_volume += trade.qty(),
            Side::Sell => state.sell_volume += trade.qty(),
        }

        let (dominant_side, dominant_volume) = if state.buy_volume >= state.sell_volume {
            (Side::Buy, state.buy_volume)
        } else {
            (Side::Sell, state.sell_volume)
        };

        // The aggressor consumes the opposite book side; that is the
        // liquidity doing the absorbing.
        let passive_opposite = match dominant_side {
            Side::Buy => trade.zone_passive_ask_qty,
            Side::Sell => trade.zone_passive_bid_qty,
        };
        state.passive_history.push_back((now_ms, passive_opposite));

        // Volume gate is strict: a window exactly at the minimum does not
        // trigger.
        if dominant_volume <= self.min_agg_volume {
            return Ok(Vec::new());
        }

        if let Some(last) = state.last_emit_ms {
            if now_ms - last < self.event_cooldown_ms {
                return Ok(Vec::new());
            }
        }

        let range_fraction = Self::price_range_fraction(state, self.recent_trade_count);
        if range_fraction > self.price_efficiency_threshold {
            return Ok(Vec::new());
        }

        let absorption_ratio = div_guard(passive_opposite as f64, dominant_volume as f64);
        if absorption_ratio < self.absorption_threshold
            || absorption_ratio > self.max_absorption_ratio
        {
            return Ok(Vec::new());
        }

        let rolling_avg_passive = if state.passive_history.is_empty() {
            0.0
        } else {
            state
                .passive_history
                .iter()
                .map(|&(_, q)| q as f64)
                .sum::<f64>()
                / state.passive_history.len() as f64
        };
        let passive_multiplier = div_guard(passive_opposite as f64, rolling_avg_passive);
        if passive_multiplier < self.min_passive_multiplier {
            return Ok(Vec::new());
        }

        if let Some(bps) = trade.spread_bps() {
            if bps > self.spread_impact_threshold {
                return Ok(Vec::new());
            }
        }

        if Self::velocity_ratio(state) < self.velocity_increase_threshold {
            return Ok(Vec::new());
        }

        // Confidence: base 0.5 plus evidence boosts.
        let avg_window_volume = if state.volume_history.is_empty() {
            dominant_volume as f64
        } else {
            state
                .volume_history
                .iter()
                .map(|&(_, v)| v as f64)
                .sum::<f64>()
                / state.volume_history.len() as f64
        };
        let volume_boost = if dominant_volume as f64 > 3.0 * avg_window_volume {
            0.2
        } else {
            0.0
        };
        let price_stability = 1.0 - range_fraction;
        let stability_boost = if price_stability > 0.95 { 0.15 } else { 0.0 };
        let total = state.buy_volume + state.sell_volume;
        let flow_imbalance = div_guard((state.buy_volume - state.sell_volume) as f64, total as f64);
        let flow_boost = if flow_imbalance.abs() > 0.7 { 0.15 } else { 0.0 };
        let confidence = clamp01(0.5 + volume_boost + stability_boost + flow_boost);

        state.volume_history.push_back((now_ms, dominant_volume));
        state.last_emit_ms = Some(now_ms);

        debug!(
            correlation_id = %trade.correlation_id,
            zone = key,
            side = ?dominant_side,
            absorption_ratio,
            range_fraction,
            confidence,
            "absorption detected"
        );

        Ok(vec![SignalCandidate {
            id: Uuid::new_v4(),
            correlation_id: trade.correlation_id,
            signal_type: SignalType::Absorption,
            side: dominant_side,
            price_ticks: trade.price_ticks(),
            confidence,
            ts_ms: now_ms,
            payload: json!({
                "absorbingSide": dominant_side,
                "aggressiveSide": dominant_side,
                "absorbedSide": dominant_side.opposite(),
                "absorptionRatio": absorption_ratio,
                "priceRangePercent": range_fraction * 100.0,
                "rollingAggressiveVolume": dominant_volume,
                "passiveMultiplier": passive_multiplier,
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
