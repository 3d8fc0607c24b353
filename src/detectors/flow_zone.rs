//! Shared candidate-tracking core for the accumulation and distribution
//! detectors.
//!
//! Both detectors watch for sustained one-sided flow absorbed inside a
//! narrow price band. Candidates accumulate per zone bucket; once the
//! duration, volume, trade-count, and side-ratio gates all hold, the
//! candidate is promoted into a [`crate::zones::TradingZone`] (or merged
//! into a nearby active zone). Signals are emitted exactly once per
//! zone-state transition, with the transition kind recorded in the
//! payload.

use super::DetectorContext;
use crate::error::DetectorError;
use crate::events::{EnrichedTrade, Side, SignalCandidate, SignalType};
use crate::fixed::{clamp01, div_guard, qty_ratio, zone_key, Qty, Ticks};
use crate::zones::{
    OrderSizeProfile, PriceRange, SupportingFactors, TradingZone, ZoneDetection, ZoneType,
    ZoneUpdateType,
};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub(super) struct FlowZoneParams {
    pub zone_type: ZoneType,
    pub window_ms: i64,
    pub min_duration_ms: i64,
    pub zone_size_ticks: i64,
    pub min_ratio: f64,
    pub min_recent_activity_ms: i64,
    pub min_agg_volume: Qty,
    pub track_side: bool,
    pub min_side_ratio: f64,
    pub min_zone_volume: Qty,
    pub min_trade_count: u64,
    pub min_zone_strength: f64,
    pub max_price_deviation_ticks: i64,
}

impl FlowZoneParams {
    fn signal_side(&self) -> Side {
        match self.zone_type {
            ZoneType::Accumulation => Side::Buy,
            ZoneType::Distribution => Side::Sell,
        }
    }

    fn signal_type(&self) -> SignalType {
        match self.zone_type {
            ZoneType::Accumulation => SignalType::Accumulation,
            ZoneType::Distribution => SignalType::Distribution,
        }
    }

    /// The aggressive side whose flow defines this zone type: sellers
    /// hitting bids for accumulation, buyers lifting offers for
    /// distribution.
    fn tracked_volume(&self, c: &Candidate) -> Qty {
        match self.zone_type {
            ZoneType::Accumulation => c.sell_volume,
            ZoneType::Distribution => c.buy_volume,
        }
    }

    fn absorbing_passive(&self, trade: &EnrichedTrade) -> Qty {
        match self.zone_type {
            ZoneType::Accumulation => trade.zone_passive_bid_qty,
            ZoneType::Distribution => trade.zone_passive_ask_qty,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CandTrade {
    ts_ms: i64,
    price_ticks: Ticks,
    qty: Qty,
    side: Side,
}

#[derive(Debug, Default)]
struct Candidate {
    trades: VecDeque<CandTrade>,
    buy_volume: Qty,
    sell_volume: Qty,
    min_ticks: Ticks,
    max_ticks: Ticks,
    /// Set once the candidate has been promoted into (or merged with) a
    /// zone; subsequent trades feed the zone directly.
    zone_id: Option<Uuid>,
}

impl Candidate {
    fn total_volume(&self) -> Qty {
        self.buy_volume + self.sell_volume
    }

    fn duration_ms(&self) -> i64 {
        match (self.trades.front(), self.trades.back()) {
            (Some(f), Some(b)) => b.ts_ms - f.ts_ms,
            _ => 0,
        }
    }

    fn push(&mut self, t: CandTrade, window_ms: i64) {
        let mut boundary_evicted = false;
        while let Some(front) = self.trades.front() {
            if t.ts_ms - front.ts_ms > window_ms {
                let gone = self.trades.pop_front().expect("front checked");
                match gone.side {
                    Side::Buy => self.buy_volume -= gone.qty,
                    Side::Sell => self.sell_volume -= gone.qty,
                }
                if gone.price_ticks == self.min_ticks || gone.price_ticks == self.max_ticks {
                    boundary_evicted = true;
                }
            } else {
                break;
            }
        }
        match t.side {
            Side::Buy => self.buy_volume += t.qty,
            Side::Sell => self.sell_volume += t.qty,
        }
        self.trades.push_back(t);
        if boundary_evicted || self.trades.len() == 1 {
            self.min_ticks = self.trades.iter().map(|x| x.price_ticks).min().unwrap_or(0);
            self.max_ticks = self.trades.iter().map(|x| x.price_ticks).max().unwrap_or(0);
        } else {
            self.min_ticks = self.min_ticks.min(t.price_ticks);
            self.max_ticks = self.max_ticks.max(t.price_ticks);
        }
    }

    /// Coefficient-of-variation based regularity of inter-trade gaps.
    fn time_consistency(&self) -> f64 {
        if self.trades.len() < 3 {
            return 0.5;
        }
        let gaps: Vec<f64> = self
            .trades
            .iter()
            .zip(self.trades.iter().skip(1))
            .map(|(a, b)| (b.ts_ms - a.ts_ms) as f64)
            .collect();
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        if mean <= 0.0 {
            return 0.5;
        }
        let var = gaps.iter().map(|g| (g - mean) * (g - mean)).sum::<f64>() / gaps.len() as f64;
        clamp01(1.0 - (var.sqrt() / mean).min(1.0))
    }

    fn reset_buffer(&mut self) {
        self.trades.clear();
        self.buy_volume = 0;
        self.sell_volume = 0;
    }
}

fn build_detection(params: &FlowZoneParams, c: &Candidate) -> ZoneDetection {
    let total = c.total_volume();
    let count = c.trades.len() as u64;
    let width = c.max_ticks - c.min_ticks;
    let center = (c.min_ticks + c.max_ticks) / 2;
    let avg_order = if count > 0 { total / count as i64 } else { 0 };

    // Order-size profile relative to the configured zone scale.
    let base = params.min_zone_volume / params.min_trade_count.max(1) as i64;
    let order_size_profile = if avg_order >= base * 2 {
        OrderSizeProfile::Institutional
    } else if avg_order * 2 >= base {
        OrderSizeProfile::Mixed
    } else {
        OrderSizeProfile::Retail
    };

    ZoneDetection {
        price_range: PriceRange::new(c.min_ticks, c.max_ticks),
        started_at_ms: c.trades.front().map(|t| t.ts_ms).unwrap_or(0),
        total_volume: total,
        buy_volume: c.buy_volume,
        sell_volume: c.sell_volume,
        average_order_size: avg_order,
        trade_count: count,
        supporting_factors: SupportingFactors {
            volume_concentration: div_guard(
                params.zone_size_ticks as f64,
                (params.zone_size_ticks + width) as f64,
            ),
            order_size_profile,
            time_consistency: c.time_consistency(),
            price_stability: if center > 0 {
                (1.0 - width as f64 / center as f64).max(0.0)
            } else {
                0.0
            },
            flow_consistency: qty_ratio(params.tracked_volume(c), total),
        },
    }
}

fn make_signal(
    params: &FlowZoneParams,
    trade: &EnrichedTrade,
    zone: &TradingZone,
    transition: &'static str,
) -> SignalCandidate {
    SignalCandidate {
        id: Uuid::new_v4(),
        correlation_id: trade.correlation_id,
        signal_type: params.signal_type(),
        side: params.signal_side(),
        price_ticks: zone.price_range.center_ticks,
        confidence: zone.confidence,
        ts_ms: trade.ts_ms(),
        payload: json!({
            "transition": transition,
            "zoneId": zone.id,
            "strength": zone.strength,
            "completion": zone.completion,
            "significance": zone.significance,
            "zoneType": zone.zone_type,
        }),
    }
}

pub(super) struct FlowZoneTracker {
    params: FlowZoneParams,
    candidates: HashMap<Ticks, Candidate>,
}

impl FlowZoneTracker {
    pub(super) fn new(params: FlowZoneParams) -> Self {
        Self {
            params,
            candidates: HashMap::new(),
        }
    }

    pub(super) fn on_trade(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &mut DetectorContext<'_>,
    ) -> Result<Vec<SignalCandidate>, DetectorError> {
        let params = self.params;
        let now_ms = trade.ts_ms();
        let key = zone_key(trade.price_ticks(), params.zone_size_ticks);
        let candidate = self.candidates.entry(key).or_default();
        candidate.push(
            CandTrade {
                ts_ms: now_ms,
                price_ticks: trade.price_ticks(),
                qty: trade.qty(),
                side: trade.aggressor_side(),
            },
            params.window_ms,
        );

        // Route trades for already-promoted candidates into their zone and
        // translate lifecycle transitions into signals.
        if let Some(zone_id) = candidate.zone_id {
            let Some(update) = ctx.zones.update_zone(zone_id, trade) else {
                // Zone completed, expired, or was replaced since.
                candidate.zone_id = None;
                return Ok(Vec::new());
            };
            let mut signals = Vec::new();
            match update.update_type {
                ZoneUpdateType::Strengthened
                    if update.zone.strength >= params.min_zone_strength =>
                {
                    signals.push(make_signal(&params, trade, &update.zone, "strengthened"));
                }
                ZoneUpdateType::Completed => {
                    signals.push(make_signal(&params, trade, &update.zone, "completed"));
                    candidate.zone_id = None;
                }
                _ => {}
            }
            ctx.zone_updates.push(update);
            return Ok(signals);
        }

        // Promotion gates.
        if candidate.duration_ms() < params.min_duration_ms {
            return Ok(Vec::new());
        }
        let total = candidate.total_volume();
        if total < params.min_agg_volume || total < params.min_zone_volume {
            return Ok(Vec::new());
        }
        if (candidate.trades.len() as u64) < params.min_trade_count {
            return Ok(Vec::new());
        }
        if params.track_side {
            let side_ratio = qty_ratio(params.tracked_volume(candidate), total);
            if side_ratio < params.min_side_ratio {
                return Ok(Vec::new());
            }
        }
        let passive = params.absorbing_passive(trade);
        if div_guard(passive as f64, total as f64) < params.min_ratio {
            return Ok(Vec::new());
        }

        let detection = build_detection(&params, candidate);
        let mut signals = Vec::new();

        // Overlapping or adjacent candidates merge into the existing zone
        // instead of spawning a duplicate.
        if let Some(existing) = ctx.zones.find_nearby(
            params.zone_type,
            detection.price_range.center_ticks,
            params.max_price_deviation_ticks,
        ) {
            match ctx.zones.merge_candidate(existing, &detection, now_ms) {
                Some(update) => {
                    candidate.zone_id = Some(existing);
                    candidate.reset_buffer();
                    ctx.zone_updates.push(update);
                }
                // Merge failure is logged, never propagated.
                None => warn!(zone_id = %existing, "merge target vanished"),
            }
            return Ok(signals);
        }

        let updates = ctx.zones.create_zone(params.zone_type, &detection, now_ms);
        for update in updates {
            if update.update_type == ZoneUpdateType::Created {
                candidate.zone_id = Some(update.zone_id);
                candidate.reset_buffer();
                if update.zone.strength >= params.min_zone_strength {
                    signals.push(make_signal(&params, trade, &update.zone, "created"));
                } else {
                    debug!(
                        zone_id = %update.zone_id,
                        strength = update.zone.strength,
                        "zone created below signal strength"
                    );
                }
            }
            ctx.zone_updates.push(update);
        }
        Ok(signals)
    }

    pub(super) fn cleanup(&mut self, now_ms: i64) {
        let horizon = self.params.window_ms.max(self.params.min_recent_activity_ms);
        self.candidates.retain(|_, c| {
            c.zone_id.is_some()
                || c.trades
                    .back()
                    .map_or(false, |t| now_ms - t.ts_ms <= horizon)
        });
    }
}
