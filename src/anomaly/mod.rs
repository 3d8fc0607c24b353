//! Sliding-window market anomaly detection.
//!
//! Consumes the enriched trade stream plus best-quote updates and emits
//! deduplicated [`AnomalyEvent`]s: flash crashes, liquidity voids, feed
//! gaps, volatility bursts, order-flow and book imbalance, coarse
//! absorption/exhaustion, momentum ignition, icebergs, and order-size
//! outliers. Publishes the market-health verdict the signal coordinator
//! gates on.

mod spoofing;

pub use spoofing::{NullSpoofing, SpoofingDetector};

use crate::config::AnomalyConfig;
use crate::events::{
    AnomalyEvent, AnomalyType, EnrichedTrade, HealthMetrics, MarketHealth, RecommendedAction,
    Severity, Side,
};
use crate::fixed::{div_guard, spread_bps, P2Quantile, Qty, Ticks, WindowedStats};
use serde_json::json;
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Returns examined for the short-horizon volatility estimate.
const SHORT_VOL_RETURNS: usize = 16;

/// Coarse exhaustion: second-half flow under a quarter of the first half.
const EXHAUSTION_DECAY: f64 = 0.25;

#[derive(Debug, Default)]
struct IcebergTrack {
    consumption_ts: VecDeque<i64>,
}

pub struct AnomalyDetector {
    cfg: AnomalyConfig,
    prices: VecDeque<f64>,
    price_stats: WindowedStats,
    returns: VecDeque<f64>,
    returns_stats: WindowedStats,
    last_price_ticks: Option<Ticks>,
    last_trade_ts: Option<i64>,
    flow: VecDeque<(i64, Side, Qty)>,
    flow_buy: Qty,
    flow_sell: Qty,
    sizes: VecDeque<(i64, f64)>,
    size_stats: WindowedStats,
    size_median: P2Quantile,
    size_p90: P2Quantile,
    second_buckets: VecDeque<(i64, Qty)>,
    icebergs: HashMap<(Ticks, Side), IcebergTrack>,
    last_spread_bps: f64,
    last_emit: HashMap<AnomalyType, (i64, Severity)>,
    recent: VecDeque<(i64, AnomalyType, Severity, RecommendedAction)>,
    overload_marks: VecDeque<i64>,
    spoofing: Box<dyn SpoofingDetector>,
}

impl AnomalyDetector {
    pub fn new(cfg: &AnomalyConfig, spoofing: Box<dyn SpoofingDetector>) -> Self {
        Self {
            cfg: cfg.clone(),
            prices: VecDeque::new(),
            price_stats: WindowedStats::new(),
            returns: VecDeque::new(),
            returns_stats: WindowedStats::new(),
            last_price_ticks: None,
            last_trade_ts: None,
            flow: VecDeque::new(),
            flow_buy: 0,
            flow_sell: 0,
            sizes: VecDeque::new(),
            size_stats: WindowedStats::new(),
            size_median: P2Quantile::new(0.5),
            size_p90: P2Quantile::new(0.9),
            second_buckets: VecDeque::new(),
            icebergs: HashMap::new(),
            last_spread_bps: 0.0,
            last_emit: HashMap::new(),
            recent: VecDeque::new(),
            overload_marks: VecDeque::new(),
            spoofing,
        }
    }

    fn event(
        &mut self,
        anomaly_type: AnomalyType,
        severity: Severity,
        action: RecommendedAction,
        affected_range: (Ticks, Ticks),
        now_ms: i64,
        correlation_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> Option<AnomalyEvent> {
        if !self.gate_emit(anomaly_type, severity, action, now_ms) {
            return None;
        }
        debug!(anomaly_type = ?anomaly_type, severity = ?severity, "anomaly detected");
        Some(AnomalyEvent {
            id: Uuid::new_v4(),
            correlation_id,
            anomaly_type,
            severity,
            affected_range,
            detected_at_ms: now_ms,
            recommended_action: action,
            details,
        })
    }

    /// Per-type dedup: re-emit only after the cooldown, or immediately
    /// when severity escalates to critical.
    fn gate_emit(
        &mut self,
        anomaly_type: AnomalyType,
        severity: Severity,
        action: RecommendedAction,
        now_ms: i64,
    ) -> bool {
        let allowed = match self.last_emit.get(&anomaly_type) {
            None => true,
            Some(&(last_ts, last_sev)) => {
                now_ms - last_ts >= self.cfg.anomaly_cooldown_ms
                    || (severity == Severity::Critical && last_sev != Severity::Critical)
            }
        };
        if allowed {
            self.last_emit.insert(anomaly_type, (now_ms, severity));
            self.recent.push_back((now_ms, anomaly_type, severity, action));
            self.trim_recent(now_ms);
        }
        allowed
    }

    fn trim_recent(&mut self, now_ms: i64) {
        let horizon = self.cfg.health_window_ms;
        while let Some(&(ts, _, _, _)) = self.recent.front() {
            if now_ms - ts > horizon {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn trim_flow(&mut self, now_ms: i64) {
        while let Some(&(ts, side, qty)) = self.flow.front() {
            if now_ms - ts > self.cfg.flow_window_ms {
                self.flow.pop_front();
                match side {
                    Side::Buy => self.flow_buy -= qty,
                    Side::Sell => self.flow_sell -= qty,
                }
            } else {
                break;
            }
        }
    }

    fn flow_imbalance(&self) -> f64 {
        div_guard(
            (self.flow_buy - self.flow_sell) as f64,
            (self.flow_buy + self.flow_sell) as f64,
        )
    }

    /// Short-horizon return volatility over the most recent returns.
    fn short_volatility(&self) -> f64 {
        let n = self.returns.len().min(SHORT_VOL_RETURNS);
        if n < 2 {
            return 0.0;
        }
        let tail: Vec<f64> = self.returns.iter().rev().take(n).copied().collect();
        let mean = tail.iter().sum::<f64>() / n as f64;
        let var = tail.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n as f64;
        var.sqrt()
    }

    pub fn on_enriched_trade(&mut self, trade: &EnrichedTrade) -> Vec<AnomalyEvent> {
        let now_ms = trade.ts_ms();
        let price_ticks = trade.price_ticks();
        let price = price_ticks as f64;
        let corr = Some(trade.correlation_id);
        let mut events = Vec::new();

        // Feed gap, against the previous trade's arrival.
        if let Some(last_ts) = self.last_trade_ts {
            let gap = now_ms - last_ts;
            if gap > self.cfg.max_inter_trade_gap_ms {
                let severity = if gap > 3 * self.cfg.max_inter_trade_gap_ms {
                    Severity::Medium
                } else {
                    Severity::Info
                };
                if let Some(e) = self.event(
                    AnomalyType::ApiGap,
                    severity,
                    RecommendedAction::Continue,
                    (price_ticks, price_ticks),
                    now_ms,
                    corr,
                    json!({ "gapMs": gap }),
                ) {
                    events.push(e);
                }
            }
        }
        self.last_trade_ts = Some(now_ms);

        // Flash crash: price z-score against the observation window,
        // evaluated before this trade joins the window.
        if self.prices.len() >= self.cfg.min_history {
            let z = self.price_stats.z_score(price);
            if z <= -self.cfg.flash_crash_z_score {
                let severity = if z <= -2.0 * self.cfg.flash_crash_z_score {
                    Severity::Critical
                } else {
                    Severity::High
                };
                if let Some(e) = self.event(
                    AnomalyType::FlashCrash,
                    severity,
                    RecommendedAction::ClosePositions,
                    (price_ticks, self.price_stats.mean() as Ticks),
                    now_ms,
                    corr,
                    json!({ "zScore": z, "windowMean": self.price_stats.mean() }),
                ) {
                    events.push(e);
                }
            }
        }

        // Liquidity void from the trade's own book context.
        if let Some(bps) = trade.spread_bps() {
            self.last_spread_bps = bps;
            if bps > self.cfg.liquidity_void_spread_multiplier * self.cfg.normal_spread_bps {
                if let Some(e) = self.event(
                    AnomalyType::LiquidityVoid,
                    Severity::High,
                    RecommendedAction::Pause,
                    (
                        trade.best_bid.unwrap_or(price_ticks),
                        trade.best_ask.unwrap_or(price_ticks),
                    ),
                    now_ms,
                    corr,
                    json!({ "spreadBps": bps, "normalSpreadBps": self.cfg.normal_spread_bps }),
                ) {
                    events.push(e);
                }
            }
        }

        // Volatility burst: short-horizon stdev against the long window.
        if let Some(last_ticks) = self.last_price_ticks {
            if last_ticks > 0 {
                let ret = (price_ticks - last_ticks) as f64 / last_ticks as f64;
                self.returns.push_back(ret);
                self.returns_stats.push(ret);
                while self.returns.len() > self.cfg.window_size {
                    if let Some(old) = self.returns.pop_front() {
                        self.returns_stats.pop(old);
                    }
                }
                if self.returns.len() >= self.cfg.min_history {
                    let long = self.returns_stats.std_dev();
                    let short = self.short_volatility();
                    if long > 0.0 && short > self.cfg.volatility_ratio_threshold * long {
                        if let Some(e) = self.event(
                            AnomalyType::ExtremeVolatility,
                            Severity::High,
                            RecommendedAction::ReduceSize,
                            (price_ticks, price_ticks),
                            now_ms,
                            corr,
                            json!({ "shortStd": short, "longStd": long }),
                        ) {
                            events.push(e);
                        }
                    }
                }
            }
        }
        self.last_price_ticks = Some(price_ticks);

        // Flow imbalance over the flow window.
        self.trim_flow(now_ms);
        self.flow.push_back((now_ms, trade.aggressor_side(), trade.qty()));
        match trade.aggressor_side() {
            Side::Buy => self.flow_buy += trade.qty(),
            Side::Sell => self.flow_sell += trade.qty(),
        }
        if self.flow.len() >= self.cfg.min_history.min(32) {
            let imbalance = self.flow_imbalance();
            if imbalance.abs() > self.cfg.volume_imbalance_threshold {
                if let Some(e) = self.event(
                    AnomalyType::FlowImbalance,
                    Severity::Medium,
                    RecommendedAction::ReduceSize,
                    (price_ticks, price_ticks),
                    now_ms,
                    corr,
                    json!({ "imbalance": imbalance }),
                ) {
                    events.push(e);
                }
            }

            // Coarse absorption: passive wall dwarfing recent flow.
            let flow_total = self.flow_buy + self.flow_sell;
            let passive_total = trade.zone_passive_bid_qty + trade.zone_passive_ask_qty;
            if flow_total > 0 {
                let ratio = passive_total as f64 / flow_total as f64;
                if ratio > self.cfg.absorption_ratio_threshold {
                    if let Some(e) = self.event(
                        AnomalyType::Absorption,
                        Severity::Info,
                        RecommendedAction::Continue,
                        (price_ticks, price_ticks),
                        now_ms,
                        corr,
                        json!({ "passiveToFlowRatio": ratio }),
                    ) {
                        events.push(e);
                    }
                }

                // Coarse exhaustion: flow drying up across the window.
                let mid_ts = now_ms - self.cfg.flow_window_ms / 2;
                let first: Qty = self
                    .flow
                    .iter()
                    .filter(|&&(ts, _, _)| ts < mid_ts)
                    .map(|&(_, _, q)| q)
                    .sum();
                let second: Qty = flow_total - first;
                if first > 0 && (second as f64) < EXHAUSTION_DECAY * first as f64 {
                    if let Some(e) = self.event(
                        AnomalyType::Exhaustion,
                        Severity::Info,
                        RecommendedAction::Continue,
                        (price_ticks, price_ticks),
                        now_ms,
                        corr,
                        json!({ "firstHalf": first, "secondHalf": second }),
                    ) {
                        events.push(e);
                    }
                }
            }
        }

        // Momentum ignition: last full second against the baseline.
        let sec = now_ms / 1_000;
        let same_second = matches!(self.second_buckets.back(), Some(&(s, _)) if s == sec);
        if same_second {
            if let Some((_, vol)) = self.second_buckets.back_mut() {
                *vol += trade.qty();
            }
        } else {
            if self.second_buckets.len() >= 4 {
                let (_, last_full) = self.second_buckets[self.second_buckets.len() - 1];
                let baseline: Qty = self
                    .second_buckets
                    .iter()
                    .take(self.second_buckets.len() - 1)
                    .map(|&(_, v)| v)
                    .sum();
                let avg = baseline as f64 / (self.second_buckets.len() - 1) as f64;
                if avg > 0.0 && last_full as f64 > self.cfg.momentum_surge_multiplier * avg {
                    if let Some(e) = self.event(
                        AnomalyType::MomentumIgnition,
                        Severity::High,
                        RecommendedAction::ReduceSize,
                        (price_ticks, price_ticks),
                        now_ms,
                        corr,
                        json!({ "secondVolume": last_full, "baselinePerSecond": avg }),
                    ) {
                        events.push(e);
                    }
                }
            }
            self.second_buckets.push_back((sec, trade.qty()));
            let horizon_secs = (self.cfg.flow_window_ms / 1_000).max(8);
            while let Some(&(s, _)) = self.second_buckets.front() {
                if sec - s > horizon_secs {
                    self.second_buckets.pop_front();
                } else {
                    break;
                }
            }
        }

        // Iceberg: repeated consumption of a level that keeps refilling,
        // with low variance in the refill intervals.
        let consumed_side = trade.aggressor_side().opposite();
        let level_passive = match trade.aggressor_side() {
            Side::Buy => trade.passive_ask_qty,
            Side::Sell => trade.passive_bid_qty,
        };
        if level_passive >= trade.qty() && trade.qty() > 0 {
            let track = self
                .icebergs
                .entry((price_ticks, consumed_side))
                .or_default();
            while let Some(&front) = track.consumption_ts.front() {
                if now_ms - front > self.cfg.iceberg_detection_window_ms {
                    track.consumption_ts.pop_front();
                } else {
                    break;
                }
            }
            track.consumption_ts.push_back(now_ms);
            if track.consumption_ts.len() > self.cfg.iceberg_min_refills {
                let intervals: Vec<f64> = track
                    .consumption_ts
                    .iter()
                    .zip(track.consumption_ts.iter().skip(1))
                    .map(|(a, b)| (b - a) as f64)
                    .collect();
                let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
                if mean > 0.0 {
                    let var = intervals
                        .iter()
                        .map(|v| (v - mean) * (v - mean))
                        .sum::<f64>()
                        / intervals.len() as f64;
                    let consistency = (1.0 - var.sqrt() / mean).max(0.0);
                    if consistency >= self.cfg.iceberg_min_consistency {
                        let refills = track.consumption_ts.len();
                        if let Some(e) = self.event(
                            AnomalyType::IcebergOrder,
                            Severity::Medium,
                            RecommendedAction::Continue,
                            (price_ticks, price_ticks),
                            now_ms,
                            corr,
                            json!({
                                "refillConsistency": consistency,
                                "refillCount": refills,
                                "meanRefillIntervalMs": mean,
                                "side": consumed_side,
                            }),
                        ) {
                            events.push(e);
                        }
                    }
                }
            }
        }

        // Order-size outlier against the rolling size distribution,
        // evaluated before this trade joins it.
        let qty_f = trade.qty() as f64;
        if self.sizes.len() >= self.cfg.min_history {
            let z = self.size_stats.z_score(qty_f);
            if z > self.cfg.order_size_anomaly_threshold_sigma {
                let severity = if z > 2.0 * self.cfg.order_size_anomaly_threshold_sigma {
                    Severity::High
                } else {
                    Severity::Medium
                };
                let confidence = Normal::new(0.0, 1.0)
                    .map(|n| n.cdf(z))
                    .unwrap_or(1.0);
                if let Some(e) = self.event(
                    AnomalyType::OrderSizeAnomaly,
                    severity,
                    RecommendedAction::ReduceSize,
                    (price_ticks, price_ticks),
                    now_ms,
                    corr,
                    json!({
                        "zScore": z,
                        "confidence": confidence,
                        "medianSize": self.size_median.value(),
                        "p90Size": self.size_p90.value(),
                    }),
                ) {
                    events.push(e);
                }
            }
        }
        self.sizes.push_back((now_ms, qty_f));
        self.size_stats.push(qty_f);
        self.size_median.push(qty_f);
        self.size_p90.push(qty_f);
        while let Some(&(ts, v)) = self.sizes.front() {
            if now_ms - ts > self.cfg.order_size_window_ms {
                self.sizes.pop_front();
                self.size_stats.pop(v);
            } else {
                break;
            }
        }

        // Finally admit the price into the sliding window.
        self.prices.push_back(price);
        self.price_stats.push(price);
        while self.prices.len() > self.cfg.window_size {
            if let Some(old) = self.prices.pop_front() {
                self.price_stats.pop(old);
            }
        }

        events
    }

    /// Best-quote update: book imbalance plus the spoofing collaborator.
    pub fn update_best_quotes(
        &mut self,
        bid_ticks: Ticks,
        bid_qty: Qty,
        ask_ticks: Ticks,
        ask_qty: Qty,
        now_ms: i64,
    ) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();
        self.last_spread_bps = spread_bps(bid_ticks, ask_ticks);

        let imbalance = div_guard((bid_qty - ask_qty) as f64, (bid_qty + ask_qty) as f64);
        if imbalance.abs() > self.cfg.volume_imbalance_threshold {
            if let Some(e) = self.event(
                AnomalyType::OrderbookImbalance,
                Severity::Medium,
                RecommendedAction::ReduceSize,
                (bid_ticks, ask_ticks),
                now_ms,
                None,
                json!({ "imbalance": imbalance, "bidQty": bid_qty, "askQty": ask_qty }),
            ) {
                events.push(e);
            }
        }

        if let Some(spoof) = self
            .spoofing
            .on_quote_update(bid_ticks, bid_qty, ask_ticks, ask_qty, now_ms)
        {
            if self.gate_emit(
                AnomalyType::Spoofing,
                spoof.severity,
                spoof.recommended_action,
                now_ms,
            ) {
                events.push(spoof);
            }
        }

        events
    }

    /// Ingress overload marks from the pipeline; a sustained burst emits a
    /// processing-overload anomaly.
    pub fn note_overload(&mut self, now_ms: i64, marks: u64) -> Option<AnomalyEvent> {
        for _ in 0..marks {
            self.overload_marks.push_back(now_ms);
        }
        while let Some(&ts) = self.overload_marks.front() {
            if now_ms - ts > self.cfg.anomaly_cooldown_ms.max(10_000) {
                self.overload_marks.pop_front();
            } else {
                break;
            }
        }
        if marks > 0 {
            let count = self.overload_marks.len();
            return self.event(
                AnomalyType::ProcessingOverload,
                Severity::High,
                RecommendedAction::ReduceSize,
                (0, 0),
                now_ms,
                None,
                json!({ "overloadMarks": count }),
            );
        }
        None
    }

    /// Market-health verdict over the recent anomaly horizon.
    pub fn market_health(&self, now_ms: i64) -> MarketHealth {
        let horizon = self.cfg.health_window_ms;
        let recent: Vec<_> = self
            .recent
            .iter()
            .filter(|&&(ts, _, _, _)| now_ms - ts <= horizon)
            .collect();
        let highest = recent.iter().map(|&&(_, _, sev, _)| sev).max();
        let recommendation = recent
            .iter()
            .map(|&&(_, _, _, action)| action)
            .fold(RecommendedAction::Continue, RecommendedAction::max);
        let is_healthy = !matches!(highest, Some(Severity::High) | Some(Severity::Critical));

        MarketHealth {
            is_healthy,
            recent_anomaly_count: recent.len(),
            highest_severity: highest,
            recommendation,
            metrics: HealthMetrics {
                spread_bps: self.last_spread_bps,
                flow_imbalance: self.flow_imbalance(),
                volatility: self.short_volatility(),
            },
        }
    }

    /// Idempotent periodic cleanup.
    pub fn cleanup(&mut self, now_ms: i64) {
        self.trim_recent(now_ms);
        self.trim_flow(now_ms);
        let window = self.cfg.iceberg_detection_window_ms;
        self.icebergs.retain(|_, t| {
            t.consumption_ts
                .back()
                .map_or(false, |&ts| now_ms - ts <= window)
        });
        self.spoofing.cleanup(now_ms);
    }
}
