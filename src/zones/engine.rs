//! Zone lifecycle management.

use super::{
    PriceRange, Significance, StrengthSample, SupportingFactors, TradingZone, ZoneDetection,
    ZoneEndReason, ZoneQuery, ZoneType, ZoneUpdate, ZoneUpdateType,
};
use crate::config::ZoneEngineConfig;
use crate::events::{EnrichedTrade, Side};
use crate::fixed::{clamp01, decimal_to_scaled, qty_to_f64, Qty, RunningStats, Ticks};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

/// Bound on per-zone strength history retained in memory.
const STRENGTH_HISTORY_CAP: usize = 256;

#[derive(Debug, Clone)]
struct ResolvedZoneCfg {
    max_active_zones: usize,
    zone_timeout_ms: i64,
    strength_change_threshold: f64,
    completion_threshold: f64,
    history_retention_ms: i64,
    max_history: usize,
    expected_volume: [Qty; 4],
    expected_time_accumulation: [i64; 4],
    expected_time_distribution: [i64; 4],
    strength_volume_ref: Qty,
    strength_time_ref_ms: i64,
    confidence_time_ref_ms: i64,
    merge_tolerance_ticks: i64,
}

fn sig_index(s: Significance) -> usize {
    match s {
        Significance::Minor => 0,
        Significance::Moderate => 1,
        Significance::Major => 2,
        Significance::Institutional => 3,
    }
}

/// Aggregate statistics snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStats {
    pub active_count: usize,
    pub completed_count: usize,
    pub avg_strength: f64,
    pub avg_duration_ms: f64,
    pub accumulation_count: usize,
    pub distribution_count: usize,
    pub minor_count: usize,
    pub moderate_count: usize,
    pub major_count: usize,
    pub institutional_count: usize,
}

pub struct ZoneEngine {
    cfg: ResolvedZoneCfg,
    symbol: String,
    active: HashMap<Uuid, TradingZone>,
    history: VecDeque<TradingZone>,
}

impl ZoneEngine {
    pub fn new(cfg: &ZoneEngineConfig, symbol: String) -> Self {
        let ev = &cfg.expected_volume_by_significance;
        let ta = &cfg.expected_time_by_significance_by_type.accumulation;
        let td = &cfg.expected_time_by_significance_by_type.distribution;
        let resolved = ResolvedZoneCfg {
            max_active_zones: cfg.max_active_zones,
            zone_timeout_ms: cfg.zone_timeout_ms,
            strength_change_threshold: cfg.strength_change_threshold,
            completion_threshold: cfg.completion_threshold,
            history_retention_ms: cfg.history_retention_ms,
            max_history: cfg.max_history_per_symbol,
            expected_volume: [
                decimal_to_scaled(ev.minor).unwrap_or(1),
                decimal_to_scaled(ev.moderate).unwrap_or(1),
                decimal_to_scaled(ev.major).unwrap_or(1),
                decimal_to_scaled(ev.institutional).unwrap_or(1),
            ],
            expected_time_accumulation: [ta.minor, ta.moderate, ta.major, ta.institutional],
            expected_time_distribution: [td.minor, td.moderate, td.major, td.institutional],
            strength_volume_ref: decimal_to_scaled(cfg.strength_volume_ref).unwrap_or(1),
            strength_time_ref_ms: cfg.strength_time_ref_ms,
            confidence_time_ref_ms: cfg.confidence_time_ref_ms,
            merge_tolerance_ticks: cfg.merge_tolerance_ticks,
        };
        Self {
            cfg: resolved,
            symbol,
            active: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get(&self, id: Uuid) -> Option<&TradingZone> {
        self.active.get(&id)
    }

    /// Largest significance class whose expected volume the zone has at
    /// least quarter-filled.
    fn classify_significance(&self, total_volume: Qty) -> Significance {
        let v = total_volume;
        let ev = &self.cfg.expected_volume;
        if v * 4 >= ev[3] {
            Significance::Institutional
        } else if v * 4 >= ev[2] {
            Significance::Major
        } else if v * 4 >= ev[1] {
            Significance::Moderate
        } else {
            Significance::Minor
        }
    }

    fn expected_time_ms(&self, zone_type: ZoneType, sig: Significance) -> i64 {
        match zone_type {
            ZoneType::Accumulation => self.cfg.expected_time_accumulation[sig_index(sig)],
            ZoneType::Distribution => self.cfg.expected_time_distribution[sig_index(sig)],
        }
    }

    fn compute_strength(&self, zone: &TradingZone) -> f64 {
        let volume_strength =
            (zone.total_volume as f64 / self.cfg.strength_volume_ref as f64).min(1.0);
        let time_strength =
            (zone.time_in_zone_ms as f64 / self.cfg.strength_time_ref_ms as f64).min(1.0);
        let stability_strength = if zone.price_range.center_ticks > 0 {
            (1.0 - zone.price_range.width_ticks as f64 / zone.price_range.center_ticks as f64)
                .max(0.0)
        } else {
            0.0
        };
        let flow_strength = zone.supporting_factors.flow_consistency;
        let profile_strength = zone.supporting_factors.order_size_profile.strength_weight();

        clamp01(
            0.25 * volume_strength
                + 0.20 * time_strength
                + 0.20 * stability_strength
                + 0.20 * flow_strength
                + 0.15 * profile_strength,
        )
    }

    fn compute_completion(&self, zone: &TradingZone) -> f64 {
        let expected_volume = self.cfg.expected_volume[sig_index(zone.significance)];
        let expected_time = self.expected_time_ms(zone.zone_type, zone.significance);
        let by_volume = (zone.total_volume as f64 / expected_volume as f64).min(1.0);
        let by_time = (zone.time_in_zone_ms as f64 / expected_time.max(1) as f64).min(1.0);
        by_volume.max(by_time)
    }

    fn compute_confidence(&self, zone: &TradingZone) -> f64 {
        let duration_bonus = (zone.time_in_zone_ms as f64
            / self.cfg.confidence_time_ref_ms as f64)
            .min(0.2);
        clamp01(zone.supporting_factors.mean() + duration_bonus)
    }

    fn rescore(&self, zone: &mut TradingZone) {
        zone.significance = self.classify_significance(zone.total_volume);
        zone.strength = self.compute_strength(zone);
        zone.completion = self.compute_completion(zone);
        zone.confidence = self.compute_confidence(zone);
        let seconds = (zone.time_in_zone_ms as f64 / 1000.0).max(1.0);
        zone.intensity = qty_to_f64(zone.total_volume) / seconds;
    }

    fn push_strength_sample(zone: &mut TradingZone, ts_ms: i64) {
        // Forward-monotone history: never record an earlier timestamp than
        // the last sample.
        let ts_ms = zone
            .strength_history
            .last()
            .map(|s| s.ts_ms.max(ts_ms))
            .unwrap_or(ts_ms);
        zone.strength_history.push(StrengthSample {
            ts_ms,
            strength: zone.strength,
        });
        if zone.strength_history.len() > STRENGTH_HISTORY_CAP {
            let drop = zone.strength_history.len() - STRENGTH_HISTORY_CAP;
            zone.strength_history.drain(..drop);
        }
    }

    /// Create a zone from a promoted candidate. Returns the displaced
    /// zone's update (when the active cap forced a replacement) followed by
    /// the creation update.
    pub fn create_zone(
        &mut self,
        zone_type: ZoneType,
        detection: &ZoneDetection,
        now_ms: i64,
    ) -> Vec<ZoneUpdate> {
        let mut updates = Vec::with_capacity(2);

        if self.active.len() >= self.cfg.max_active_zones {
            // Deterministic weakest pick: min strength, ties by id.
            let weakest = self
                .active
                .values()
                .min_by(|a, b| {
                    a.strength
                        .partial_cmp(&b.strength)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.id.cmp(&b.id))
                })
                .map(|z| z.id);
            if let Some(id) = weakest {
                if let Some(update) =
                    self.close_zone(id, ZoneEndReason::ReplacedByStrongerZone, now_ms)
                {
                    updates.push(update);
                }
            }
        }

        let start_time_ms = detection.started_at_ms.min(now_ms);
        let mut zone = TradingZone {
            id: Uuid::new_v4(),
            zone_type,
            symbol: self.symbol.clone(),
            price_range: detection.price_range,
            start_time_ms,
            end_time_ms: None,
            total_volume: detection.total_volume,
            buy_volume: detection.buy_volume,
            sell_volume: detection.sell_volume,
            average_order_size: detection.average_order_size,
            trade_count: detection.trade_count,
            time_in_zone_ms: now_ms - start_time_ms,
            intensity: 0.0,
            strength: 0.0,
            completion: 0.0,
            confidence: 0.0,
            significance: Significance::Minor,
            is_active: true,
            last_update_ms: now_ms,
            strength_history: Vec::new(),
            supporting_factors: detection.supporting_factors,
            end_reason: None,
            gap_stats: RunningStats::new(),
            prev_trade_ts_ms: now_ms,
        };
        self.rescore(&mut zone);
        Self::push_strength_sample(&mut zone, now_ms);

        info!(
            zone_id = %zone.id,
            zone_type = ?zone_type,
            center_ticks = zone.price_range.center_ticks,
            strength = zone.strength,
            significance = ?zone.significance,
            "zone created"
        );

        let update = ZoneUpdate {
            zone_id: zone.id,
            update_type: ZoneUpdateType::Created,
            ts_ms: now_ms,
            zone: zone.clone(),
        };
        self.active.insert(zone.id, zone);
        updates.push(update);
        updates
    }

    /// Feed one trade into an active zone and classify the state change.
    pub fn update_zone(&mut self, id: Uuid, trade: &EnrichedTrade) -> Option<ZoneUpdate> {
        let now_ms = trade.ts_ms();
        let zone = self.active.get_mut(&id)?;

        let prev_strength = zone.strength;

        zone.total_volume += trade.qty();
        match trade.aggressor_side() {
            Side::Buy => zone.buy_volume += trade.qty(),
            Side::Sell => zone.sell_volume += trade.qty(),
        }
        zone.trade_count += 1;
        zone.average_order_size = zone.total_volume / zone.trade_count.max(1) as i64;
        zone.time_in_zone_ms = (now_ms - zone.start_time_ms).max(0);
        let gap = (now_ms - zone.prev_trade_ts_ms).max(0) as f64;
        zone.gap_stats.push(gap);
        zone.prev_trade_ts_ms = now_ms;
        zone.last_update_ms = now_ms;

        // Refresh evidence from accumulated totals.
        let dominant = match zone.zone_type {
            ZoneType::Accumulation => zone.sell_volume,
            ZoneType::Distribution => zone.buy_volume,
        };
        zone.supporting_factors.flow_consistency =
            crate::fixed::qty_ratio(dominant, zone.total_volume);
        zone.supporting_factors.price_stability = if zone.price_range.center_ticks > 0 {
            (1.0 - zone.price_range.width_ticks as f64 / zone.price_range.center_ticks as f64)
                .max(0.0)
        } else {
            0.0
        };
        let gap_mean = zone.gap_stats.mean();
        zone.supporting_factors.time_consistency = if gap_mean > 0.0 {
            clamp01(1.0 - (zone.gap_stats.std_dev() / gap_mean).min(1.0))
        } else {
            zone.supporting_factors.time_consistency
        };

        let zone_id = zone.id;
        let cfg_theta = self.cfg.strength_change_threshold;
        let cfg_complete = self.cfg.completion_threshold;

        // rescore needs &self access to config while zone borrowed; copy
        // the zone out of the borrow scope.
        let mut scored = zone.clone();
        self.rescore(&mut scored);
        Self::push_strength_sample(&mut scored, now_ms);

        let delta = scored.strength - prev_strength;
        let update_type = if scored.completion > cfg_complete && delta >= -cfg_theta {
            ZoneUpdateType::Completed
        } else if delta > cfg_theta {
            ZoneUpdateType::Strengthened
        } else if delta < -cfg_theta {
            ZoneUpdateType::Weakened
        } else {
            ZoneUpdateType::Updated
        };

        if update_type == ZoneUpdateType::Completed {
            scored.is_active = false;
            scored.end_time_ms = Some(now_ms);
            scored.end_reason = Some(ZoneEndReason::Completed);
            self.active.remove(&zone_id);
            self.push_history(scored.clone());
            info!(zone_id = %zone_id, completion = scored.completion, "zone completed");
        } else {
            *self.active.get_mut(&zone_id)? = scored.clone();
        }

        Some(ZoneUpdate {
            zone_id,
            update_type,
            ts_ms: now_ms,
            zone: scored,
        })
    }

    /// Close a zone and move it to history.
    pub fn invalidate_zone(
        &mut self,
        id: Uuid,
        reason: ZoneEndReason,
        now_ms: i64,
    ) -> Option<ZoneUpdate> {
        self.close_zone(id, reason, now_ms)
    }

    fn close_zone(
        &mut self,
        id: Uuid,
        reason: ZoneEndReason,
        now_ms: i64,
    ) -> Option<ZoneUpdate> {
        let mut zone = self.active.remove(&id)?;
        zone.is_active = false;
        zone.end_time_ms = Some(now_ms);
        zone.end_reason = Some(reason);
        debug!(zone_id = %id, reason = ?reason, "zone closed");
        let update = ZoneUpdate {
            zone_id: id,
            update_type: if reason == ZoneEndReason::Completed {
                ZoneUpdateType::Completed
            } else {
                ZoneUpdateType::Invalidated
            },
            ts_ms: now_ms,
            zone: zone.clone(),
        };
        self.push_history(zone);
        Some(update)
    }

    /// Extend an active zone's range to enclose the given price.
    pub fn expand_zone_range(&mut self, id: Uuid, new_price_ticks: Ticks) -> bool {
        match self.active.get_mut(&id) {
            Some(zone) => {
                zone.price_range = zone.price_range.expanded_to(new_price_ticks);
                true
            }
            None => false,
        }
    }

    /// Find the active zone of the given type whose range is closest to
    /// the price, if it lies within `max_distance_ticks` of the range
    /// (zero when the price falls inside the range).
    pub fn find_nearby(
        &self,
        zone_type: ZoneType,
        price_ticks: Ticks,
        max_distance_ticks: i64,
    ) -> Option<Uuid> {
        self.active
            .values()
            .filter(|z| z.zone_type == zone_type)
            .map(|z| {
                let gap = if z.price_range.contains(price_ticks) {
                    0
                } else {
                    (z.price_range.min_ticks - price_ticks)
                        .max(price_ticks - z.price_range.max_ticks)
                };
                (gap, z.id)
            })
            .filter(|&(gap, _)| gap <= max_distance_ticks)
            .min()
            .map(|(_, id)| id)
    }

    /// Find an active zone of the same type whose range overlaps the
    /// candidate and whose center is within the merge tolerance.
    pub fn find_overlapping(&self, zone_type: ZoneType, range: &PriceRange) -> Option<Uuid> {
        self.active
            .values()
            .filter(|z| z.zone_type == zone_type)
            .filter(|z| z.price_range.overlaps(range))
            .filter(|z| {
                (z.price_range.center_ticks - range.center_ticks).abs()
                    <= self.cfg.merge_tolerance_ticks
            })
            .min_by_key(|z| (z.price_range.center_ticks - range.center_ticks).abs())
            .map(|z| z.id)
    }

    /// Merge an overlapping candidate into an existing zone: the zone
    /// absorbs the candidate's trades and the range expands to enclose the
    /// candidate. The zone id is preserved.
    pub fn merge_candidate(
        &mut self,
        id: Uuid,
        detection: &ZoneDetection,
        now_ms: i64,
    ) -> Option<ZoneUpdate> {
        let zone = self.active.get_mut(&id)?;
        let prev_strength = zone.strength;

        zone.total_volume += detection.total_volume;
        zone.buy_volume += detection.buy_volume;
        zone.sell_volume += detection.sell_volume;
        zone.trade_count += detection.trade_count;
        zone.average_order_size = zone.total_volume / zone.trade_count.max(1) as i64;
        zone.price_range = zone
            .price_range
            .expanded_to(detection.price_range.min_ticks)
            .expanded_to(detection.price_range.max_ticks);
        zone.time_in_zone_ms = (now_ms - zone.start_time_ms).max(0);
        zone.last_update_ms = now_ms;

        let mut scored = zone.clone();
        self.rescore(&mut scored);
        Self::push_strength_sample(&mut scored, now_ms);
        let delta = scored.strength - prev_strength;
        *self.active.get_mut(&id)? = scored.clone();

        debug!(zone_id = %id, "merged candidate with existing zone");

        Some(ZoneUpdate {
            zone_id: id,
            update_type: if delta > self.cfg.strength_change_threshold {
                ZoneUpdateType::Strengthened
            } else {
                ZoneUpdateType::Updated
            },
            ts_ms: now_ms,
            zone: scored,
        })
    }

    pub fn query_zones(&self, q: &ZoneQuery) -> Vec<&TradingZone> {
        let mut out: Vec<&TradingZone> = self
            .active
            .values()
            .chain(self.history.iter())
            .filter(|z| q.symbol.as_deref().map_or(true, |s| s == z.symbol))
            .filter(|z| q.zone_type.map_or(true, |t| t == z.zone_type))
            .filter(|z| q.min_strength.map_or(true, |s| z.strength >= s))
            .filter(|z| q.is_active.map_or(true, |a| a == z.is_active))
            .filter(|z| {
                q.near_price.map_or(true, |(price, tolerance)| {
                    let max_dist = (price as f64 * tolerance).abs();
                    (z.price_range.center_ticks - price).abs() as f64 <= max_dist
                })
            })
            .filter(|z| {
                q.max_age_ms
                    .map_or(true, |age| q.now_ms - z.start_time_ms <= age)
            })
            .collect();
        out.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        out
    }

    pub fn stats(&self) -> ZoneStats {
        let mut s = ZoneStats {
            active_count: self.active.len(),
            completed_count: self
                .history
                .iter()
                .filter(|z| z.end_reason == Some(ZoneEndReason::Completed))
                .count(),
            ..Default::default()
        };
        if !self.active.is_empty() {
            s.avg_strength = self.active.values().map(|z| z.strength).sum::<f64>()
                / self.active.len() as f64;
        }
        let durations: Vec<i64> = self
            .history
            .iter()
            .filter_map(|z| z.end_time_ms.map(|end| end - z.start_time_ms))
            .collect();
        if !durations.is_empty() {
            s.avg_duration_ms = durations.iter().sum::<i64>() as f64 / durations.len() as f64;
        }
        for zone in self.active.values() {
            match zone.zone_type {
                ZoneType::Accumulation => s.accumulation_count += 1,
                ZoneType::Distribution => s.distribution_count += 1,
            }
            match zone.significance {
                Significance::Minor => s.minor_count += 1,
                Significance::Moderate => s.moderate_count += 1,
                Significance::Major => s.major_count += 1,
                Significance::Institutional => s.institutional_count += 1,
            }
        }
        s
    }

    /// Invalidate active zones older than the timeout. Runs on a timer.
    pub fn expire_zones(&mut self, now_ms: i64) -> Vec<ZoneUpdate> {
        let expired: Vec<Uuid> = self
            .active
            .values()
            .filter(|z| now_ms - z.start_time_ms > self.cfg.zone_timeout_ms)
            .map(|z| z.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.close_zone(id, ZoneEndReason::Invalidated, now_ms))
            .collect()
    }

    /// Drop history beyond the retention horizon and count bound. Runs on
    /// a timer.
    pub fn gc_history(&mut self, now_ms: i64) {
        while self.history.len() > self.cfg.max_history {
            self.history.pop_front();
        }
        let retention = self.cfg.history_retention_ms;
        self.history
            .retain(|z| z.end_time_ms.map_or(true, |end| now_ms - end <= retention));
    }

    fn push_history(&mut self, zone: TradingZone) {
        self.history.push_back(zone);
        while self.history.len() > self.cfg.max_history {
            self.history.pop_front();
        }
    }

    /// Idempotent teardown.
    pub fn cleanup(&mut self) {
        self.active.clear();
        self.history.clear();
    }
}
