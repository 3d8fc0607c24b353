//! Long-lived accumulation/distribution trading zones.

mod engine;

pub use engine::{ZoneEngine, ZoneStats};

use crate::fixed::{clamp01, Qty, Ticks};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneType {
    Accumulation,
    Distribution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    Minor,
    Moderate,
    Major,
    Institutional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSizeProfile {
    Retail,
    Mixed,
    Institutional,
}

impl OrderSizeProfile {
    /// Weight used by the zone strength formula.
    pub fn strength_weight(self) -> f64 {
        match self {
            OrderSizeProfile::Institutional => 1.0,
            OrderSizeProfile::Mixed => 0.7,
            OrderSizeProfile::Retail => 0.4,
        }
    }
}

/// Inclusive tick range of a zone. Invariant: min <= center <= max and
/// width == max - min.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRange {
    pub min_ticks: Ticks,
    pub max_ticks: Ticks,
    pub center_ticks: Ticks,
    pub width_ticks: i64,
}

impl PriceRange {
    pub fn new(min_ticks: Ticks, max_ticks: Ticks) -> Self {
        let (min_ticks, max_ticks) = if min_ticks <= max_ticks {
            (min_ticks, max_ticks)
        } else {
            (max_ticks, min_ticks)
        };
        Self {
            min_ticks,
            max_ticks,
            center_ticks: (min_ticks + max_ticks) / 2,
            width_ticks: max_ticks - min_ticks,
        }
    }

    pub fn contains(&self, price_ticks: Ticks) -> bool {
        (self.min_ticks..=self.max_ticks).contains(&price_ticks)
    }

    pub fn overlaps(&self, other: &PriceRange) -> bool {
        self.min_ticks <= other.max_ticks && other.min_ticks <= self.max_ticks
    }

    /// Smallest range enclosing self and the given price.
    pub fn expanded_to(&self, price_ticks: Ticks) -> PriceRange {
        PriceRange::new(self.min_ticks.min(price_ticks), self.max_ticks.max(price_ticks))
    }
}

/// Qualitative evidence backing a zone.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportingFactors {
    pub volume_concentration: f64,
    pub order_size_profile: OrderSizeProfile,
    pub time_consistency: f64,
    pub price_stability: f64,
    pub flow_consistency: f64,
}

impl SupportingFactors {
    /// Mean of the numeric factors, the confidence baseline.
    pub fn mean(&self) -> f64 {
        clamp01(
            (self.volume_concentration
                + self.time_consistency
                + self.price_stability
                + self.flow_consistency)
                / 4.0,
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrengthSample {
    pub ts_ms: i64,
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneEndReason {
    Completed,
    Invalidated,
    ReplacedByStrongerZone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneUpdateType {
    Created,
    Updated,
    Strengthened,
    Weakened,
    Completed,
    Invalidated,
}

/// A long-lived accumulation or distribution zone.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingZone {
    pub id: Uuid,
    pub zone_type: ZoneType,
    pub symbol: String,
    pub price_range: PriceRange,
    pub start_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub total_volume: Qty,
    pub buy_volume: Qty,
    pub sell_volume: Qty,
    pub average_order_size: Qty,
    pub trade_count: u64,
    pub time_in_zone_ms: i64,
    /// Volume per second of zone lifetime.
    pub intensity: f64,
    pub strength: f64,
    pub completion: f64,
    pub confidence: f64,
    pub significance: Significance,
    pub is_active: bool,
    pub last_update_ms: i64,
    pub strength_history: Vec<StrengthSample>,
    pub supporting_factors: SupportingFactors,
    pub end_reason: Option<ZoneEndReason>,
    /// Incremental inter-trade gap statistics feeding timeConsistency.
    #[serde(skip)]
    pub(crate) gap_stats: crate::fixed::RunningStats,
    #[serde(skip)]
    pub(crate) prev_trade_ts_ms: i64,
}

/// A lifecycle event emitted whenever a zone changes state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneUpdate {
    pub zone_id: Uuid,
    pub update_type: ZoneUpdateType,
    pub ts_ms: i64,
    pub zone: TradingZone,
}

/// What a detector observed when promoting a candidate into a zone.
#[derive(Debug, Clone)]
pub struct ZoneDetection {
    pub price_range: PriceRange,
    /// When the candidate started forming; becomes the zone start time.
    pub started_at_ms: i64,
    pub total_volume: Qty,
    pub buy_volume: Qty,
    pub sell_volume: Qty,
    pub average_order_size: Qty,
    pub trade_count: u64,
    pub supporting_factors: SupportingFactors,
}

/// Filter for `ZoneEngine::query_zones`.
#[derive(Debug, Clone, Default)]
pub struct ZoneQuery {
    pub symbol: Option<String>,
    pub zone_type: Option<ZoneType>,
    pub min_strength: Option<f64>,
    pub is_active: Option<bool>,
    /// (price_ticks, tolerance as a fraction of price).
    pub near_price: Option<(Ticks, f64)>,
    pub max_age_ms: Option<i64>,
    pub now_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_range_normalises() {
        let r = PriceRange::new(8630, 8620);
        assert_eq!(r.min_ticks, 8620);
        assert_eq!(r.max_ticks, 8630);
        assert_eq!(r.center_ticks, 8625);
        assert_eq!(r.width_ticks, 10);
        assert!(r.min_ticks <= r.center_ticks && r.center_ticks <= r.max_ticks);
    }

    #[test]
    fn test_price_range_overlap() {
        let a = PriceRange::new(100, 110);
        let b = PriceRange::new(108, 120);
        let c = PriceRange::new(111, 120);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_expanded_to() {
        let r = PriceRange::new(100, 110).expanded_to(95);
        assert_eq!(r.min_ticks, 95);
        assert_eq!(r.width_ticks, 15);
    }

    #[test]
    fn test_profile_weights() {
        assert_eq!(OrderSizeProfile::Institutional.strength_weight(), 1.0);
        assert_eq!(OrderSizeProfile::Mixed.strength_weight(), 0.7);
        assert_eq!(OrderSizeProfile::Retail.strength_weight(), 0.4);
    }
}
