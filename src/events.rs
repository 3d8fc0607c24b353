//! Core domain types flowing through the hot pipeline.

use crate::fixed::{Qty, Ticks};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Market side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// An aggregated trade after fixed-point conversion.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggressiveTrade {
    pub trade_id: u64,
    pub price_ticks: Ticks,
    pub qty: Qty,
    pub ts_ms: i64,
    pub buyer_is_maker: bool,
}

impl AggressiveTrade {
    /// The side that crossed the spread. When the buyer is the maker the
    /// seller was the taker.
    pub fn aggressor_side(&self) -> Side {
        if self.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

/// Rolling per-zone aggregate at one tick resolution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSnapshot {
    /// Lower boundary of the zone, as a tick index.
    pub zone_key: Ticks,
    pub resolution_ticks: i64,
    pub aggressive_volume: Qty,
    pub aggressive_buy_volume: Qty,
    pub aggressive_sell_volume: Qty,
    pub passive_volume: Qty,
    pub passive_bid_volume: Qty,
    pub passive_ask_volume: Qty,
    pub trade_count: u64,
    pub timespan_ms: i64,
    pub min_price_ticks: Ticks,
    pub max_price_ticks: Ticks,
    pub last_update_ms: i64,
    /// Volume-weighted mean trade price, in tick units.
    pub vwap_ticks: f64,
}

impl ZoneSnapshot {
    pub fn center_ticks(&self) -> Ticks {
        self.zone_key + self.resolution_ticks / 2
    }

    /// Signed buy/sell imbalance in [-1, 1].
    pub fn flow_imbalance(&self) -> f64 {
        crate::fixed::div_guard(
            (self.aggressive_buy_volume - self.aggressive_sell_volume) as f64,
            self.aggressive_volume as f64,
        )
    }
}

/// The multi-resolution zone view handed to detectors with each trade.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneData {
    pub zones_5t: Vec<ZoneSnapshot>,
    pub zones_10t: Vec<ZoneSnapshot>,
    pub zones_20t: Vec<ZoneSnapshot>,
}

impl ZoneData {
    pub fn all(&self) -> impl Iterator<Item = &ZoneSnapshot> {
        self.zones_5t
            .iter()
            .chain(self.zones_10t.iter())
            .chain(self.zones_20t.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.zones_5t.is_empty() && self.zones_10t.is_empty() && self.zones_20t.is_empty()
    }
}

/// A trade enriched with book context and the zone view. Immutable once
/// emitted; replaying the same inputs reproduces it exactly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedTrade {
    pub trade: AggressiveTrade,
    /// Correlation id shared by every event and log record produced while
    /// this trade moves through the pipeline.
    pub correlation_id: Uuid,
    pub best_bid: Option<Ticks>,
    pub best_ask: Option<Ticks>,
    pub spread_ticks: Option<i64>,
    /// Passive quantities resting at the trade price.
    pub passive_bid_qty: Qty,
    pub passive_ask_qty: Qty,
    /// Passive quantities summed over the configured band around the
    /// trade price.
    pub zone_passive_bid_qty: Qty,
    pub zone_passive_ask_qty: Qty,
    /// Set when the book had no usable state at enrichment time; all
    /// passive context is zero in that case.
    pub book_unavailable: bool,
    pub zone_data: ZoneData,
}

impl EnrichedTrade {
    pub fn aggressor_side(&self) -> Side {
        self.trade.aggressor_side()
    }

    pub fn price_ticks(&self) -> Ticks {
        self.trade.price_ticks
    }

    pub fn qty(&self) -> Qty {
        self.trade.qty
    }

    pub fn ts_ms(&self) -> i64 {
        self.trade.ts_ms
    }

    /// Spread in basis points, when both sides are present.
    pub fn spread_bps(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(b), Some(a)) => Some(crate::fixed::spread_bps(b, a)),
            _ => None,
        }
    }
}

/// Detector signal taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalType {
    Absorption,
    Exhaustion,
    Accumulation,
    Distribution,
    CvdConfirmation,
}

impl SignalType {
    pub const ALL: [SignalType; 5] = [
        SignalType::Absorption,
        SignalType::Exhaustion,
        SignalType::Accumulation,
        SignalType::Distribution,
        SignalType::CvdConfirmation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Absorption => "absorption",
            SignalType::Exhaustion => "exhaustion",
            SignalType::Accumulation => "accumulation",
            SignalType::Distribution => "distribution",
            SignalType::CvdConfirmation => "cvdConfirmation",
        }
    }
}

/// A candidate emitted by a detector, before coordination.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalCandidate {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub signal_type: SignalType,
    pub side: Side,
    pub price_ticks: Ticks,
    /// In [0, 1].
    pub confidence: f64,
    pub ts_ms: i64,
    pub payload: serde_json::Value,
}

/// A signal confirmed by the coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedSignal {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub signal_type: SignalType,
    pub side: Side,
    pub price_ticks: Ticks,
    pub confidence: f64,
    pub ts_ms: i64,
    /// Other signal types that fired on the same side within the
    /// correlation window.
    pub correlated_with: Vec<SignalType>,
    pub payload: serde_json::Value,
}

/// Anomaly severity bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a [0, 1] confidence score onto a severity band.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence > 0.95 {
            Severity::Critical
        } else if confidence > 0.85 {
            Severity::High
        } else if confidence > 0.7 {
            Severity::Medium
        } else {
            Severity::Info
        }
    }

    fn rank(self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Trading guidance attached to anomalies and market health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    ReduceSize,
    Pause,
    ClosePositions,
}

impl RecommendedAction {
    fn rank(self) -> u8 {
        match self {
            RecommendedAction::Continue => 0,
            RecommendedAction::ReduceSize => 1,
            RecommendedAction::Pause => 2,
            RecommendedAction::ClosePositions => 3,
        }
    }

    /// The stronger of two recommendations.
    pub fn max(self, other: Self) -> Self {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }
}

/// Anomaly taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    FlashCrash,
    LiquidityVoid,
    ApiGap,
    ExtremeVolatility,
    OrderbookImbalance,
    FlowImbalance,
    Absorption,
    Exhaustion,
    MomentumIgnition,
    IcebergOrder,
    OrderSizeAnomaly,
    Spoofing,
    ProcessingOverload,
}

/// A detected market anomaly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    /// Tick range the anomaly affects (inclusive).
    pub affected_range: (Ticks, Ticks),
    pub detected_at_ms: i64,
    pub recommended_action: RecommendedAction,
    pub details: serde_json::Value,
}

/// Snapshot metrics published with market health.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub spread_bps: f64,
    pub flow_imbalance: f64,
    pub volatility: f64,
}

/// Market-health verdict consulted by the signal coordinator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketHealth {
    pub is_healthy: bool,
    pub recent_anomaly_count: usize,
    pub highest_severity: Option<Severity>,
    pub recommendation: RecommendedAction,
    pub metrics: HealthMetrics,
}
