//! Engine configuration.
//!
//! One exhaustively enumerated record per component. Every field is
//! required: a missing or unknown key is a [`ConfigError`] at startup,
//! never a runtime fallback. Range validation runs after parsing.

use crate::error::ConfigError;
use crate::fixed::{decimal_to_scaled, Qty};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Per-significance values (volumes, durations).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SignificanceMap<T> {
    pub minor: T,
    pub moderate: T,
    pub major: T,
    pub institutional: T,
}

/// Per-zone-type values.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ByZoneType<T> {
    pub accumulation: T,
    pub distribution: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BookConfig {
    pub symbol: String,
    pub price_precision: u32,
    pub max_levels: usize,
    pub prune_interval_ms: i64,
    /// Levels idle longer than this are pruned.
    pub stale_level_ms: i64,
    /// Levels farther than this many ticks from mid are pruned.
    pub max_distance_ticks: i64,
    /// Apply errors in the rolling 60-second window beyond this open the
    /// circuit.
    pub max_error_rate_windowed: usize,
    pub circuit_open_ms: i64,
    /// Book is reported degraded when no depth update arrived within this
    /// horizon while the stream is connected.
    pub stale_book_ms: i64,
    pub disable_sequence_validation: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PreprocessorConfig {
    pub tick_size: Decimal,
    /// Half-width of the passive band summed around each trade price.
    pub band_ticks_for_zone_passive: i64,
    /// Zone resolutions in ticks, ascending. The engine expects the
    /// standard ladder [5, 10, 20].
    pub resolutions: Vec<i64>,
    /// Idle retention per resolution, parallel to `resolutions`.
    pub snapshot_retention_ms_per_resolution: Vec<i64>,
    /// Half-width in ticks of the zone view attached to each trade.
    pub snapshot_span_ticks: i64,
    /// Rolling aggregate window for each zone snapshot.
    pub snapshot_window_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ZoneEngineConfig {
    pub max_active_zones: usize,
    pub zone_timeout_ms: i64,
    /// Strength delta classifying a zone update as strengthened/weakened.
    pub strength_change_threshold: f64,
    pub completion_threshold: f64,
    pub history_retention_ms: i64,
    pub max_history_per_symbol: usize,
    pub expected_volume_by_significance: SignificanceMap<Decimal>,
    pub expected_time_by_significance_by_type: ByZoneType<SignificanceMap<i64>>,
    /// Volume reference for the strength formula.
    pub strength_volume_ref: Decimal,
    /// Time-in-zone reference for the strength formula.
    pub strength_time_ref_ms: i64,
    /// Time reference for the confidence duration bonus.
    pub confidence_time_ref_ms: i64,
    /// Candidate-to-zone merge distance.
    pub merge_tolerance_ticks: i64,
    pub expire_interval_ms: i64,
    pub gc_interval_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AbsorptionConfig {
    pub window_ms: i64,
    pub min_agg_volume: Decimal,
    pub absorption_threshold: f64,
    pub max_absorption_ratio: f64,
    pub min_passive_multiplier: f64,
    /// Maximum fractional price range for the zone to count as pinned.
    pub price_efficiency_threshold: f64,
    pub zone_ticks: i64,
    pub event_cooldown_ms: i64,
    /// Maximum spread in bps for a valid absorption reading.
    pub spread_impact_threshold: f64,
    /// Minimum second-half/first-half trade-rate ratio.
    pub velocity_increase_threshold: f64,
    /// Trades used for the price-pinned test.
    pub recent_trade_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ExhaustionConfig {
    pub window_ms: i64,
    pub min_agg_volume: Decimal,
    /// Maximum second-half/first-half volume ratio.
    pub exhaustion_threshold: f64,
    /// Absolute passive floor that counts as depleted on its own.
    pub depletion_volume_threshold: Decimal,
    /// Consumed-fraction evidence threshold for the depletion boost.
    pub depletion_ratio_threshold: f64,
    /// Same/opposite passive balance below which the imbalance boost
    /// applies.
    pub passive_ratio_balance_threshold: f64,
    /// Passive-vs-aggressive ratio under which liquidity is depleted.
    pub passive_volume_exhaustion_ratio: f64,
    pub min_enhanced_confidence_threshold: f64,
    /// Gate on the cross-resolution alignment score.
    pub alignment_normalization_factor: f64,
    /// Scales the alignment contribution to confidence.
    pub variance_reduction_factor: f64,
    pub zone_ticks: i64,
    /// Number of most-recent trades used for the half-window decay test.
    pub flow_trade_count: usize,
    pub event_cooldown_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AccumulationConfig {
    pub window_ms: i64,
    pub min_duration_ms: i64,
    pub zone_size_ticks: i64,
    /// Minimum passive/aggressive ratio on the absorbing side.
    pub min_ratio: f64,
    pub min_recent_activity_ms: i64,
    pub min_agg_volume: Decimal,
    pub track_side: bool,
    /// Sellers-hitting-bids share required for promotion.
    pub min_sell_ratio: f64,
    pub min_zone_volume: Decimal,
    pub min_trade_count: u64,
    pub min_zone_strength: f64,
    pub max_price_deviation_ticks: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DistributionConfig {
    pub window_ms: i64,
    pub min_duration_ms: i64,
    pub zone_size_ticks: i64,
    pub min_ratio: f64,
    pub min_recent_activity_ms: i64,
    pub min_agg_volume: Decimal,
    pub track_side: bool,
    /// Buyers-lifting-offers share required for promotion.
    pub min_buy_ratio: f64,
    pub min_zone_volume: Decimal,
    pub min_trade_count: u64,
    pub min_zone_strength: f64,
    pub max_price_deviation_ticks: i64,
}

/// Enhancement rollout stages shared by the enhanced detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementMode {
    Disabled,
    /// Enhanced metrics are computed and logged but gating behaves like
    /// `disabled`.
    Monitoring,
    Production,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CvdConfig {
    /// Rolling CVD windows, seconds, ascending. The shortest window gates
    /// emission.
    pub windows_sec: Vec<u32>,
    pub min_z: f64,
    pub base_confidence_required: f64,
    pub cvd_divergence_volume_threshold: Decimal,
    pub cvd_divergence_strength_threshold: f64,
    pub cvd_significant_imbalance_threshold: f64,
    pub cvd_divergence_score_multiplier: f64,
    pub momentum_score_multiplier: f64,
    pub alignment_minimum_threshold: f64,
    pub enhancement_mode: EnhancementMode,
    /// Delta-history samples retained per window for the z-score
    /// distribution.
    pub zscore_sample_cap: usize,
    /// Samples required before z-scores are trusted.
    pub min_history_samples: usize,
    pub event_cooldown_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UniversalZoneConfig {
    pub min_zone_confluence_count: usize,
    /// Ticks.
    pub max_zone_confluence_distance: i64,
    pub confluence_confidence_boost: f64,
    pub enable_zone_confluence_filter: bool,
    pub enable_cross_timeframe_analysis: bool,
    pub cross_timeframe_boost: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AnomalyConfig {
    /// Observation window length, in trades.
    pub window_size: usize,
    pub normal_spread_bps: f64,
    /// Observations required before statistical detectors arm.
    pub min_history: usize,
    pub anomaly_cooldown_ms: i64,
    pub volume_imbalance_threshold: f64,
    pub absorption_ratio_threshold: f64,
    pub iceberg_detection_window_ms: i64,
    pub order_size_anomaly_threshold_sigma: f64,
    pub flow_window_ms: i64,
    pub order_size_window_ms: i64,
    /// Spread multiple of `normal_spread_bps` that flags a liquidity void.
    pub liquidity_void_spread_multiplier: f64,
    pub max_inter_trade_gap_ms: i64,
    /// Short-term/long-term volatility ratio that flags extreme
    /// volatility.
    pub volatility_ratio_threshold: f64,
    /// Last-second volume multiple over baseline that flags ignition.
    pub momentum_surge_multiplier: f64,
    pub flash_crash_z_score: f64,
    pub iceberg_min_refills: usize,
    pub iceberg_min_consistency: f64,
    /// Horizon for the market-health verdict.
    pub health_window_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    pub min_confidence: f64,
    pub per_type_cooldown_ms: PerTypeCooldowns,
    pub dedupe_window_ms: i64,
    pub price_tolerance_ticks: i64,
    pub correlation_window_ms: i64,
    pub correlation_boost: f64,
    /// How long signal emission stays blocked after an unhealthy verdict.
    pub unhealthy_block_ms: i64,
    /// Candidates older than this at submission are rejected as timed out.
    pub max_candidate_age_ms: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PerTypeCooldowns {
    pub absorption: i64,
    pub exhaustion: i64,
    pub accumulation: i64,
    pub distribution: i64,
    pub cvd_confirmation: i64,
}

impl PerTypeCooldowns {
    pub fn get(&self, signal_type: crate::events::SignalType) -> i64 {
        use crate::events::SignalType::*;
        match signal_type {
            Absorption => self.absorption,
            Exhaustion => self.exhaustion,
            Accumulation => self.accumulation,
            Distribution => self.distribution,
            CvdConfirmation => self.cvd_confirmation,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IngressConfig {
    pub queue_capacity: usize,
    /// Depth frames are coalesced once the queue grows past this.
    pub high_watermark: usize,
    pub overload_window_ms: i64,
    /// Coalesce/yield events within the window beyond which a
    /// processing-overload anomaly is emitted.
    pub overload_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: String,
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineConfig {
    pub stats_interval_ms: i64,
    pub book: BookConfig,
    pub preprocessor: PreprocessorConfig,
    pub zones: ZoneEngineConfig,
    pub absorption: AbsorptionConfig,
    pub exhaustion: ExhaustionConfig,
    pub accumulation: AccumulationConfig,
    pub distribution: DistributionConfig,
    pub cvd: CvdConfig,
    pub universal_zone: UniversalZoneConfig,
    pub anomaly: AnomalyConfig,
    pub coordinator: CoordinatorConfig,
    pub ingress: IngressConfig,
    pub journal: JournalConfig,
}

impl EngineConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Tick size as a scaled fixed-point integer.
    pub fn tick_size_scaled(&self) -> i64 {
        // validate() guarantees convertibility and positivity
        decimal_to_scaled(self.preprocessor.tick_size).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require(ok: bool, msg: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(msg.to_string()))
            }
        }
        fn positive_qty(d: Decimal, name: &str) -> Result<Qty, ConfigError> {
            match decimal_to_scaled(d) {
                Some(v) if v > 0 => Ok(v),
                _ => Err(ConfigError::Invalid(format!(
                    "{name} must be a positive quantity with at most 8 decimal places"
                ))),
            }
        }
        fn unit_interval(v: f64, name: &str) -> Result<(), ConfigError> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be in [0, 1]")))
            }
        }

        require(!self.book.symbol.is_empty(), "book.symbol must be set")?;
        require(self.book.max_levels > 0, "book.maxLevels must be > 0")?;
        require(
            self.book.prune_interval_ms > 0,
            "book.pruneIntervalMs must be > 0",
        )?;
        require(
            self.book.stale_level_ms > 0,
            "book.staleLevelMs must be > 0",
        )?;
        require(
            self.book.max_distance_ticks > 0,
            "book.maxDistanceTicks must be > 0",
        )?;
        require(
            self.book.circuit_open_ms > 0,
            "book.circuitOpenMs must be > 0",
        )?;
        require(self.book.stale_book_ms > 0, "book.staleBookMs must be > 0")?;

        let p = &self.preprocessor;
        match decimal_to_scaled(p.tick_size) {
            Some(v) if v > 0 => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "preprocessor.tickSize must be positive with at most 8 decimal places"
                        .to_string(),
                ))
            }
        }
        require(
            p.resolutions == vec![5, 10, 20],
            "preprocessor.resolutions must be the standard ladder [5, 10, 20]",
        )?;
        require(
            p.snapshot_retention_ms_per_resolution.len() == p.resolutions.len(),
            "preprocessor.snapshotRetentionMsPerResolution must be parallel to resolutions",
        )?;
        require(
            p.snapshot_retention_ms_per_resolution.iter().all(|&r| r > 0),
            "preprocessor.snapshotRetentionMsPerResolution entries must be > 0",
        )?;
        require(
            p.band_ticks_for_zone_passive > 0,
            "preprocessor.bandTicksForZonePassive must be > 0",
        )?;
        require(
            p.snapshot_span_ticks > 0,
            "preprocessor.snapshotSpanTicks must be > 0",
        )?;
        require(
            p.snapshot_window_ms > 0,
            "preprocessor.snapshotWindowMs must be > 0",
        )?;

        let z = &self.zones;
        require(z.max_active_zones > 0, "zones.maxActiveZones must be > 0")?;
        require(z.zone_timeout_ms > 0, "zones.zoneTimeoutMs must be > 0")?;
        unit_interval(
            z.strength_change_threshold,
            "zones.strengthChangeThreshold",
        )?;
        unit_interval(z.completion_threshold, "zones.completionThreshold")?;
        positive_qty(z.strength_volume_ref, "zones.strengthVolumeRef")?;
        require(
            z.strength_time_ref_ms > 0,
            "zones.strengthTimeRefMs must be > 0",
        )?;
        require(
            z.confidence_time_ref_ms > 0,
            "zones.confidenceTimeRefMs must be > 0",
        )?;
        for (name, d) in [
            ("minor", z.expected_volume_by_significance.minor),
            ("moderate", z.expected_volume_by_significance.moderate),
            ("major", z.expected_volume_by_significance.major),
            (
                "institutional",
                z.expected_volume_by_significance.institutional,
            ),
        ] {
            positive_qty(d, &format!("zones.expectedVolumeBySignificance.{name}"))?;
        }

        positive_qty(self.absorption.min_agg_volume, "absorption.minAggVolume")?;
        require(self.absorption.window_ms > 0, "absorption.windowMs must be > 0")?;
        require(
            self.absorption.zone_ticks > 0,
            "absorption.zoneTicks must be > 0",
        )?;
        require(
            self.absorption.recent_trade_count >= 2,
            "absorption.recentTradeCount must be >= 2",
        )?;
        require(
            self.absorption.absorption_threshold > 0.0
                && self.absorption.max_absorption_ratio >= self.absorption.absorption_threshold,
            "absorption threshold range must satisfy 0 < absorptionThreshold <= maxAbsorptionRatio",
        )?;
        unit_interval(
            self.absorption.price_efficiency_threshold,
            "absorption.priceEfficiencyThreshold",
        )?;

        positive_qty(self.exhaustion.min_agg_volume, "exhaustion.minAggVolume")?;
        require(self.exhaustion.window_ms > 0, "exhaustion.windowMs must be > 0")?;
        require(
            self.exhaustion.zone_ticks > 0,
            "exhaustion.zoneTicks must be > 0",
        )?;
        require(
            self.exhaustion.flow_trade_count >= 2,
            "exhaustion.flowTradeCount must be >= 2",
        )?;
        unit_interval(
            self.exhaustion.exhaustion_threshold,
            "exhaustion.exhaustionThreshold",
        )?;
        unit_interval(
            self.exhaustion.min_enhanced_confidence_threshold,
            "exhaustion.minEnhancedConfidenceThreshold",
        )?;

        for (name, window_ms, zone_ticks, min_agg, min_zone_vol, ratio) in [
            (
                "accumulation",
                self.accumulation.window_ms,
                self.accumulation.zone_size_ticks,
                self.accumulation.min_agg_volume,
                self.accumulation.min_zone_volume,
                self.accumulation.min_sell_ratio,
            ),
            (
                "distribution",
                self.distribution.window_ms,
                self.distribution.zone_size_ticks,
                self.distribution.min_agg_volume,
                self.distribution.min_zone_volume,
                self.distribution.min_buy_ratio,
            ),
        ] {
            require(window_ms > 0, &format!("{name}.windowMs must be > 0"))?;
            require(zone_ticks > 0, &format!("{name}.zoneSizeTicks must be > 0"))?;
            positive_qty(min_agg, &format!("{name}.minAggVolume"))?;
            positive_qty(min_zone_vol, &format!("{name}.minZoneVolume"))?;
            unit_interval(ratio, &format!("{name} side ratio"))?;
        }

        let c = &self.cvd;
        require(
            !c.windows_sec.is_empty(),
            "cvd.windowsSec must not be empty",
        )?;
        require(
            c.windows_sec.windows(2).all(|w| w[0] < w[1]),
            "cvd.windowsSec must be strictly ascending",
        )?;
        require(c.min_z > 0.0, "cvd.minZ must be > 0")?;
        require(
            c.zscore_sample_cap >= c.min_history_samples && c.min_history_samples >= 2,
            "cvd history sizing must satisfy zscoreSampleCap >= minHistorySamples >= 2",
        )?;
        unit_interval(c.base_confidence_required, "cvd.baseConfidenceRequired")?;
        positive_qty(
            c.cvd_divergence_volume_threshold,
            "cvd.cvdDivergenceVolumeThreshold",
        )?;

        let a = &self.anomaly;
        require(a.window_size >= 8, "anomaly.windowSize must be >= 8")?;
        require(
            a.min_history >= 2 && a.min_history <= a.window_size,
            "anomaly.minHistory must be in [2, windowSize]",
        )?;
        require(a.normal_spread_bps > 0.0, "anomaly.normalSpreadBps must be > 0")?;
        require(
            a.liquidity_void_spread_multiplier > 1.0,
            "anomaly.liquidityVoidSpreadMultiplier must be > 1",
        )?;
        require(
            a.flash_crash_z_score > 0.0,
            "anomaly.flashCrashZScore must be > 0",
        )?;
        require(
            a.iceberg_min_refills >= 2,
            "anomaly.icebergMinRefills must be >= 2",
        )?;
        unit_interval(a.iceberg_min_consistency, "anomaly.icebergMinConsistency")?;

        let co = &self.coordinator;
        unit_interval(co.min_confidence, "coordinator.minConfidence")?;
        require(
            co.dedupe_window_ms > 0,
            "coordinator.dedupeWindowMs must be > 0",
        )?;
        require(
            co.correlation_window_ms > 0,
            "coordinator.correlationWindowMs must be > 0",
        )?;
        require(
            co.max_candidate_age_ms > 0,
            "coordinator.maxCandidateAgeMs must be > 0",
        )?;

        let i = &self.ingress;
        require(i.queue_capacity > 0, "ingress.queueCapacity must be > 0")?;
        require(
            i.high_watermark > 0 && i.high_watermark < i.queue_capacity,
            "ingress.highWatermark must be in (0, queueCapacity)",
        )?;

        require(
            self.stats_interval_ms > 0,
            "statsIntervalMs must be > 0",
        )?;
        require(
            !self.journal.enabled || !self.journal.path.is_empty(),
            "journal.path must be set when the journal is enabled",
        )?;

        Ok(())
    }
}
