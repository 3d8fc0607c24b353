//! Signal coordination.
//!
//! Serialises candidates from every detector, applies per-type cooldowns
//! and duplicate suppression, gates on market health, correlates
//! same-side candidates across detectors, and emits confirmed signals
//! carrying the originating trade's correlation id.

use crate::config::CoordinatorConfig;
use crate::events::{ConfirmedSignal, MarketHealth, RecommendedAction, SignalCandidate, SignalType};
use crate::fixed::clamp01;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Why a candidate was not confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    LowConfidence,
    UnhealthyMarket,
    ProcessingError,
    Timeout,
    Duplicate,
}

/// Outcome of one candidate submission.
#[derive(Debug, Clone)]
pub enum Decision {
    Confirmed(Box<ConfirmedSignal>),
    Rejected {
        reason: RejectReason,
        candidate: Box<SignalCandidate>,
    },
}

#[derive(Debug, Clone, Copy)]
struct RecentSignal {
    signal_type: SignalType,
    side: crate::events::Side,
    price_ticks: i64,
    ts_ms: i64,
}

/// Accept/reject counters for the stats snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub confirmed: u64,
    pub rejected_low_confidence: u64,
    pub rejected_unhealthy_market: u64,
    pub rejected_processing_error: u64,
    pub rejected_timeout: u64,
    pub rejected_duplicate: u64,
}

impl CoordinatorStats {
    fn count(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::LowConfidence => self.rejected_low_confidence += 1,
            RejectReason::UnhealthyMarket => self.rejected_unhealthy_market += 1,
            RejectReason::ProcessingError => self.rejected_processing_error += 1,
            RejectReason::Timeout => self.rejected_timeout += 1,
            RejectReason::Duplicate => self.rejected_duplicate += 1,
        }
    }
}

pub struct SignalCoordinator {
    cfg: CoordinatorConfig,
    last_emit_by_type: HashMap<SignalType, i64>,
    recent: VecDeque<RecentSignal>,
    unhealthy_until: i64,
    stats: CoordinatorStats,
}

impl SignalCoordinator {
    pub fn new(cfg: &CoordinatorConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            last_emit_by_type: HashMap::new(),
            recent: VecDeque::new(),
            unhealthy_until: i64::MIN / 2,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    /// Submit one candidate against the current market-health verdict.
    pub fn submit(
        &mut self,
        candidate: SignalCandidate,
        health: &MarketHealth,
        now_ms: i64,
    ) -> Decision {
        self.trim_recent(now_ms);

        if candidate.confidence < self.cfg.min_confidence {
            return self.reject(candidate, RejectReason::LowConfidence);
        }

        if now_ms - candidate.ts_ms > self.cfg.max_candidate_age_ms {
            return self.reject(candidate, RejectReason::Timeout);
        }

        // An unhealthy verdict blocks emission for a window, not just the
        // one candidate that observed it.
        let unhealthy_now = !health.is_healthy
            || matches!(
                health.recommendation,
                RecommendedAction::Pause | RecommendedAction::ClosePositions
            );
        if unhealthy_now {
            self.unhealthy_until = now_ms + self.cfg.unhealthy_block_ms;
        }
        if unhealthy_now || now_ms < self.unhealthy_until {
            return self.reject(candidate, RejectReason::UnhealthyMarket);
        }

        // Duplicate: same type and side near the same price, recently.
        let duplicate = self.recent.iter().any(|r| {
            r.signal_type == candidate.signal_type
                && r.side == candidate.side
                && (r.price_ticks - candidate.price_ticks).abs() <= self.cfg.price_tolerance_ticks
                && now_ms - r.ts_ms <= self.cfg.dedupe_window_ms
        });
        if duplicate {
            return self.reject(candidate, RejectReason::Duplicate);
        }

        // Per-type cooldown; suppression reports as duplicate.
        let cooldown = self.cfg.per_type_cooldown_ms.get(candidate.signal_type);
        if let Some(&last) = self.last_emit_by_type.get(&candidate.signal_type) {
            if now_ms - last < cooldown {
                return self.reject(candidate, RejectReason::Duplicate);
            }
        }

        // Cross-detector correlation: distinct other types, same side,
        // within the correlation window.
        let mut correlated_with: Vec<SignalType> = self
            .recent
            .iter()
            .filter(|r| {
                r.signal_type != candidate.signal_type
                    && r.side == candidate.side
                    && now_ms - r.ts_ms <= self.cfg.correlation_window_ms
            })
            .map(|r| r.signal_type)
            .collect();
        correlated_with.sort_by_key(|t| t.as_str());
        correlated_with.dedup();
        let confidence = clamp01(
            candidate.confidence + self.cfg.correlation_boost * correlated_with.len() as f64,
        );

        self.last_emit_by_type
            .insert(candidate.signal_type, now_ms);
        self.recent.push_back(RecentSignal {
            signal_type: candidate.signal_type,
            side: candidate.side,
            price_ticks: candidate.price_ticks,
            ts_ms: now_ms,
        });
        self.stats.confirmed += 1;

        info!(
            correlation_id = %candidate.correlation_id,
            signal_type = candidate.signal_type.as_str(),
            side = ?candidate.side,
            confidence,
            correlated = correlated_with.len(),
            "signal confirmed"
        );

        Decision::Confirmed(Box::new(ConfirmedSignal {
            id: candidate.id,
            correlation_id: candidate.correlation_id,
            signal_type: candidate.signal_type,
            side: candidate.side,
            price_ticks: candidate.price_ticks,
            confidence,
            ts_ms: candidate.ts_ms,
            correlated_with,
            payload: candidate.payload,
        }))
    }

    /// Record a pipeline-side failure while handling a candidate.
    pub fn reject_processing_error(&mut self, candidate: SignalCandidate) -> Decision {
        self.reject(candidate, RejectReason::ProcessingError)
    }

    fn reject(&mut self, candidate: SignalCandidate, reason: RejectReason) -> Decision {
        self.stats.count(reason);
        debug!(
            correlation_id = %candidate.correlation_id,
            signal_type = candidate.signal_type.as_str(),
            reason = ?reason,
            "signal rejected"
        );
        Decision::Rejected {
            reason,
            candidate: Box::new(candidate),
        }
    }

    fn trim_recent(&mut self, now_ms: i64) {
        let horizon = self.cfg.dedupe_window_ms.max(self.cfg.correlation_window_ms);
        while let Some(front) = self.recent.front() {
            if now_ms - front.ts_ms > horizon {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Idempotent teardown.
    pub fn cleanup(&mut self) {
        self.recent.clear();
        self.last_emit_by_type.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerTypeCooldowns;
    use crate::events::{HealthMetrics, Severity, Side};
    use serde_json::json;
    use uuid::Uuid;

    fn cfg() -> CoordinatorConfig {
        CoordinatorConfig {
            min_confidence: 0.5,
            per_type_cooldown_ms: PerTypeCooldowns {
                absorption: 20_000,
                exhaustion: 20_000,
                accumulation: 60_000,
                distribution: 60_000,
                cvd_confirmation: 30_000,
            },
            dedupe_window_ms: 45_000,
            price_tolerance_ticks: 10,
            correlation_window_ms: 60_000,
            correlation_boost: 0.05,
            unhealthy_block_ms: 30_000,
            max_candidate_age_ms: 10_000,
        }
    }

    fn healthy() -> MarketHealth {
        MarketHealth {
            is_healthy: true,
            recent_anomaly_count: 0,
            highest_severity: None,
            recommendation: RecommendedAction::Continue,
            metrics: HealthMetrics {
                spread_bps: 2.0,
                flow_imbalance: 0.0,
                volatility: 0.0,
            },
        }
    }

    fn unhealthy() -> MarketHealth {
        MarketHealth {
            is_healthy: false,
            recent_anomaly_count: 2,
            highest_severity: Some(Severity::Critical),
            recommendation: RecommendedAction::ClosePositions,
            metrics: HealthMetrics {
                spread_bps: 40.0,
                flow_imbalance: 0.9,
                volatility: 0.1,
            },
        }
    }

    fn candidate(
        signal_type: SignalType,
        side: Side,
        price_ticks: i64,
        confidence: f64,
        ts_ms: i64,
    ) -> SignalCandidate {
        SignalCandidate {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            signal_type,
            side,
            price_ticks,
            confidence,
            ts_ms,
            payload: json!({}),
        }
    }

    #[test]
    fn test_confirms_healthy_candidate() {
        let mut c = SignalCoordinator::new(&cfg());
        let d = c.submit(
            candidate(SignalType::Absorption, Side::Buy, 8628, 0.8, 1_000),
            &healthy(),
            1_000,
        );
        let Decision::Confirmed(signal) = d else {
            panic!("expected confirmation");
        };
        assert_eq!(signal.signal_type, SignalType::Absorption);
        assert!(signal.correlated_with.is_empty());
        assert_eq!(c.stats().confirmed, 1);
    }

    #[test]
    fn test_low_confidence_rejected() {
        let mut c = SignalCoordinator::new(&cfg());
        let d = c.submit(
            candidate(SignalType::Absorption, Side::Buy, 8628, 0.3, 1_000),
            &healthy(),
            1_000,
        );
        assert!(matches!(
            d,
            Decision::Rejected {
                reason: RejectReason::LowConfidence,
                ..
            }
        ));
    }

    #[test]
    fn test_unhealthy_market_blocks_for_window() {
        let mut c = SignalCoordinator::new(&cfg());
        let d = c.submit(
            candidate(SignalType::Absorption, Side::Buy, 8628, 0.8, 1_000),
            &unhealthy(),
            1_000,
        );
        assert!(matches!(
            d,
            Decision::Rejected {
                reason: RejectReason::UnhealthyMarket,
                ..
            }
        ));
        // Health recovered, but the block window still holds.
        let d = c.submit(
            candidate(SignalType::Exhaustion, Side::Sell, 8620, 0.8, 20_000),
            &healthy(),
            20_000,
        );
        assert!(matches!(
            d,
            Decision::Rejected {
                reason: RejectReason::UnhealthyMarket,
                ..
            }
        ));
        // Past the window, emission resumes.
        let d = c.submit(
            candidate(SignalType::Exhaustion, Side::Sell, 8620, 0.8, 40_000),
            &healthy(),
            40_000,
        );
        assert!(matches!(d, Decision::Confirmed(_)));
    }

    #[test]
    fn test_duplicate_suppression() {
        let mut c = SignalCoordinator::new(&cfg());
        assert!(matches!(
            c.submit(
                candidate(SignalType::Absorption, Side::Buy, 8628, 0.8, 1_000),
                &healthy(),
                1_000
            ),
            Decision::Confirmed(_)
        ));
        // Same type+side within tolerance: duplicate.
        let d = c.submit(
            candidate(SignalType::Absorption, Side::Buy, 8630, 0.9, 5_000),
            &healthy(),
            5_000,
        );
        assert!(matches!(
            d,
            Decision::Rejected {
                reason: RejectReason::Duplicate,
                ..
            }
        ));
        // Different side avoids the dedupe check but the per-type
        // cooldown still holds.
        let d = c.submit(
            candidate(SignalType::Absorption, Side::Sell, 8630, 0.9, 6_000),
            &healthy(),
            6_000,
        );
        assert!(matches!(
            d,
            Decision::Rejected {
                reason: RejectReason::Duplicate,
                ..
            }
        ));
        // Once the cooldown elapses, the other side confirms.
        let d = c.submit(
            candidate(SignalType::Absorption, Side::Sell, 8630, 0.9, 25_000),
            &healthy(),
            25_000,
        );
        assert!(matches!(d, Decision::Confirmed(_)));
    }

    #[test]
    fn test_cooldown_reports_duplicate() {
        let mut c = SignalCoordinator::new(&cfg());
        assert!(matches!(
            c.submit(
                candidate(SignalType::Exhaustion, Side::Sell, 8628, 0.8, 1_000),
                &healthy(),
                1_000
            ),
            Decision::Confirmed(_)
        ));
        // Far price (not a dedupe hit), same type, inside cooldown.
        let d = c.submit(
            candidate(SignalType::Exhaustion, Side::Sell, 9200, 0.8, 10_000),
            &healthy(),
            10_000,
        );
        assert!(matches!(
            d,
            Decision::Rejected {
                reason: RejectReason::Duplicate,
                ..
            }
        ));
    }

    #[test]
    fn test_stale_candidate_times_out() {
        let mut c = SignalCoordinator::new(&cfg());
        let d = c.submit(
            candidate(SignalType::Absorption, Side::Buy, 8628, 0.8, 1_000),
            &healthy(),
            50_000,
        );
        assert!(matches!(
            d,
            Decision::Rejected {
                reason: RejectReason::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn test_correlation_boosts_confidence() {
        let mut c = SignalCoordinator::new(&cfg());
        assert!(matches!(
            c.submit(
                candidate(SignalType::Absorption, Side::Buy, 8628, 0.8, 1_000),
                &healthy(),
                1_000
            ),
            Decision::Confirmed(_)
        ));
        let d = c.submit(
            candidate(SignalType::Accumulation, Side::Buy, 8626, 0.7, 5_000),
            &healthy(),
            5_000,
        );
        let Decision::Confirmed(signal) = d else {
            panic!("expected confirmation");
        };
        assert_eq!(signal.correlated_with, vec![SignalType::Absorption]);
        assert!((signal.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_confirmed_preserves_correlation_id() {
        let mut c = SignalCoordinator::new(&cfg());
        let cand = candidate(SignalType::CvdConfirmation, Side::Buy, 8628, 0.8, 1_000);
        let corr = cand.correlation_id;
        let Decision::Confirmed(signal) = c.submit(cand, &healthy(), 1_000) else {
            panic!("expected confirmation");
        };
        assert_eq!(signal.correlation_id, corr);
    }
}
