//! The hot pipeline: ingress frames in, coordinated signals out.
//!
//! One task owns every core component; processing is synchronous and
//! lock-free inside a turn. Timers (book pruning, zone expiry and GC,
//! anomaly cleanup, stats) are multiplexed with the queue read in
//! [`Engine::run`]. Apply and detector errors are counted and isolated;
//! they never cancel the pipeline.

pub mod ingress;

pub use ingress::{IngressQueue, IngressStats, PushOutcome};

use crate::anomaly::{AnomalyDetector, NullSpoofing};
use crate::book::{Book, BookHealth, SnapshotSource};
use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorStats, Decision, SignalCoordinator};
use crate::detectors::{
    AbsorptionDetector, AccumulationDetector, CvdDivergenceDetector, Detector, DetectorContext,
    DistributionDetector, ExhaustionDetector,
};
use crate::error::{ConfigError, EngineError};
use crate::events::{AnomalyEvent, ConfirmedSignal, SignalCandidate, SignalType};
use crate::journal::{Journal, JournalRecord};
use crate::preprocessor::OrderFlowPreprocessor;
use crate::wire::Frame;
use crate::zones::{ZoneEngine, ZoneStats, ZoneUpdate};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Maintenance tick granularity for the run loop.
const TICK_MS: u64 = 100;

/// Egress event envelope published to downstream consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressEvent {
    pub ts_ms: i64,
    #[serde(flatten)]
    pub payload: EgressPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum EgressPayload {
    Anomaly(AnomalyEvent),
    Signal(ConfirmedSignal),
    SignalCandidate(SignalCandidate),
    ZoneUpdate(ZoneUpdate),
    /// Candidates produced by the zone-lifecycle detectors.
    ZoneSignal(SignalCandidate),
    Stats(EngineStats),
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    processed_trades: u64,
    processed_depth_diffs: u64,
    apply_errors: u64,
    detector_errors: u64,
    journal_errors: u64,
    candidates_emitted: u64,
    signals_confirmed: u64,
    anomalies_emitted: u64,
}

/// Periodic statistics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub processed_trades: u64,
    pub processed_depth_diffs: u64,
    pub apply_errors: u64,
    pub detector_errors: u64,
    pub journal_errors: u64,
    pub candidates_emitted: u64,
    pub signals_confirmed: u64,
    pub anomalies_emitted: u64,
    pub zone_stats: ZoneStats,
    pub coordinator: CoordinatorStats,
    pub book_health: BookHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressStats>,
}

pub struct Engine {
    cfg: EngineConfig,
    tick_size_scaled: i64,
    book: Book,
    pre: OrderFlowPreprocessor,
    zones: ZoneEngine,
    detectors: Vec<Box<dyn Detector + Send>>,
    anomaly: AnomalyDetector,
    coordinator: SignalCoordinator,
    journal: Option<Journal>,
    snapshot_source: Option<Box<dyn SnapshotSource>>,
    egress: broadcast::Sender<EgressEvent>,
    counters: Counters,
    next_prune_ms: i64,
    next_zone_expire_ms: i64,
    next_zone_gc_ms: i64,
    next_stats_ms: i64,
    overload_baseline: u64,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Result<Self, EngineError> {
        cfg.validate()?;
        let tick_size_scaled = cfg.tick_size_scaled();
        if tick_size_scaled <= 0 {
            return Err(ConfigError::Invalid("tick size resolves to zero".into()).into());
        }

        let journal = if cfg.journal.enabled {
            Some(Journal::open(Path::new(&cfg.journal.path))?)
        } else {
            None
        };

        let detectors: Vec<Box<dyn Detector + Send>> = vec![
            Box::new(AbsorptionDetector::new(&cfg.absorption)),
            Box::new(ExhaustionDetector::new(&cfg.exhaustion)),
            Box::new(AccumulationDetector::new(&cfg.accumulation)),
            Box::new(DistributionDetector::new(&cfg.distribution)),
            Box::new(CvdDivergenceDetector::new(&cfg.cvd)),
        ];

        let (egress, _) = broadcast::channel(1024);

        Ok(Self {
            book: Book::new(cfg.book.clone()),
            pre: OrderFlowPreprocessor::new(&cfg.preprocessor),
            zones: ZoneEngine::new(&cfg.zones, cfg.book.symbol.clone()),
            anomaly: AnomalyDetector::new(&cfg.anomaly, Box::new(NullSpoofing)),
            coordinator: SignalCoordinator::new(&cfg.coordinator),
            detectors,
            journal,
            snapshot_source: None,
            egress,
            counters: Counters::default(),
            next_prune_ms: 0,
            next_zone_expire_ms: 0,
            next_zone_gc_ms: 0,
            next_stats_ms: 0,
            overload_baseline: 0,
            tick_size_scaled,
            cfg,
        })
    }

    /// Attach the snapshot supplier used for book recovery. Without one
    /// the book initialises empty (replay semantics).
    pub fn set_snapshot_source(&mut self, source: Box<dyn SnapshotSource>) {
        self.snapshot_source = Some(source);
    }

    /// Subscribe to the egress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EgressEvent> {
        self.egress.subscribe()
    }

    /// Recover the book and arm the pipeline. A missing snapshot from an
    /// attached source is fatal.
    pub fn init(&mut self, now_ms: i64) -> Result<(), EngineError> {
        match self.snapshot_source.as_deref_mut() {
            Some(source) => self.book.recover(Some(source), now_ms)?,
            None => self.book.recover(None, now_ms)?,
        }
        info!(symbol = self.cfg.book.symbol.as_str(), "pipeline initialised");
        Ok(())
    }

    /// Process one frame. Never propagates apply or detector errors.
    pub fn on_frame(&mut self, frame: Frame, now_ms: i64) {
        match frame {
            Frame::Trade(f) => self.on_trade_frame(&f, now_ms),
            Frame::Depth(f) => self.on_depth_frame(&f, now_ms),
        }
    }

    fn on_depth_frame(&mut self, frame: &crate::wire::DepthDiffFrame, now_ms: i64) {
        let diff = match frame.to_diff(self.tick_size_scaled) {
            Ok(diff) => diff,
            Err(e) => {
                self.counters.apply_errors += 1;
                self.book.record_error(now_ms);
                warn!(error = %e, "malformed depth frame dropped");
                return;
            }
        };
        self.book.apply_depth_diff(&diff, now_ms);
        self.counters.processed_depth_diffs += 1;

        if let (Some(bid), Some(ask)) = (self.book.best_bid(), self.book.best_ask()) {
            let bid_qty = self.book.level_at(bid).map(|l| l.bid_qty).unwrap_or(0);
            let ask_qty = self.book.level_at(ask).map(|l| l.ask_qty).unwrap_or(0);
            let events = self
                .anomaly
                .update_best_quotes(bid, bid_qty, ask, ask_qty, now_ms);
            for event in events {
                self.emit_anomaly(event, now_ms);
            }
        }
    }

    fn on_trade_frame(&mut self, frame: &crate::wire::AggTradeFrame, now_ms: i64) {
        let trade = match frame.to_trade(self.tick_size_scaled) {
            Ok(trade) => trade,
            Err(e) => {
                self.counters.apply_errors += 1;
                warn!(error = %e, trade_id = frame.trade_id, "malformed trade frame dropped");
                return;
            }
        };
        self.counters.processed_trades += 1;

        // One correlation id per hot-pipeline turn, threaded through every
        // event and log record this trade produces.
        let correlation_id = Uuid::new_v4();
        let enriched = self.pre.process(&trade, &self.book, correlation_id);

        let anomaly_events = self.anomaly.on_enriched_trade(&enriched);
        for event in anomaly_events {
            self.emit_anomaly(event, now_ms);
        }
        let health = self.anomaly.market_health(now_ms);

        let mut zone_updates: Vec<ZoneUpdate> = Vec::new();
        let mut candidates: Vec<SignalCandidate> = Vec::new();
        for detector in &mut self.detectors {
            let mut ctx = DetectorContext {
                zones: &mut self.zones,
                universal: &self.cfg.universal_zone,
                zone_updates: &mut zone_updates,
            };
            match detector.on_trade(&enriched, &mut ctx) {
                Ok(found) => candidates.extend(found),
                Err(e) => {
                    self.counters.detector_errors += 1;
                    error!(
                        correlation_id = %correlation_id,
                        detector = detector.name(),
                        error = %e,
                        "detector error isolated"
                    );
                }
            }
        }

        for update in zone_updates {
            self.journal_record(&JournalRecord::ZoneUpdate(&update));
            self.send(EgressPayload::ZoneUpdate(update), now_ms);
        }

        // While the book circuit is open the service keeps answering
        // queries from last-known state but suppresses signal emission.
        if self.book.circuit_open(now_ms) {
            return;
        }

        for candidate in candidates {
            self.counters.candidates_emitted += 1;
            self.journal_record(&JournalRecord::SignalCandidate(&candidate));
            let payload = match candidate.signal_type {
                SignalType::Accumulation | SignalType::Distribution => {
                    EgressPayload::ZoneSignal(candidate.clone())
                }
                _ => EgressPayload::SignalCandidate(candidate.clone()),
            };
            self.send(payload, now_ms);

            match self.coordinator.submit(candidate, &health, now_ms) {
                Decision::Confirmed(signal) => {
                    self.counters.signals_confirmed += 1;
                    self.journal_record(&JournalRecord::Signal(signal.as_ref()));
                    self.send(EgressPayload::Signal(*signal), now_ms);
                }
                Decision::Rejected { .. } => {}
            }
        }
    }

    /// Timer-driven upkeep; callable with virtual time during replay.
    pub fn maintenance(&mut self, now_ms: i64, ingress: Option<IngressStats>) {
        if now_ms >= self.next_prune_ms {
            self.next_prune_ms = now_ms + self.cfg.book.prune_interval_ms;
            self.book.prune(now_ms);
            if self.book.needs_recover() {
                if self.snapshot_source.is_some() {
                    let result = match self.snapshot_source.as_deref_mut() {
                        Some(source) => self.book.recover(Some(source), now_ms),
                        None => self.book.recover(None, now_ms),
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "book recover failed, will retry");
                    }
                } else {
                    warn!("book needs recover but no snapshot source is attached");
                }
            }
        }

        if now_ms >= self.next_zone_expire_ms {
            self.next_zone_expire_ms = now_ms + self.cfg.zones.expire_interval_ms;
            let expired = self.zones.expire_zones(now_ms);
            for update in expired {
                self.journal_record(&JournalRecord::ZoneUpdate(&update));
                self.send(EgressPayload::ZoneUpdate(update), now_ms);
            }
        }

        if now_ms >= self.next_zone_gc_ms {
            self.next_zone_gc_ms = now_ms + self.cfg.zones.gc_interval_ms;
            self.zones.gc_history(now_ms);
            self.anomaly.cleanup(now_ms);
            for detector in &mut self.detectors {
                detector.cleanup(now_ms);
            }
        }

        if let Some(stats) = ingress {
            let pressure = stats.coalesced + stats.yielded;
            let delta = pressure.saturating_sub(self.overload_baseline);
            if delta >= self.cfg.ingress.overload_threshold {
                self.overload_baseline = pressure;
                if let Some(event) = self.anomaly.note_overload(now_ms, delta) {
                    self.emit_anomaly(event, now_ms);
                }
            }
        }

        if now_ms >= self.next_stats_ms {
            self.next_stats_ms = now_ms + self.cfg.stats_interval_ms;
            let stats = self.build_stats(now_ms, ingress);
            self.send(EgressPayload::Stats(stats), now_ms);
        }
    }

    pub fn build_stats(&mut self, now_ms: i64, ingress: Option<IngressStats>) -> EngineStats {
        EngineStats {
            processed_trades: self.counters.processed_trades,
            processed_depth_diffs: self.counters.processed_depth_diffs,
            apply_errors: self.counters.apply_errors,
            detector_errors: self.counters.detector_errors,
            journal_errors: self.counters.journal_errors,
            candidates_emitted: self.counters.candidates_emitted,
            signals_confirmed: self.counters.signals_confirmed,
            anomalies_emitted: self.counters.anomalies_emitted,
            zone_stats: self.zones.stats(),
            coordinator: self.coordinator.stats(),
            book_health: self.book.health(now_ms),
            ingress,
        }
    }

    fn emit_anomaly(&mut self, event: AnomalyEvent, now_ms: i64) {
        self.counters.anomalies_emitted += 1;
        self.send(EgressPayload::Anomaly(event), now_ms);
    }

    fn send(&self, payload: EgressPayload, ts_ms: i64) {
        // Lagging or absent consumers never block the pipeline.
        let _ = self.egress.send(EgressEvent { ts_ms, payload });
    }

    fn journal_record(&mut self, record: &JournalRecord<'_>) {
        if let Some(journal) = &mut self.journal {
            if let Err(e) = journal.append(record) {
                self.counters.journal_errors += 1;
                warn!(error = %e, "journal append failed");
            }
        }
    }

    /// Idempotent teardown of every component.
    pub fn shutdown(&mut self) {
        self.book.cleanup();
        self.pre.cleanup();
        self.zones.cleanup();
        self.coordinator.cleanup();
        info!("pipeline shut down");
    }

    /// Drive the pipeline until cancellation or queue closure. Emits a
    /// final stats event, drains the queue, and tears down.
    pub async fn run(
        mut self,
        queue: Arc<IngressQueue>,
        cancel: CancellationToken,
    ) -> Result<EngineStats, EngineError> {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_frame = queue.pop() => match maybe_frame {
                    Some(frame) => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        self.on_frame(frame, now_ms);
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    self.maintenance(now_ms, Some(queue.stats()));
                }
            }
        }

        // Drain whatever the ingress worker managed to enqueue.
        queue.close();
        while let Some(frame) = queue.try_pop() {
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.on_frame(frame, now_ms);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let stats = self.build_stats(now_ms, Some(queue.stats()));
        self.send(EgressPayload::Stats(stats.clone()), now_ms);
        self.shutdown();
        Ok(stats)
    }
}

/// Outcome summary of a replay run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStats {
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub parse_errors: u64,
    pub engine: EngineStats,
}

/// Feed a captured frame file (JSON lines) through a fresh pipeline with
/// sequence validation off, using frame timestamps as virtual time.
pub fn replay_file(
    mut cfg: EngineConfig,
    path: &Path,
    from_ms: i64,
    to_ms: i64,
) -> Result<ReplayStats, EngineError> {
    use std::io::BufRead;

    cfg.book.disable_sequence_validation = true;
    let mut engine = Engine::new(cfg)?;
    engine.init(from_ms)?;

    let file = std::fs::File::open(path)
        .map_err(|e| EngineError::Init(format!("cannot open capture {}: {e}", path.display())))?;
    let reader = std::io::BufReader::new(file);

    let mut frames_read = 0u64;
    let mut frames_skipped = 0u64;
    let mut parse_errors = 0u64;
    let mut virtual_now = from_ms;

    for line in reader.lines() {
        let line = line
            .map_err(|e| EngineError::TransientStream(format!("capture read failed: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                parse_errors += 1;
                warn!(error = %e, "skipping malformed capture line");
                continue;
            }
        };
        frames_read += 1;

        if let Frame::Trade(t) = &frame {
            if t.ts_ms < from_ms || t.ts_ms > to_ms {
                frames_skipped += 1;
                continue;
            }
            virtual_now = t.ts_ms;
        }
        engine.on_frame(frame, virtual_now);
        engine.maintenance(virtual_now, None);
    }

    let engine_stats = engine.build_stats(virtual_now, None);
    engine.shutdown();
    Ok(ReplayStats {
        frames_read,
        frames_skipped,
        parse_errors,
        engine: engine_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::sample_config_json;
    use crate::wire::{AggTradeFrame, DepthDiffFrame};

    fn engine() -> Engine {
        let cfg = EngineConfig::from_json_str(&sample_config_json()).unwrap();
        let mut engine = Engine::new(cfg).unwrap();
        engine.init(0).unwrap();
        engine
    }

    fn trade_frame(id: u64, price: &str, qty: &str, ts_ms: i64, maker: bool) -> Frame {
        Frame::Trade(AggTradeFrame {
            trade_id: id,
            price_str: price.into(),
            qty_str: qty.into(),
            ts_ms,
            buyer_is_maker: maker,
        })
    }

    fn depth_frame(first: i64, last: i64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> Frame {
        Frame::Depth(DepthDiffFrame {
            first_update_id: first,
            final_update_id: last,
            bids: bids
                .iter()
                .map(|&(p, q)| [p.to_string(), q.to_string()])
                .collect(),
            asks: asks
                .iter()
                .map(|&(p, q)| [p.to_string(), q.to_string()])
                .collect(),
        })
    }

    #[test]
    fn test_trade_and_depth_counters() {
        let mut engine = engine();
        engine.on_frame(
            depth_frame(1, 1, &[("86.27", "10")], &[("86.29", "15")]),
            0,
        );
        engine.on_frame(trade_frame(1, "86.28", "1.0", 1_000, false), 1_000);
        let stats = engine.build_stats(1_000, None);
        assert_eq!(stats.processed_trades, 1);
        assert_eq!(stats.processed_depth_diffs, 1);
        assert_eq!(stats.apply_errors, 0);
    }

    #[test]
    fn test_malformed_frames_counted_not_fatal() {
        let mut engine = engine();
        engine.on_frame(trade_frame(1, "not-a-price", "1.0", 1_000, false), 1_000);
        engine.on_frame(
            depth_frame(1, 1, &[("86.27", "bogus")], &[]),
            1_000,
        );
        let stats = engine.build_stats(1_000, None);
        assert_eq!(stats.apply_errors, 2);
        assert_eq!(stats.processed_trades, 0);
        // Pipeline still processes good frames afterwards.
        engine.on_frame(trade_frame(2, "86.28", "1.0", 2_000, false), 2_000);
        assert_eq!(engine.build_stats(2_000, None).processed_trades, 1);
    }

    #[tokio::test]
    async fn test_absorption_flows_to_confirmed_signal() {
        let mut engine = engine();
        let mut rx = engine.subscribe();

        // Deep standing ask at the traded price.
        engine.on_frame(
            depth_frame(1, 1, &[("86.27", "400")], &[("86.28", "1500")]),
            0,
        );
        let qtys = ["60", "75", "90", "105", "120", "135", "150", "165", "200"];
        for (i, q) in qtys.iter().enumerate() {
            let ts = 1_000 + i as i64 * 500;
            engine.on_frame(trade_frame(i as u64, "86.28", q, ts, false), ts);
        }

        let mut saw_candidate = false;
        let mut saw_signal = false;
        while let Ok(event) = rx.try_recv() {
            match event.payload {
                EgressPayload::SignalCandidate(c) => {
                    assert_eq!(c.signal_type, SignalType::Absorption);
                    assert!((0.0..=1.0).contains(&c.confidence));
                    saw_candidate = true;
                }
                EgressPayload::Signal(s) => {
                    assert_eq!(s.signal_type, SignalType::Absorption);
                    assert_eq!(s.side, crate::events::Side::Buy);
                    saw_signal = true;
                }
                _ => {}
            }
        }
        assert!(saw_candidate, "absorption candidate on egress");
        assert!(saw_signal, "confirmed signal on egress");
        let stats = engine.build_stats(10_000, None);
        assert_eq!(stats.signals_confirmed, 1);
    }

    #[test]
    fn test_open_circuit_suppresses_signals() {
        let mut engine = engine();
        engine.on_frame(
            depth_frame(1, 1, &[("86.27", "400")], &[("86.28", "1500")]),
            0,
        );
        // Blow the windowed error budget: the circuit opens.
        for i in 0..30 {
            engine.on_frame(depth_frame(2, 2, &[("86.27", "x")], &[]), i);
        }
        let qtys = ["60", "75", "90", "105", "120", "135", "150", "165", "200"];
        for (i, q) in qtys.iter().enumerate() {
            let ts = 1_000 + i as i64 * 500;
            engine.on_frame(trade_frame(i as u64, "86.28", q, ts, false), ts);
        }
        let stats = engine.build_stats(10_000, None);
        assert_eq!(stats.signals_confirmed, 0);
        assert!(stats.book_health.circuit_open);
        // Trades were still enriched and counted.
        assert_eq!(stats.processed_trades, 9);
    }

    #[test]
    fn test_maintenance_is_idempotent_and_cheap() {
        let mut engine = engine();
        engine.maintenance(0, None);
        engine.maintenance(0, None);
        engine.maintenance(10_000, None);
        engine.shutdown();
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_run_drains_and_reports() {
        let cfg = EngineConfig::from_json_str(&sample_config_json()).unwrap();
        let queue = Arc::new(IngressQueue::new(&cfg.ingress));
        let mut engine = Engine::new(cfg).unwrap();
        engine.init(0).unwrap();

        queue.push(depth_frame(1, 1, &[("86.27", "10")], &[("86.29", "15")]));
        queue.push(trade_frame(1, "86.28", "1.0", 1_000, false));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(queue.clone(), cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.processed_trades, 1);
        assert_eq!(stats.processed_depth_diffs, 1);
    }

    #[test]
    fn test_replay_file_filters_by_time() {
        let cfg = EngineConfig::from_json_str(&sample_config_json()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        let lines = [
            r#"{"type":"depth","firstUpdateId":1,"finalUpdateId":1,"bids":[["86.27","10"]],"asks":[["86.29","15"]]}"#,
            r#"{"type":"trade","tradeId":1,"priceStr":"86.28","qtyStr":"1.0","tsMs":1000,"buyerIsMaker":false}"#,
            r#"{"type":"trade","tradeId":2,"priceStr":"86.28","qtyStr":"1.0","tsMs":99000,"buyerIsMaker":true}"#,
            "not json at all",
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();

        let stats = replay_file(cfg, &path, 0, 10_000).unwrap();
        assert_eq!(stats.frames_read, 3);
        assert_eq!(stats.frames_skipped, 1, "late trade filtered");
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.engine.processed_trades, 1);
        assert_eq!(stats.engine.processed_depth_diffs, 1);
    }
}
