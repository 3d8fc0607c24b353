//! Order-flow preprocessor.
//!
//! Converts each aggressive trade plus current book state into an
//! [`EnrichedTrade`], and maintains the rolling multi-resolution zone
//! accumulators behind the [`ZoneData`] view. Strict arrival order, no
//! reordering, and no trade is ever dropped: when the book has no usable
//! state the enrichment carries zeroed passive context and a flag.

use crate::book::Book;
use crate::config::PreprocessorConfig;
use crate::events::{AggressiveTrade, EnrichedTrade, Side, ZoneData, ZoneSnapshot};
use crate::fixed::{decimal_to_scaled, zone_key, Qty, Ticks};
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct ZoneTrade {
    ts_ms: i64,
    price_ticks: Ticks,
    qty: Qty,
    side: Side,
}

/// Rolling aggregate for one zone at one resolution.
#[derive(Debug)]
struct ZoneAccumulator {
    zone_key: Ticks,
    resolution: i64,
    trades: VecDeque<ZoneTrade>,
    buy_volume: Qty,
    sell_volume: Qty,
    /// Σ price_ticks · qty over retained trades.
    vwap_num: i128,
    min_ticks: Ticks,
    max_ticks: Ticks,
    last_update_ms: i64,
}

impl ZoneAccumulator {
    fn new(zone_key: Ticks, resolution: i64) -> Self {
        Self {
            zone_key,
            resolution,
            trades: VecDeque::new(),
            buy_volume: 0,
            sell_volume: 0,
            vwap_num: 0,
            min_ticks: 0,
            max_ticks: 0,
            last_update_ms: 0,
        }
    }

    fn push(&mut self, t: ZoneTrade, window_ms: i64) {
        // Evict trades that fell out of the rolling window.
        let mut boundary_evicted = false;
        while let Some(front) = self.trades.front() {
            if t.ts_ms - front.ts_ms > window_ms {
                let gone = self.trades.pop_front().expect("front checked");
                match gone.side {
                    Side::Buy => self.buy_volume -= gone.qty,
                    Side::Sell => self.sell_volume -= gone.qty,
                }
                self.vwap_num -= gone.price_ticks as i128 * gone.qty as i128;
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
        self.vwap_num += t.price_ticks as i128 * t.qty as i128;
        self.last_update_ms = t.ts_ms;
        self.trades.push_back(t);

        if boundary_evicted || self.trades.len() == 1 {
            self.recompute_boundaries();
        } else {
            self.min_ticks = self.min_ticks.min(t.price_ticks);
            self.max_ticks = self.max_ticks.max(t.price_ticks);
        }
    }

    fn recompute_boundaries(&mut self) {
        self.min_ticks = i64::MAX;
        self.max_ticks = i64::MIN;
        for t in &self.trades {
            self.min_ticks = self.min_ticks.min(t.price_ticks);
            self.max_ticks = self.max_ticks.max(t.price_ticks);
        }
        if self.trades.is_empty() {
            self.min_ticks = 0;
            self.max_ticks = 0;
        }
    }

    fn timespan_ms(&self) -> i64 {
        match (self.trades.front(), self.trades.back()) {
            (Some(f), Some(b)) => b.ts_ms - f.ts_ms,
            _ => 0,
        }
    }

    fn snapshot(&self, book: Option<&Book>) -> ZoneSnapshot {
        let aggressive = self.buy_volume + self.sell_volume;
        let (passive_bid, passive_ask) = match book {
            Some(book) => {
                let band = book.sum_range(self.zone_key, self.zone_key + self.resolution - 1);
                (band.bid_qty, band.ask_qty)
            }
            None => (0, 0),
        };
        ZoneSnapshot {
            zone_key: self.zone_key,
            resolution_ticks: self.resolution,
            aggressive_volume: aggressive,
            aggressive_buy_volume: self.buy_volume,
            aggressive_sell_volume: self.sell_volume,
            passive_volume: passive_bid + passive_ask,
            passive_bid_volume: passive_bid,
            passive_ask_volume: passive_ask,
            trade_count: self.trades.len() as u64,
            timespan_ms: self.timespan_ms(),
            min_price_ticks: self.min_ticks,
            max_price_ticks: self.max_ticks,
            last_update_ms: self.last_update_ms,
            vwap_ticks: if aggressive > 0 {
                self.vwap_num as f64 / aggressive as f64
            } else {
                0.0
            },
        }
    }
}

struct Lane {
    resolution: i64,
    retention_ms: i64,
    zones: BTreeMap<Ticks, ZoneAccumulator>,
}

pub struct OrderFlowPreprocessor {
    band_ticks: i64,
    view_radius_ticks: i64,
    window_ms: i64,
    lanes: Vec<Lane>,
}

impl OrderFlowPreprocessor {
    pub fn new(cfg: &PreprocessorConfig) -> Self {
        let lanes = cfg
            .resolutions
            .iter()
            .zip(cfg.snapshot_retention_ms_per_resolution.iter())
            .map(|(&resolution, &retention_ms)| Lane {
                resolution,
                retention_ms,
                zones: BTreeMap::new(),
            })
            .collect();
        Self {
            band_ticks: cfg.band_ticks_for_zone_passive,
            view_radius_ticks: cfg.snapshot_span_ticks,
            window_ms: cfg.snapshot_window_ms,
            lanes,
        }
    }

    /// Tick size helper used by callers that resolve config once.
    pub fn tick_size_scaled(cfg: &PreprocessorConfig) -> i64 {
        decimal_to_scaled(cfg.tick_size).unwrap_or(0)
    }

    /// Enrich one trade in arrival order. Pure with respect to its inputs:
    /// the same (trade, book, zone state) always produces the same output.
    pub fn process(
        &mut self,
        trade: &AggressiveTrade,
        book: &Book,
        correlation_id: Uuid,
    ) -> EnrichedTrade {
        let book_unavailable =
            !book.is_ready() || (book.best_bid().is_none() && book.best_ask().is_none());

        let (best_bid, best_ask, spread_ticks) = if book_unavailable {
            (None, None, None)
        } else {
            (book.best_bid(), book.best_ask(), book.spread_ticks())
        };

        let (passive_bid_qty, passive_ask_qty) = if book_unavailable {
            (0, 0)
        } else {
            book.level_at(trade.price_ticks)
                .map(|l| (l.bid_qty, l.ask_qty))
                .unwrap_or((0, 0))
        };

        let (zone_passive_bid_qty, zone_passive_ask_qty) = if book_unavailable {
            (0, 0)
        } else {
            let band = book.sum_band(trade.price_ticks, self.band_ticks);
            (band.bid_qty, band.ask_qty)
        };

        let zone_trade = ZoneTrade {
            ts_ms: trade.ts_ms,
            price_ticks: trade.price_ticks,
            qty: trade.qty,
            side: trade.aggressor_side(),
        };
        for lane in &mut self.lanes {
            let key = zone_key(trade.price_ticks, lane.resolution);
            lane.zones
                .entry(key)
                .or_insert_with(|| ZoneAccumulator::new(key, lane.resolution))
                .push(zone_trade, self.window_ms);
            // Age out snapshots idle beyond the lane retention.
            let retention = lane.retention_ms;
            lane.zones
                .retain(|_, z| trade.ts_ms - z.last_update_ms <= retention);
        }

        let book_view = if book_unavailable { None } else { Some(book) };
        let zone_data = self.zone_view(trade.price_ticks, book_view);

        trace!(
            correlation_id = %correlation_id,
            trade_id = trade.trade_id,
            price_ticks = trade.price_ticks,
            book_unavailable,
            "enriched trade"
        );

        EnrichedTrade {
            trade: *trade,
            correlation_id,
            best_bid,
            best_ask,
            spread_ticks,
            passive_bid_qty,
            passive_ask_qty,
            zone_passive_bid_qty,
            zone_passive_ask_qty,
            book_unavailable,
            zone_data,
        }
    }

    /// Active snapshots whose zone key lies within the view radius of the
    /// given price, at every resolution.
    fn zone_view(&self, price_ticks: Ticks, book: Option<&Book>) -> ZoneData {
        let mut data = ZoneData::default();
        let lo = price_ticks - self.view_radius_ticks;
        let hi = price_ticks + self.view_radius_ticks;
        for lane in &self.lanes {
            let out = match lane.resolution {
                5 => &mut data.zones_5t,
                10 => &mut data.zones_10t,
                _ => &mut data.zones_20t,
            };
            for (_, zone) in lane.zones.range(lo..=hi) {
                out.push(zone.snapshot(book));
            }
        }
        data
    }

    /// Pure helper shared with detectors: snapshots whose zone center lies
    /// within `max_distance_ticks` of the price.
    pub fn find_zones_near_price(
        zones: &[ZoneSnapshot],
        price_ticks: Ticks,
        max_distance_ticks: i64,
    ) -> Vec<ZoneSnapshot> {
        zones
            .iter()
            .filter(|z| (z.center_ticks() - price_ticks).abs() <= max_distance_ticks)
            .cloned()
            .collect()
    }

    /// Number of live accumulators across all resolutions.
    pub fn zone_count(&self) -> usize {
        self.lanes.iter().map(|l| l.zones.len()).sum()
    }

    /// Idempotent teardown.
    pub fn cleanup(&mut self) {
        for lane in &mut self.lanes {
            lane.zones.clear();
        }
    }
}
