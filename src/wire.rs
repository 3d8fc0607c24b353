//! Ingress frame formats.
//!
//! Frames carry prices and quantities as decimal strings; conversion to
//! fixed-point happens exactly once, here, before anything enters the hot
//! pipeline.

use crate::error::ApplyError;
use crate::events::AggressiveTrade;
use crate::fixed::{parse_price_ticks, parse_qty, Qty, Ticks};
use serde::{Deserialize, Serialize};

/// Aggregated-trade frame as received from the stream transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggTradeFrame {
    pub trade_id: u64,
    pub price_str: String,
    pub qty_str: String,
    pub ts_ms: i64,
    pub buyer_is_maker: bool,
}

impl AggTradeFrame {
    /// Convert to the internal fixed-point representation.
    pub fn to_trade(&self, tick_size_scaled: i64) -> Result<AggressiveTrade, ApplyError> {
        Ok(AggressiveTrade {
            trade_id: self.trade_id,
            price_ticks: parse_price_ticks(&self.price_str, tick_size_scaled, "priceStr")?,
            qty: parse_qty(&self.qty_str, "qtyStr")?,
            ts_ms: self.ts_ms,
            buyer_is_maker: self.buyer_is_maker,
        })
    }
}

/// Incremental depth frame: batched level changes with a sequence range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthDiffFrame {
    pub first_update_id: i64,
    pub final_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

impl DepthDiffFrame {
    /// Convert to fixed-point level changes. A malformed price or
    /// quantity fails the whole frame; the caller counts and drops it.
    pub fn to_diff(&self, tick_size_scaled: i64) -> Result<DepthDiff, ApplyError> {
        let mut bids = Vec::with_capacity(self.bids.len());
        for [p, q] in &self.bids {
            bids.push((
                parse_price_ticks(p, tick_size_scaled, "bids.price")?,
                parse_qty(q, "bids.qty")?,
            ));
        }
        let mut asks = Vec::with_capacity(self.asks.len());
        for [p, q] in &self.asks {
            asks.push((
                parse_price_ticks(p, tick_size_scaled, "asks.price")?,
                parse_qty(q, "asks.qty")?,
            ));
        }
        Ok(DepthDiff {
            first_update_id: self.first_update_id,
            final_update_id: self.final_update_id,
            bids,
            asks,
        })
    }
}

/// A depth diff after fixed-point conversion.
#[derive(Debug, Clone)]
pub struct DepthDiff {
    pub first_update_id: i64,
    pub final_update_id: i64,
    pub bids: Vec<(Ticks, Qty)>,
    pub asks: Vec<(Ticks, Qty)>,
}

/// A raw frame handed from the ingress worker to the hot pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Trade(AggTradeFrame),
    Depth(DepthDiffFrame),
}

impl Frame {
    pub fn is_trade(&self) -> bool {
        matches!(self, Frame::Trade(_))
    }
}
