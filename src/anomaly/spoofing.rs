//! Spoofing detection collaborator interface.
//!
//! Spoofing (placing and rapidly cancelling passive size to mislead) is
//! detected by an external collaborator fed with quote updates; the
//! engine ships a no-op default so the rest of the anomaly surface works
//! without one.

use crate::events::AnomalyEvent;
use crate::fixed::{Qty, Ticks};

pub trait SpoofingDetector: Send {
    fn on_quote_update(
        &mut self,
        bid_ticks: Ticks,
        bid_qty: Qty,
        ask_ticks: Ticks,
        ask_qty: Qty,
        now_ms: i64,
    ) -> Option<AnomalyEvent>;

    fn cleanup(&mut self, _now_ms: i64) {}
}

/// Default collaborator: never reports anything.
pub struct NullSpoofing;

impl SpoofingDetector for NullSpoofing {
    fn on_quote_update(
        &mut self,
        _bid_ticks: Ticks,
        _bid_qty: Qty,
        _ask_ticks: Ticks,
        _ask_qty: Qty,
        _now_ms: i64,
    ) -> Option<AnomalyEvent> {
        None
    }
}
