//! Bounded ingress queue between the stream worker and the hot pipeline.
//!
//! Above the high watermark, depth frames are coalesced latest-wins per
//! price into the newest pending depth frame; trade frames are never
//! dropped. When the queue is full the producer yields and retries.

use crate::config::IngressConfig;
use crate::wire::{DepthDiffFrame, Frame};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Depth frame merged into a pending one.
    Coalesced,
    /// Queue full; caller should yield and retry.
    Full,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressStats {
    pub depth: usize,
    pub queued: u64,
    pub coalesced: u64,
    pub yielded: u64,
}

struct Inner {
    frames: VecDeque<Frame>,
    queued: u64,
    coalesced: u64,
    yielded: u64,
    closed: bool,
}

pub struct IngressQueue {
    capacity: usize,
    high_watermark: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl IngressQueue {
    pub fn new(cfg: &IngressConfig) -> Self {
        Self {
            capacity: cfg.queue_capacity,
            high_watermark: cfg.high_watermark,
            inner: Mutex::new(Inner {
                frames: VecDeque::new(),
                queued: 0,
                coalesced: 0,
                yielded: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Non-blocking push with backpressure coalescing.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut inner = self.inner.lock().expect("ingress queue poisoned");
        if inner.closed {
            return PushOutcome::Closed;
        }

        match frame {
            Frame::Depth(depth) => {
                let over_watermark = inner.frames.len() > self.high_watermark;
                let full = inner.frames.len() >= self.capacity;
                if over_watermark || full {
                    if let Some(pending) = inner
                        .frames
                        .iter_mut()
                        .rev()
                        .find_map(|f| match f {
                            Frame::Depth(d) => Some(d),
                            Frame::Trade(_) => None,
                        })
                    {
                        merge_depth(pending, &depth);
                        inner.coalesced += 1;
                        trace!(depth = inner.frames.len(), "coalesced depth frame");
                        return PushOutcome::Coalesced;
                    }
                    if full {
                        return PushOutcome::Full;
                    }
                }
                inner.frames.push_back(Frame::Depth(depth));
            }
            trade @ Frame::Trade(_) => {
                // Trade frames are never dropped or merged.
                if inner.frames.len() >= self.capacity {
                    return PushOutcome::Full;
                }
                inner.frames.push_back(trade);
            }
        }
        inner.queued += 1;
        drop(inner);
        self.notify.notify_one();
        PushOutcome::Queued
    }

    /// Push, yielding briefly while the queue stays full. Used by the
    /// ingress worker; trade frames always land eventually.
    pub async fn push_wait(&self, frame: Frame) -> PushOutcome {
        loop {
            match self.push(frame.clone()) {
                PushOutcome::Full => {
                    {
                        let mut inner = self.inner.lock().expect("ingress queue poisoned");
                        inner.yielded += 1;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Await the next frame; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("ingress queue poisoned");
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking pop used for shutdown draining and replay.
    pub fn try_pop(&self) -> Option<Frame> {
        self.inner
            .lock()
            .expect("ingress queue poisoned")
            .frames
            .pop_front()
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("ingress queue poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn stats(&self) -> IngressStats {
        let inner = self.inner.lock().expect("ingress queue poisoned");
        IngressStats {
            depth: inner.frames.len(),
            queued: inner.queued,
            coalesced: inner.coalesced,
            yielded: inner.yielded,
        }
    }
}

/// Merge `src` into `dst` latest-wins per price level, widening the
/// sequence range to cover both.
fn merge_depth(dst: &mut DepthDiffFrame, src: &DepthDiffFrame) {
    fn overlay(dst_levels: &mut Vec<[String; 2]>, src_levels: &[[String; 2]]) {
        let mut by_price: BTreeMap<String, String> = dst_levels
            .drain(..)
            .map(|[p, q]| (p, q))
            .collect();
        for [p, q] in src_levels {
            by_price.insert(p.clone(), q.clone());
        }
        *dst_levels = by_price.into_iter().map(|(p, q)| [p, q]).collect();
    }
    overlay(&mut dst.bids, &src.bids);
    overlay(&mut dst.asks, &src.asks);
    dst.first_update_id = dst.first_update_id.min(src.first_update_id);
    dst.final_update_id = dst.final_update_id.max(src.final_update_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AggTradeFrame;

    fn cfg(capacity: usize, watermark: usize) -> IngressConfig {
        IngressConfig {
            queue_capacity: capacity,
            high_watermark: watermark,
            overload_window_ms: 10_000,
            overload_threshold: 16,
        }
    }

    fn trade_frame(id: u64) -> Frame {
        Frame::Trade(AggTradeFrame {
            trade_id: id,
            price_str: "86.28".into(),
            qty_str: "1.0".into(),
            ts_ms: id as i64,
            buyer_is_maker: false,
        })
    }

    fn depth_frame(first: i64, last: i64, bids: &[(&str, &str)]) -> Frame {
        Frame::Depth(DepthDiffFrame {
            first_update_id: first,
            final_update_id: last,
            bids: bids
                .iter()
                .map(|&(p, q)| [p.to_string(), q.to_string()])
                .collect(),
            asks: vec![],
        })
    }

    #[test]
    fn test_fifo_order_preserved() {
        let q = IngressQueue::new(&cfg(16, 8));
        q.push(trade_frame(1));
        q.push(depth_frame(1, 2, &[("86.27", "1")]));
        q.push(trade_frame(2));
        let Some(Frame::Trade(t)) = q.try_pop() else {
            panic!("expected trade first");
        };
        assert_eq!(t.trade_id, 1);
        assert!(matches!(q.try_pop(), Some(Frame::Depth(_))));
        assert!(matches!(q.try_pop(), Some(Frame::Trade(_))));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_depth_coalesced_over_watermark() {
        let q = IngressQueue::new(&cfg(16, 2));
        q.push(depth_frame(1, 1, &[("86.27", "1")]));
        q.push(trade_frame(1));
        q.push(trade_frame(2));
        // Queue now above watermark: the next depth frames merge into the
        // pending one, latest quantity winning per price.
        assert_eq!(
            q.push(depth_frame(2, 2, &[("86.27", "5"), ("86.26", "2")])),
            PushOutcome::Coalesced
        );
        assert_eq!(
            q.push(depth_frame(3, 3, &[("86.27", "9")])),
            PushOutcome::Coalesced
        );

        let Some(Frame::Depth(d)) = q.try_pop() else {
            panic!("expected merged depth frame");
        };
        assert_eq!(d.first_update_id, 1);
        assert_eq!(d.final_update_id, 3);
        let qty_8627 = d
            .bids
            .iter()
            .find(|[p, _]| p == "86.27")
            .map(|[_, q]| q.clone())
            .unwrap();
        assert_eq!(qty_8627, "9");
        assert!(d.bids.iter().any(|[p, _]| p == "86.26"));
        assert_eq!(q.stats().coalesced, 2);
    }

    #[test]
    fn test_trades_never_coalesced_and_full_reports() {
        let q = IngressQueue::new(&cfg(2, 1));
        assert_eq!(q.push(trade_frame(1)), PushOutcome::Queued);
        assert_eq!(q.push(trade_frame(2)), PushOutcome::Queued);
        assert_eq!(q.push(trade_frame(3)), PushOutcome::Full);
        // Both queued trades intact.
        assert!(matches!(q.try_pop(), Some(Frame::Trade(_))));
        assert!(matches!(q.try_pop(), Some(Frame::Trade(_))));
    }

    #[test]
    fn test_full_queue_of_trades_rejects_depth() {
        let q = IngressQueue::new(&cfg(2, 1));
        q.push(trade_frame(1));
        q.push(trade_frame(2));
        // No pending depth frame to merge into.
        assert_eq!(
            q.push(depth_frame(1, 1, &[("86.27", "1")])),
            PushOutcome::Full
        );
    }

    #[tokio::test]
    async fn test_pop_drains_then_returns_none_after_close() {
        let q = IngressQueue::new(&cfg(16, 8));
        q.push(trade_frame(1));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
        assert_eq!(q.push(trade_frame(2)), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let q = std::sync::Arc::new(IngressQueue::new(&cfg(16, 8)));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push(trade_frame(7));
        let frame = handle.await.unwrap();
        assert!(matches!(frame, Some(Frame::Trade(t)) if t.trade_id == 7));
    }
}
