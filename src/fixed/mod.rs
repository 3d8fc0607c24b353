//! Fixed-point price and quantity arithmetic.
//!
//! Prices and quantities arrive as decimal strings and are converted once,
//! at the edge, into `i64` values scaled by 1e8. Prices are further
//! projected onto the market's tick grid and handled as integer tick
//! indices everywhere downstream. Float arithmetic only appears in derived
//! statistics (ratios, means, variances), never in volume accounting.

use crate::error::ApplyError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Scale factor for fixed-point quantities and prices: 8 decimal places.
pub const SCALE: i64 = 100_000_000;

/// Price expressed in integer multiples of the market tick size.
pub type Ticks = i64;

/// Quantity scaled by [`SCALE`].
pub type Qty = i64;

/// Convert a decimal into a scaled integer, rejecting values with more
/// than 8 decimal places.
pub fn decimal_to_scaled(d: Decimal) -> Option<i64> {
    let scaled = d.checked_mul(Decimal::from(SCALE))?;
    if !scaled.fract().is_zero() {
        return None;
    }
    scaled.to_i64()
}

/// Parse a decimal string into a scaled quantity. Negative quantities are
/// rejected; zero is allowed (depth diffs use zero to delete a level).
pub fn parse_qty(s: &str, field: &'static str) -> Result<Qty, ApplyError> {
    let d = Decimal::from_str(s).map_err(|_| ApplyError::MalformedDecimal {
        field,
        value: s.to_string(),
    })?;
    if d.is_sign_negative() {
        return Err(ApplyError::NegativeQuantity {
            field,
            value: s.to_string(),
        });
    }
    decimal_to_scaled(d).ok_or(ApplyError::MalformedDecimal {
        field,
        value: s.to_string(),
    })
}

/// Parse a decimal price string and project it onto the tick grid,
/// rounding to the nearest tick.
pub fn parse_price_ticks(
    s: &str,
    tick_size_scaled: i64,
    field: &'static str,
) -> Result<Ticks, ApplyError> {
    let d = Decimal::from_str(s).map_err(|_| ApplyError::MalformedDecimal {
        field,
        value: s.to_string(),
    })?;
    let scaled = decimal_to_scaled(d).ok_or(ApplyError::MalformedDecimal {
        field,
        value: s.to_string(),
    })?;
    if scaled <= 0 {
        return Err(ApplyError::NonPositivePrice {
            field,
            value: s.to_string(),
        });
    }
    Ok(price_to_ticks(scaled, tick_size_scaled))
}

/// Snap a scaled price onto the tick grid, rounding to nearest.
pub fn price_to_ticks(price_scaled: i64, tick_size_scaled: i64) -> Ticks {
    debug_assert!(tick_size_scaled > 0);
    (price_scaled + tick_size_scaled / 2) / tick_size_scaled
}

/// Zone key for a tick index at resolution `k`: the floor of the
/// containing k-tick bucket. Prices are positive so integer division
/// floors correctly.
pub fn zone_key(price_ticks: Ticks, k: i64) -> Ticks {
    debug_assert!(k > 0);
    (price_ticks / k) * k
}

/// Scaled quantity as a float, for derived statistics only.
pub fn qty_to_f64(qty: Qty) -> f64 {
    qty as f64 / SCALE as f64
}

/// Division with a zero-denominator guard.
pub fn div_guard(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Ratio of two scaled quantities.
pub fn qty_ratio(num: Qty, den: Qty) -> f64 {
    div_guard(num as f64, den as f64)
}

/// Bid/ask spread in basis points, computed on tick indices (the tick
/// size cancels out of the ratio).
pub fn spread_bps(bid_ticks: Ticks, ask_ticks: Ticks) -> f64 {
    let mid = (bid_ticks + ask_ticks) as f64 / 2.0;
    if mid <= 0.0 {
        return 0.0;
    }
    (ask_ticks - bid_ticks) as f64 / mid * 10_000.0
}

/// Clamp into the unit interval.
pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Welford running mean and variance. O(1) push, no window.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Mean/variance over an explicit sliding window: the caller pushes and
/// pops samples, the sums stay O(1) per operation.
#[derive(Debug, Clone, Default)]
pub struct WindowedStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl WindowedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn pop(&mut self, value: f64) {
        debug_assert!(self.count > 0);
        self.count = self.count.saturating_sub(1);
        self.sum -= value;
        self.sum_sq -= value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population variance. Guards against tiny negative values from
    /// floating-point cancellation.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let v = self.sum_sq / n - (self.sum / n) * (self.sum / n);
        v.max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z-score of a value against the window distribution. Zero when the
    /// window is degenerate.
    pub fn z_score(&self, value: f64) -> f64 {
        let sd = self.std_dev();
        if sd == 0.0 {
            0.0
        } else {
            (value - self.mean()) / sd
        }
    }
}

/// P² single-pass quantile estimator (Jain & Chlamtac). Five markers,
/// O(1) per observation, no retained samples. Replaces sort-the-window
/// quantile computation on the hot path.
#[derive(Debug, Clone)]
pub struct P2Quantile {
    p: f64,
    heights: [f64; 5],
    positions: [f64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
    count: usize,
    initial: [f64; 5],
}

impl P2Quantile {
    pub fn new(p: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&p));
        Self {
            p,
            heights: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
            count: 0,
            initial: [0.0; 5],
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn push(&mut self, value: f64) {
        if self.count < 5 {
            self.initial[self.count] = value;
            self.count += 1;
            if self.count == 5 {
                self.initial
                    .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                self.heights = self.initial;
            }
            return;
        }
        self.count += 1;

        let k = if value < self.heights[0] {
            self.heights[0] = value;
            0
        } else if value >= self.heights[4] {
            self.heights[4] = value;
            3
        } else {
            let mut k = 0;
            for i in 0..4 {
                if value >= self.heights[i] && value < self.heights[i + 1] {
                    k = i;
                    break;
                }
            }
            k
        };

        for pos in self.positions.iter_mut().skip(k + 1) {
            *pos += 1.0;
        }
        for i in 0..5 {
            self.desired[i] += self.increments[i];
        }

        for i in 1..4 {
            let d = self.desired[i] - self.positions[i];
            let right = self.positions[i + 1] - self.positions[i];
            let left = self.positions[i - 1] - self.positions[i];
            if (d >= 1.0 && right > 1.0) || (d <= -1.0 && left < -1.0) {
                let d = d.signum();
                let candidate = self.parabolic(i, d);
                if self.heights[i - 1] < candidate && candidate < self.heights[i + 1] {
                    self.heights[i] = candidate;
                } else {
                    self.heights[i] = self.linear(i, d);
                }
                self.positions[i] += d;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = (i as f64 + d) as usize;
        self.heights[i]
            + d * (self.heights[j] - self.heights[i]) / (self.positions[j] - self.positions[i])
    }

    /// Current quantile estimate. Falls back to the exact value over the
    /// buffered samples until five observations are seen.
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        if self.count < 5 {
            let mut v: Vec<f64> = self.initial[..self.count].to_vec();
            v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((self.count - 1) as f64 * self.p).round() as usize;
            return v[idx.min(self.count - 1)];
        }
        self.heights[2]
    }
}
