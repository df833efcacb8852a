/// models/vpin.rs — Volume-Synchronised Probability of Informed Trading
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// Based on: Easley, López de Prado, O'Hara (2012)
///
///   Input: closed, classified volume buckets j with V_j^B + V_j^S = V.
///
///   Order imbalance ratio of bucket j:
///       OI_j = |V_j^B − V_j^S| / V            ∈ [0, 1]
///
///   VPIN over the trailing h buckets, at bucket i ≥ h − 1:
///       VPIN(i, h) = (1/h) · Σ_{j=i−h+1}^{i} OI_j     ∈ [0, 1]
///
///   Horizons used for pool analysis (50 buckets ≈ one day of volume):
///       vpin_daily = 50,  vpin_5day = 250,  vpin_7day = 350 buckets
///
///   Each horizon is an independent ring buffer with a running sum:
///   push = add new term, evict oldest, O(1).  The sum is re-derived from
///   the ring once per full turn to stop floating-point drift.
/// ─────────────────────────────────────────────────────────────────────────

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::RunConfig;
use crate::error::{FlowError, FlowResult};
use crate::models::classifier::ClassifiedBucket;

// ── ROLLING WINDOW ───────────────────────────────────────────────────────

/// Rolling mean of the last `window` imbalance ratios.
#[derive(Debug, Clone)]
pub struct RollingImbalance {
    window:    usize,
    buf:       VecDeque<f64>,
    sum:       f64,
    evictions: usize,
}

impl RollingImbalance {
    pub fn new(window: usize) -> FlowResult<Self> {
        if window == 0 {
            return Err(FlowError::config("vpin_horizon", "window must hold at least one bucket"));
        }
        Ok(Self {
            window,
            buf: VecDeque::with_capacity(window + 1),
            sum: 0.0,
            evictions: 0,
        })
    }

    /// Push one imbalance ratio; returns VPIN once the window is full.
    pub fn push(&mut self, imbalance: f64) -> Option<f64> {
        self.buf.push_back(imbalance);
        self.sum += imbalance;

        if self.buf.len() > self.window {
            let old = self.buf.pop_front().unwrap_or(0.0);
            self.sum -= old;
            self.evictions += 1;
            if self.evictions % self.window == 0 {
                self.sum = self.buf.iter().sum();
            }
        }

        self.value()
    }

    /// Current VPIN, `None` until `window` buckets have been seen.
    pub fn value(&self) -> Option<f64> {
        if self.buf.len() < self.window {
            return None;
        }
        Some((self.sum / self.window as f64).clamp(0.0, 1.0))
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.window
    }
}

// ── OUTPUT RECORDS ───────────────────────────────────────────────────────

/// VPIN at one bucket for one horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VpinPoint {
    pub bucket_index: u64,
    /// Window length in buckets
    pub horizon:      usize,
    pub value:        f64,
}

/// One row of the VPIN table: a classified bucket plus VPIN per horizon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VpinRow {
    pub bucket_index:    u64,
    pub bucket_end_ts:   DateTime<Utc>,
    pub volume:          f64,
    pub price_end:       f64,
    pub buy_volume:      f64,
    pub sell_volume:     f64,
    pub order_imbalance: f64,
    pub low_confidence:  bool,
    /// Same order as the engine's horizons; `None` until the window fills
    pub vpin:            Vec<Option<f64>>,
}

// ── MULTI-HORIZON ENGINE ─────────────────────────────────────────────────

/// Streams classified buckets through every configured horizon at once.
#[derive(Debug, Clone)]
pub struct VpinEngine {
    labels:  Vec<String>,
    windows: Vec<RollingImbalance>,
}

impl VpinEngine {
    /// `horizons` = (label, window in buckets), in output order.
    pub fn new(horizons: &[(String, usize)]) -> FlowResult<Self> {
        if horizons.is_empty() {
            return Err(FlowError::config("vpin_horizons", "at least one horizon is required"));
        }
        let windows = horizons
            .iter()
            .map(|(_, w)| RollingImbalance::new(*w))
            .collect::<FlowResult<Vec<_>>>()?;
        Ok(Self {
            labels: horizons.iter().map(|(l, _)| l.clone()).collect(),
            windows,
        })
    }

    pub fn from_config(cfg: &RunConfig) -> FlowResult<Self> {
        Self::new(&cfg.horizon_windows())
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn push(&mut self, bucket: &ClassifiedBucket) -> VpinRow {
        let oi = bucket.imbalance();
        let vpin = self.windows.iter_mut().map(|w| w.push(oi)).collect();
        VpinRow {
            bucket_index:    bucket.index(),
            bucket_end_ts:   bucket.bucket.end_ts,
            volume:          bucket.volume(),
            price_end:       bucket.bucket.price_end,
            buy_volume:      bucket.buy_volume,
            sell_volume:     bucket.sell_volume,
            order_imbalance: oi,
            low_confidence:  bucket.low_confidence,
            vpin,
        }
    }
}

// ── PER-HORIZON LAZY SEQUENCES ───────────────────────────────────────────

/// Lazy `VpinPoint` sequence for a single horizon over a bucket slice.
/// Empty when the slice holds fewer buckets than the window.
pub struct HorizonPoints<'a> {
    buckets: std::slice::Iter<'a, ClassifiedBucket>,
    roll:    RollingImbalance,
}

impl Iterator for HorizonPoints<'_> {
    type Item = VpinPoint;

    fn next(&mut self) -> Option<VpinPoint> {
        for b in self.buckets.by_ref() {
            if let Some(value) = self.roll.push(b.imbalance()) {
                return Some(VpinPoint {
                    bucket_index: b.index(),
                    horizon: self.roll.window(),
                    value,
                });
            }
        }
        None
    }
}

pub fn horizon_points(buckets: &[ClassifiedBucket], window: usize) -> FlowResult<HorizonPoints<'_>> {
    Ok(HorizonPoints {
        buckets: buckets.iter(),
        roll: RollingImbalance::new(window)?,
    })
}

/// Every horizon over the same read-only buckets, one rayon task each.
/// Output order follows `windows`.
pub fn points_by_horizon(buckets: &[ClassifiedBucket], windows: &[usize]) -> FlowResult<Vec<Vec<VpinPoint>>> {
    windows
        .par_iter()
        .map(|&w| horizon_points(buckets, w).map(|it| it.collect::<Vec<_>>()))
        .collect()
}
