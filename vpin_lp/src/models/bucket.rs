// models/bucket.rs — Volume clock: fixed-volume buckets
//
// ─────────────────────────────────────────────────────────────────────────
// VOLUME BUCKETING
// ─────────────────────────────────────────────────────────────────────────
//
//   Time is re-sampled by traded volume instead of clock time.  Trades are
//   poured, in order, into buckets of exactly V units:
//
//     open bucket k, accumulated A_k = 0
//     for each trade (p, v):
//         while v > 0:
//             fill = min(v, V − A_k)
//             A_k += fill,  v −= fill
//             if A_k == V: close k (price_end = p), open k+1 (price_start = p)
//
//   "A_k == V" is tested with a relative tolerance of 1e-10 so floating
//   error never leaves a closed bucket open; no traded volume is dropped.
//   A trade may therefore straddle several buckets.  The bucket still open
//   when the series ends holds A < V; it is emitted flagged `partial` so
//   the caller can exclude it from classification and VPIN.
// ─────────────────────────────────────────────────────────────────────────

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ensure_positive;
use crate::error::{FlowError, FlowResult};
use crate::models::trade::Trade;

/// Residue below V × this is treated as zero volume.
pub const VOLUME_EPSILON: f64 = 1e-10;

/// One slice of the volume clock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeBucket {
    pub index:         u64,
    pub start_ts:      DateTime<Utc>,
    pub end_ts:        DateTime<Utc>,
    /// V, constant for the run
    pub target_volume: f64,
    /// Accumulated volume; == V once closed
    pub volume:        f64,
    pub price_start:   f64,
    pub price_end:     f64,
    /// Trades (or trade fragments) that landed in this bucket
    pub trade_count:   usize,
    /// True only for the final, under-filled bucket of a stream
    pub partial:       bool,
}

impl VolumeBucket {
    fn open(index: u64, trade: &Trade, target_volume: f64) -> Self {
        Self {
            index,
            start_ts: trade.ts,
            end_ts: trade.ts,
            target_volume,
            volume: 0.0,
            price_start: trade.price,
            price_end: trade.price,
            trade_count: 0,
            partial: false,
        }
    }

    /// Δp over the bucket.
    pub fn price_change(&self) -> f64 {
        self.price_end - self.price_start
    }

    pub fn fill_ratio(&self) -> f64 {
        self.volume / self.target_volume
    }
}

/// Lazy, single-pass splitter of a trade stream into `VolumeBucket`s.
///
/// Yields closed buckets in index order, then (if any volume is left) one
/// `partial` bucket.  A trade with a bad price or volume yields
/// `InvalidTrade` and ends the stream.
pub struct VolumeBucketer<I> {
    trades:        I,
    bucket_volume: f64,
    open:          Option<VolumeBucket>,
    ready:         VecDeque<VolumeBucket>,
    next_index:    u64,
    row:           usize,
    done:          bool,
}

impl<'a, I> VolumeBucketer<I>
where
    I: Iterator<Item = &'a Trade>,
{
    pub fn new<T>(trades: T, bucket_volume: f64) -> FlowResult<Self>
    where
        T: IntoIterator<IntoIter = I>,
    {
        ensure_positive("bucket_volume", bucket_volume)?;
        Ok(Self {
            trades: trades.into_iter(),
            bucket_volume,
            open: None,
            ready: VecDeque::new(),
            next_index: 0,
            row: 0,
            done: false,
        })
    }

    pub fn bucket_volume(&self) -> f64 {
        self.bucket_volume
    }

    /// Pour one trade into the open bucket, closing as many as it fills.
    ///
    /// A bucket closes once it is within `VOLUME_EPSILON × V` of V; the
    /// volume it records is what it actually received.
    fn absorb(&mut self, trade: &Trade) {
        let v   = self.bucket_volume;
        let tol = VOLUME_EPSILON * v;
        let mut remaining = trade.volume;

        // zero-volume trades never open a bucket
        while remaining > 0.0 {
            let mut bucket = match self.open.take() {
                Some(b) => b,
                None => {
                    let b = VolumeBucket::open(self.next_index, trade, v);
                    self.next_index += 1;
                    b
                }
            };

            bucket.trade_count += 1;
            bucket.end_ts    = trade.ts;
            bucket.price_end = trade.price;

            let fill = remaining.min(v - bucket.volume);
            bucket.volume += fill;
            remaining     -= fill;

            if bucket.volume >= v - tol {
                self.ready.push_back(bucket);
            } else {
                self.open = Some(bucket);
            }
        }
    }
}

impl<'a, I> Iterator for VolumeBucketer<I>
where
    I: Iterator<Item = &'a Trade>,
{
    type Item = FlowResult<VolumeBucket>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(bucket) = self.ready.pop_front() {
                return Some(Ok(bucket));
            }
            if self.done {
                return None;
            }

            match self.trades.next() {
                Some(trade) => {
                    let index = self.row;
                    self.row += 1;
                    if let Err(defect) = trade.check() {
                        self.done = true;
                        self.open = None;
                        return Some(Err(FlowError::InvalidTrade { index, defect }));
                    }
                    self.absorb(trade);
                }
                None => {
                    self.done = true;
                    return self.open.take().map(|mut b| {
                        b.partial = true;
                        Ok(b)
                    });
                }
            }
        }
    }
}

/// Eagerly bucket a trade slice (partial bucket included, flagged).
pub fn bucketize(trades: &[Trade], bucket_volume: f64) -> FlowResult<Vec<VolumeBucket>> {
    VolumeBucketer::new(trades, bucket_volume)?.collect()
}
