/// models/trade.rs — Trade observations and the validated trade series
///
/// A `TradeSeries` is the shared input of both pipelines: the VPIN chain
/// consumes its volume, the liquidity model consumes its price path.  Rows
/// arrive from the ingestion layer as `RawTrade`s and are validated here,
/// once, under the configured `InvalidTradePolicy`.
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::InvalidTradePolicy;
use crate::error::{FlowError, FlowResult, TradeDefect};

/// A single swap / trade on the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub ts:     DateTime<Utc>,
    /// Quote per base, > 0
    pub price:  f64,
    /// Absolute traded size in pool-native units, >= 0
    pub volume: f64,
}

impl Trade {
    pub fn new(ts: DateTime<Utc>, price: f64, volume: f64) -> Self {
        Self { ts, price, volume }
    }

    /// Price and volume checks (ordering is the series' concern).
    pub fn check(&self) -> Result<(), TradeDefect> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(TradeDefect::BadPrice(self.price));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(TradeDefect::BadVolume(self.volume));
        }
        Ok(())
    }
}

/// Unvalidated row as handed over by the ingestion layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTrade {
    pub ts:     DateTime<Utc>,
    pub price:  f64,
    pub volume: f64,
}

/// Ordered, validated trades for one pool over one period.
#[derive(Debug, Clone, Default)]
pub struct TradeSeries {
    trades:   Vec<Trade>,
    rejected: usize,
}

impl TradeSeries {
    /// Validate already-parsed rows.
    pub fn ingest<I>(rows: I, policy: InvalidTradePolicy) -> FlowResult<Self>
    where
        I: IntoIterator<Item = RawTrade>,
    {
        Self::ingest_rows(rows.into_iter().map(Ok), policy)
    }

    /// Validate rows, some of which may already have failed to parse.
    ///
    /// Under `Skip` every defective row is dropped and logged; under `Abort`
    /// the first one is returned as `InvalidTrade`.
    pub fn ingest_rows<I>(rows: I, policy: InvalidTradePolicy) -> FlowResult<Self>
    where
        I: IntoIterator<Item = Result<RawTrade, TradeDefect>>,
    {
        let mut trades: Vec<Trade> = Vec::new();
        let mut rejected = 0usize;

        for (index, row) in rows.into_iter().enumerate() {
            let verdict = row.and_then(|raw| {
                let trade = Trade::new(raw.ts, raw.price, raw.volume);
                trade.check()?;
                if let Some(prev) = trades.last() {
                    if trade.ts < prev.ts {
                        return Err(TradeDefect::OutOfOrder {
                            ts:   trade.ts.to_rfc3339(),
                            prev: prev.ts.to_rfc3339(),
                        });
                    }
                }
                Ok(trade)
            });

            match verdict {
                Ok(trade) => trades.push(trade),
                Err(defect) => match policy {
                    InvalidTradePolicy::Abort => {
                        return Err(FlowError::InvalidTrade { index, defect });
                    }
                    InvalidTradePolicy::Skip => {
                        warn!(row = index, %defect, "skipping invalid trade");
                        rejected += 1;
                    }
                },
            }
        }

        debug!(accepted = trades.len(), rejected, "trade series ingested");
        Ok(Self { trades, rejected })
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Rows dropped by the skip policy.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn first_price(&self) -> Option<f64> {
        self.trades.first().map(|t| t.price)
    }

    pub fn min_price(&self) -> Option<f64> {
        self.trades.iter().map(|t| t.price).reduce(f64::min)
    }

    pub fn max_price(&self) -> Option<f64> {
        self.trades.iter().map(|t| t.price).reduce(f64::max)
    }

    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.trades.first()?.ts, self.trades.last()?.ts))
    }

    pub fn total_volume(&self) -> f64 {
        self.trades.iter().map(|t| t.volume).sum()
    }

    /// Mean of per-UTC-day traded volume over the days that have trades.
    ///
    /// Zero-volume trades do not make a day count.
    pub fn average_daily_volume(&self) -> Option<f64> {
        let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
        for t in self.trades.iter().filter(|t| t.volume > 0.0) {
            *by_day.entry(t.ts.date_naive()).or_insert(0.0) += t.volume;
        }
        if by_day.is_empty() {
            return None;
        }
        Some(by_day.values().sum::<f64>() / by_day.len() as f64)
    }

    /// Bucket volume V = ADV / buckets_per_day.
    pub fn derived_bucket_volume(&self, buckets_per_day: usize) -> FlowResult<f64> {
        if buckets_per_day == 0 {
            return Err(FlowError::config("buckets_per_day", "must be at least 1"));
        }
        let adv = self.average_daily_volume().ok_or_else(|| {
            FlowError::InsufficientData("cannot derive a bucket volume from a series with no traded volume".into())
        })?;
        Ok(adv / buckets_per_day as f64)
    }
}

// ── Timestamp parsing ────────────────────────────────────────────────────

/// Parse an ISO-8601 / RFC 3339 timestamp, a `YYYY-MM-DD HH:MM:SS` naive
/// UTC timestamp, or integer Unix seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TradeDefect> {
    let s = raw.trim();

    if let Ok(secs) = s.parse::<i64>() {
        return from_unix_seconds(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(TradeDefect::BadTimestamp(raw.to_string()))
}

pub fn from_unix_seconds(secs: i64) -> Result<DateTime<Utc>, TradeDefect> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| TradeDefect::BadTimestamp(secs.to_string()))
}
