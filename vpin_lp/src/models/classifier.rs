// models/classifier.rs — Bulk Volume Classification (BVC)
//
// ─────────────────────────────────────────────────────────────────────────
// MATHEMATICAL SPECIFICATION
// ─────────────────────────────────────────────────────────────────────────
//
// Based on: Easley, López de Prado, O'Hara (2012) — "Flow Toxicity and
// Liquidity in a High-Frequency World"
//
//   Per closed volume bucket τ:
//
//     Δp_τ = price_end − price_start
//     σ_Δp = sample std-dev of Δp over the trailing buckets (before τ)
//     z_τ  = Δp_τ / σ_Δp
//
//     V_τ^B = V · Φ(z_τ)          (buy-initiated share)
//     V_τ^S = V − V_τ^B
//
//   where Φ is the standard normal CDF.  A bucket whose price rose by one
//   trailing σ is classified ≈ 84% buy.
//
//   Degenerate cases (explicit branches, never arithmetic faults):
//     trailing sample < min_samples  → 50/50, low_confidence
//     σ_Δp == 0 or Δp == 0           → 50/50 exactly
// ─────────────────────────────────────────────────────────────────────────

use std::collections::VecDeque;

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::{FlowError, FlowResult};
use crate::models::bucket::VolumeBucket;

/// σ at or below this is treated as "no variance observed".
const SIGMA_FLOOR: f64 = 1e-12;

// ── TRAILING σ ESTIMATOR ─────────────────────────────────────────────────

/// Running sample standard deviation of bucket price changes.
///
/// Welford accumulation; with a finite window the oldest sample is removed
/// by the inverse update, so every push is O(1).
#[derive(Debug, Clone)]
pub struct SigmaEstimator {
    window:  Option<usize>,
    samples: VecDeque<f64>,
    n:       usize,
    mean:    f64,
    m2:      f64,
}

impl SigmaEstimator {
    pub fn new(window: Option<usize>) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(window.map_or(0, |w| w + 1)),
            n: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn push(&mut self, x: f64) {
        self.add(x);
        if let Some(w) = self.window {
            self.samples.push_back(x);
            if self.samples.len() > w {
                if let Some(old) = self.samples.pop_front() {
                    self.remove(old);
                }
            }
        }
    }

    fn add(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2   += delta * (x - self.mean);
    }

    fn remove(&mut self, x: f64) {
        if self.n <= 1 {
            self.n = 0;
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let n = self.n as f64;
        let mean_new = (n * self.mean - x) / (n - 1.0);
        self.m2  -= (x - self.mean) * (x - mean_new);
        self.mean = mean_new;
        self.n   -= 1;
        if self.m2 < 0.0 {
            self.m2 = 0.0;
        }
    }

    /// Samples currently in the estimate.
    pub fn count(&self) -> usize {
        self.n
    }

    /// Sample σ (n − 1 denominator); `None` below two samples.
    pub fn sigma(&self) -> Option<f64> {
        if self.n < 2 {
            return None;
        }
        Some((self.m2 / (self.n - 1) as f64).sqrt())
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.n = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
    }
}

// ── CLASSIFICATION ───────────────────────────────────────────────────────

/// Buy/sell split of one bucket's price move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Split {
    pub buy_fraction:   f64,
    /// Standardised price change; `None` when σ was not usable
    pub z:              Option<f64>,
    pub sigma:          Option<f64>,
    pub low_confidence: bool,
}

/// A closed bucket with its buy/sell volumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedBucket {
    pub bucket:         VolumeBucket,
    pub buy_volume:     f64,
    pub sell_volume:    f64,
    pub buy_fraction:   f64,
    pub z:              Option<f64>,
    pub sigma:          Option<f64>,
    pub low_confidence: bool,
}

impl ClassifiedBucket {
    pub fn index(&self) -> u64 {
        self.bucket.index
    }

    pub fn volume(&self) -> f64 {
        self.bucket.volume
    }

    /// |V^B − V^S| / V  ∈ [0, 1]
    pub fn imbalance(&self) -> f64 {
        let v = self.volume();
        if v <= 0.0 {
            return 0.0;
        }
        ((self.buy_volume - self.sell_volume).abs() / v).min(1.0)
    }
}

/// Stateful BVC classifier.  Owns the trailing σ estimate for one run.
#[derive(Debug, Clone)]
pub struct OrderFlowClassifier {
    sigma:       SigmaEstimator,
    min_samples: usize,
    normal:      Normal,
}

impl OrderFlowClassifier {
    pub fn new(cfg: &ClassifierConfig) -> FlowResult<Self> {
        if cfg.min_sigma_samples < 2 {
            return Err(FlowError::config(
                "min_sigma_samples",
                "a sample standard deviation needs at least 2 observations",
            ));
        }
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| FlowError::config("classifier", format!("standard normal: {e}")))?;
        Ok(Self {
            sigma: SigmaEstimator::new(cfg.sigma_window),
            min_samples: cfg.min_sigma_samples,
            normal,
        })
    }

    /// Split for a price change against the current trailing σ.
    /// Does not update the estimate.
    pub fn split(&self, price_change: f64) -> Split {
        let sigma = self.sigma.sigma();

        if self.sigma.count() < self.min_samples {
            return Split { buy_fraction: 0.5, z: None, sigma, low_confidence: true };
        }

        match sigma {
            Some(s) if s > SIGMA_FLOOR && price_change != 0.0 => {
                let z = price_change / s;
                Split { buy_fraction: self.normal.cdf(z), z: Some(z), sigma, low_confidence: false }
            }
            Some(s) if s > SIGMA_FLOOR => {
                Split { buy_fraction: 0.5, z: Some(0.0), sigma, low_confidence: false }
            }
            // no variance observed yet
            _ => Split { buy_fraction: 0.5, z: None, sigma, low_confidence: false },
        }
    }

    /// Classify a closed bucket, then fold its price change into σ.
    pub fn classify(&mut self, bucket: VolumeBucket) -> ClassifiedBucket {
        let dp    = bucket.price_change();
        let split = self.split(dp);
        self.sigma.push(dp);

        let total       = bucket.volume;
        let buy_volume  = split.buy_fraction * total;
        let sell_volume = total - buy_volume;

        ClassifiedBucket {
            bucket,
            buy_volume,
            sell_volume,
            buy_fraction: split.buy_fraction,
            z: split.z,
            sigma: split.sigma,
            low_confidence: split.low_confidence,
        }
    }

    pub fn samples(&self) -> usize {
        self.sigma.count()
    }

    pub fn reset(&mut self) {
        self.sigma.reset();
    }
}

/// Lazy adaptor: bucket stream → classified bucket stream.
///
/// The trailing partial bucket is held back (see `trailing_partial`) and
/// never classified.
pub struct Classify<I> {
    buckets:          I,
    classifier:       OrderFlowClassifier,
    trailing_partial: Option<VolumeBucket>,
}

impl<I> Classify<I>
where
    I: Iterator<Item = FlowResult<VolumeBucket>>,
{
    pub fn new<T>(buckets: T, classifier: OrderFlowClassifier) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self { buckets: buckets.into_iter(), classifier, trailing_partial: None }
    }

    /// The under-filled bucket the stream ended with, once reached.
    pub fn trailing_partial(&self) -> Option<&VolumeBucket> {
        self.trailing_partial.as_ref()
    }
}

impl<I> Iterator for Classify<I>
where
    I: Iterator<Item = FlowResult<VolumeBucket>>,
{
    type Item = FlowResult<ClassifiedBucket>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.buckets.next()? {
                Ok(bucket) if bucket.partial => {
                    debug!(
                        index = bucket.index,
                        fill = bucket.fill_ratio(),
                        "excluding trailing partial bucket"
                    );
                    self.trailing_partial = Some(bucket);
                }
                Ok(bucket) => return Some(Ok(self.classifier.classify(bucket))),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::from_unix_seconds;

    fn cfg(window: Option<usize>, min: usize) -> ClassifierConfig {
        ClassifierConfig { sigma_window: window, min_sigma_samples: min }
    }

    fn bucket(index: u64, p0: f64, p1: f64) -> VolumeBucket {
        let ts = from_unix_seconds(index as i64).unwrap();
        VolumeBucket {
            index,
            start_ts: ts,
            end_ts: ts,
            target_volume: 100.0,
            volume: 100.0,
            price_start: p0,
            price_end: p1,
            trade_count: 1,
            partial: false,
        }
    }

    fn std_dev(data: &[f64]) -> f64 {
        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        (data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    }

    #[test]
    fn windowed_sigma_matches_direct_computation() {
        let xs: Vec<f64> = (0..40).map(|i| ((i * 37) % 11) as f64 - 5.0 + 0.1 * i as f64).collect();
        let mut est = SigmaEstimator::new(Some(8));
        for x in &xs {
            est.push(*x);
        }
        assert_eq!(est.count(), 8);
        let expected = std_dev(&xs[xs.len() - 8..]);
        assert!((est.sigma().unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn unbounded_sigma_uses_every_sample() {
        let xs = [1.0, -2.0, 0.5, 3.0, -1.5];
        let mut est = SigmaEstimator::new(None);
        xs.iter().for_each(|x| est.push(*x));
        assert!((est.sigma().unwrap() - std_dev(&xs)).abs() < 1e-12);
    }

    #[test]
    fn below_minimum_sample_falls_back_to_even_split() {
        let mut c = OrderFlowClassifier::new(&cfg(None, 3)).unwrap();
        let first = c.classify(bucket(0, 100.0, 105.0));
        assert!(first.low_confidence);
        assert_eq!(first.buy_fraction, 0.5);
        assert_eq!(first.buy_volume, 50.0);
        assert_eq!(first.sell_volume, 50.0);
    }

    #[test]
    fn unchanged_price_splits_exactly_even() {
        let mut c = OrderFlowClassifier::new(&cfg(None, 2)).unwrap();
        c.classify(bucket(0, 100.0, 101.0));
        c.classify(bucket(1, 101.0, 99.0));
        let flat = c.classify(bucket(2, 99.0, 99.0));
        assert!(!flat.low_confidence);
        assert_eq!(flat.buy_fraction, 0.5);
        assert_eq!(flat.buy_volume, flat.sell_volume);
    }

    #[test]
    fn zero_sigma_splits_exactly_even() {
        let mut c = OrderFlowClassifier::new(&cfg(None, 2)).unwrap();
        // identical changes → σ = 0
        c.classify(bucket(0, 100.0, 101.0));
        c.classify(bucket(1, 101.0, 102.0));
        let next = c.classify(bucket(2, 102.0, 110.0));
        assert_eq!(next.buy_fraction, 0.5);
        assert_eq!(next.z, None);
    }

    #[test]
    fn rising_price_leans_buy_falling_leans_sell() {
        let mut c = OrderFlowClassifier::new(&cfg(None, 2)).unwrap();
        c.classify(bucket(0, 100.0, 101.0));
        c.classify(bucket(1, 101.0, 100.0));
        // σ of {+1, −1} = √2
        let up = c.split(2f64.sqrt());
        assert!((up.buy_fraction - 0.841_344_746).abs() < 1e-6, "Φ(1) = {}", up.buy_fraction);
        let down = c.split(-2f64.sqrt());
        assert!((down.buy_fraction + up.buy_fraction - 1.0).abs() < 1e-12);
    }

    #[test]
    fn volume_is_conserved() {
        let mut c = OrderFlowClassifier::new(&cfg(Some(5), 2)).unwrap();
        let mut price = 100.0;
        for i in 0..50u64 {
            let next = price + ((i * 7 % 5) as f64 - 2.0) * 0.3;
            let cb = c.classify(bucket(i, price, next));
            assert!((cb.buy_volume + cb.sell_volume - 100.0).abs() < 1e-9);
            assert!((0.0..=1.0).contains(&cb.imbalance()));
            price = next;
        }
    }

    #[test]
    fn adaptor_holds_back_partial_bucket() {
        let mut partial = bucket(2, 99.0, 98.0);
        partial.partial = true;
        partial.volume = 40.0;
        let stream: Vec<FlowResult<VolumeBucket>> =
            vec![Ok(bucket(0, 100.0, 101.0)), Ok(bucket(1, 101.0, 99.0)), Ok(partial)];
        let classifier = OrderFlowClassifier::new(&cfg(None, 2)).unwrap();
        let mut adaptor = Classify::new(stream, classifier);
        let out: Vec<u64> = adaptor.by_ref().map(|r| r.unwrap().index()).collect();
        assert_eq!(out, vec![0, 1]);
        assert_eq!(adaptor.trailing_partial().map(|b| b.index), Some(2));
    }

    #[test]
    fn rejects_min_samples_below_two() {
        assert!(matches!(
            OrderFlowClassifier::new(&cfg(None, 1)),
            Err(FlowError::InvalidConfiguration { parameter: "min_sigma_samples", .. })
        ));
    }
}
