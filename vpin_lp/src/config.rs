/// config.rs — Centralised run configuration loaded from .env
///
/// Every parameter the VPIN / LP pipeline consumes is defined here. The
/// configuration is built once at startup, validated, and then threaded by
/// reference into each stage constructor; nothing reads the environment
/// after that.
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use serde::Serialize;

use crate::error::{FlowError, FlowResult};

/// Buckets per day used by the original VPIN study: V = ADV / 50.
pub const DEFAULT_BUCKETS_PER_DAY: usize = 50;
/// Minimum bucket price changes before σ is trusted.
pub const DEFAULT_MIN_SIGMA_SAMPLES: usize = 5;
/// 5bps pool tier (0.05%).
pub const DEFAULT_BASE_FEE: f64 = 0.0005;
pub const DEFAULT_FEE_SENSITIVITY: f64 = 1.0;
/// 50 in-range points plus one either side.
pub const DEFAULT_GRID_SIZE: usize = 52;
pub const DEFAULT_MARGIN_LOW: f64 = 0.95;
pub const DEFAULT_MARGIN_HIGH: f64 = 1.05;
pub const DEFAULT_CAPITAL: f64 = 10_000.0;
/// Headroom either side of the observed price path for the fee position.
pub const DEFAULT_POSITION_BUFFER: f64 = 0.15;

/// What to do with a trade row that fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum InvalidTradePolicy {
    /// Drop the row, log it, keep going.
    #[default]
    Skip,
    /// Fail the whole run on the first bad row.
    Abort,
}

impl FromStr for InvalidTradePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            other => Err(format!("expected skip|abort, got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketConfig {
    /// Fixed bucket volume V.  `None` derives it from the series as
    /// average daily volume / `buckets_per_day`.
    pub volume: Option<f64>,
    pub buckets_per_day: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifierConfig {
    /// Trailing sample for σ, in buckets.  `None` = every bucket so far.
    pub sigma_window: Option<usize>,
    /// Below this many samples the split falls back to 50/50.
    pub min_sigma_samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HorizonUnit {
    Buckets,
    /// Multiplied by `BucketConfig::buckets_per_day`.
    Days,
}

/// One VPIN rolling window, e.g. `vpin_5day` = 5 days.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Horizon {
    pub label: String,
    pub count: usize,
    pub unit: HorizonUnit,
}

impl Horizon {
    pub fn days(label: impl Into<String>, count: usize) -> Self {
        Self { label: label.into(), count, unit: HorizonUnit::Days }
    }

    pub fn buckets(label: impl Into<String>, count: usize) -> Self {
        Self { label: label.into(), count, unit: HorizonUnit::Buckets }
    }

    /// Window length in buckets.
    pub fn window(&self, buckets_per_day: usize) -> usize {
        match self.unit {
            HorizonUnit::Buckets => self.count,
            HorizonUnit::Days => self.count * buckets_per_day,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VpinConfig {
    pub horizons: Vec<Horizon>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeConfig {
    /// p0.  `None` uses the first trade price of the series.
    pub reference_price: Option<f64>,
    pub range_factors: Vec<f64>,
    /// Capital C in quote currency; position value at p0.
    pub capital: f64,
    pub grid_size: usize,
    /// k_low < 1: grid starts at price_lower × k_low.
    pub margin_low: f64,
    /// k_high > 1: grid ends at price_upper × k_high.
    pub margin_high: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeeConfig {
    /// f0, as a fraction of volume.
    pub base_fee: f64,
    /// k in f0 × (1 + k × VPIN).
    pub sensitivity: f64,
    /// Label of the VPIN horizon that drives the fee.
    pub horizon: String,
    /// Range factor of the fee-earning position.  `None` = narrowest range
    /// covering the series' price path widened by `position_buffer`.
    pub range_factor: Option<f64>,
    /// Fractional buffer below the path minimum and above its maximum.
    pub position_buffer: f64,
    /// Other LPs' liquidity.  `None` = share not modelled (1.0).
    pub pool_liquidity: Option<f64>,
}

/// The single immutable configuration value for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub bucket: BucketConfig,
    pub classifier: ClassifierConfig,
    pub vpin: VpinConfig,
    pub range: RangeConfig,
    pub fee: FeeConfig,
    pub invalid_trade_policy: InvalidTradePolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            bucket: BucketConfig {
                volume: None,
                buckets_per_day: DEFAULT_BUCKETS_PER_DAY,
            },
            classifier: ClassifierConfig {
                sigma_window: None,
                min_sigma_samples: DEFAULT_MIN_SIGMA_SAMPLES,
            },
            vpin: VpinConfig {
                horizons: vec![
                    Horizon::days("vpin_daily", 1),
                    Horizon::days("vpin_5day", 5),
                    Horizon::days("vpin_7day", 7),
                ],
            },
            range: RangeConfig {
                reference_price: None,
                range_factors: vec![1.0001, 1.1, 1.5, 2.0, 5.0],
                capital: DEFAULT_CAPITAL,
                grid_size: DEFAULT_GRID_SIZE,
                margin_low: DEFAULT_MARGIN_LOW,
                margin_high: DEFAULT_MARGIN_HIGH,
            },
            fee: FeeConfig {
                base_fee: DEFAULT_BASE_FEE,
                sensitivity: DEFAULT_FEE_SENSITIVITY,
                horizon: "vpin_daily".into(),
                range_factor: None,
                position_buffer: DEFAULT_POSITION_BUFFER,
                pool_liquidity: None,
            },
            invalid_trade_policy: InvalidTradePolicy::Skip,
        }
    }
}

impl RunConfig {
    /// Load the run configuration from environment variables (after dotenv).
    /// Unset keys keep their `Default` value.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // ignore missing .env

        let d = Self::default();

        let horizons = match env::var("VPIN_HORIZON_DAYS") {
            Ok(raw) => parse_list::<usize>("VPIN_HORIZON_DAYS", &raw)?
                .into_iter()
                .map(|days| {
                    let label = if days == 1 { "vpin_daily".to_string() } else { format!("vpin_{days}day") };
                    Horizon::days(label, days)
                })
                .collect(),
            Err(_) => d.vpin.horizons,
        };

        let range_factors = match env::var("RANGE_FACTORS") {
            Ok(raw) => parse_list::<f64>("RANGE_FACTORS", &raw)?,
            Err(_) => d.range.range_factors,
        };

        let invalid_trade_policy = match env::var("INVALID_TRADE_POLICY") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("Config key INVALID_TRADE_POLICY: {e}"))?,
            Err(_) => d.invalid_trade_policy,
        };

        let cfg = Self {
            bucket: BucketConfig {
                volume: parse_env_opt("BUCKET_VOLUME")?,
                buckets_per_day: parse_env("BUCKETS_PER_DAY", d.bucket.buckets_per_day)?,
            },
            classifier: ClassifierConfig {
                sigma_window: parse_env_opt("SIGMA_WINDOW")?,
                min_sigma_samples: parse_env("MIN_SIGMA_SAMPLES", d.classifier.min_sigma_samples)?,
            },
            vpin: VpinConfig { horizons },
            range: RangeConfig {
                reference_price: parse_env_opt("REFERENCE_PRICE")?,
                range_factors,
                capital:     parse_env("LP_CAPITAL",       d.range.capital)?,
                grid_size:   parse_env("GRID_SIZE",        d.range.grid_size)?,
                margin_low:  parse_env("GRID_MARGIN_LOW",  d.range.margin_low)?,
                margin_high: parse_env("GRID_MARGIN_HIGH", d.range.margin_high)?,
            },
            fee: FeeConfig {
                base_fee:        parse_env("BASE_FEE",            d.fee.base_fee)?,
                sensitivity:     parse_env("FEE_SENSITIVITY",     d.fee.sensitivity)?,
                horizon:         env::var("FEE_HORIZON").unwrap_or(d.fee.horizon),
                range_factor:    parse_env_opt("FEE_RANGE_FACTOR")?,
                position_buffer: parse_env("FEE_POSITION_BUFFER", d.fee.position_buffer)?,
                pool_liquidity:  parse_env_opt("POOL_LIQUIDITY")?,
            },
            invalid_trade_policy,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every parameter the stages rely on.  Stage constructors repeat
    /// the checks for their own inputs, so a hand-built config that skips
    /// this still cannot run with degenerate values.
    pub fn validate(&self) -> FlowResult<()> {
        if let Some(v) = self.bucket.volume {
            ensure_positive("bucket_volume", v)?;
        }
        if self.bucket.buckets_per_day == 0 {
            return Err(FlowError::config("buckets_per_day", "must be at least 1"));
        }

        if self.classifier.min_sigma_samples < 2 {
            return Err(FlowError::config(
                "min_sigma_samples",
                "a sample standard deviation needs at least 2 observations",
            ));
        }
        if let Some(w) = self.classifier.sigma_window {
            if w < self.classifier.min_sigma_samples {
                return Err(FlowError::config(
                    "sigma_window",
                    format!("window {w} is smaller than min_sigma_samples {}", self.classifier.min_sigma_samples),
                ));
            }
        }

        if self.vpin.horizons.is_empty() {
            return Err(FlowError::config("vpin_horizons", "at least one horizon is required"));
        }
        for h in &self.vpin.horizons {
            if h.window(self.bucket.buckets_per_day) == 0 {
                return Err(FlowError::config("vpin_horizons", format!("{} has a zero-length window", h.label)));
            }
        }

        if let Some(p0) = self.range.reference_price {
            ensure_positive("reference_price", p0)?;
        }
        if self.range.range_factors.is_empty() {
            return Err(FlowError::config("range_factors", "at least one range factor is required"));
        }
        for &r in &self.range.range_factors {
            ensure_range_factor(r)?;
        }
        ensure_positive("capital", self.range.capital)?;
        ensure_grid(self.range.grid_size, self.range.margin_low, self.range.margin_high)?;

        ensure_non_negative("base_fee", self.fee.base_fee)?;
        ensure_non_negative("fee_sensitivity", self.fee.sensitivity)?;
        if self.horizon_index(&self.fee.horizon).is_none() {
            return Err(FlowError::config(
                "fee_horizon",
                format!("{:?} is not one of the configured VPIN horizons", self.fee.horizon),
            ));
        }
        if let Some(r) = self.fee.range_factor {
            ensure_range_factor(r)?;
        }
        if !self.fee.position_buffer.is_finite() || !(0.0..1.0).contains(&self.fee.position_buffer) {
            return Err(FlowError::config(
                "position_buffer",
                format!("must lie in [0, 1), got {}", self.fee.position_buffer),
            ));
        }
        if let Some(l) = self.fee.pool_liquidity {
            ensure_non_negative("pool_liquidity", l)?;
        }
        Ok(())
    }

    /// (label, window in buckets) for every horizon, in configured order.
    pub fn horizon_windows(&self) -> Vec<(String, usize)> {
        self.vpin
            .horizons
            .iter()
            .map(|h| (h.label.clone(), h.window(self.bucket.buckets_per_day)))
            .collect()
    }

    pub fn horizon_index(&self, label: &str) -> Option<usize> {
        self.vpin.horizons.iter().position(|h| h.label == label)
    }
}

/// Run configuration plus the file locations the binary reads and writes.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub run: RunConfig,
    pub trades_csv: PathBuf,
    pub output_dir: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let run = RunConfig::from_env()?;
        let trades_csv = env::var("TRADES_CSV")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/trades.csv"));
        let output_dir = env::var("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("output"));
        Ok(Self { run, trades_csv, output_dir })
    }
}

// ── Validation helpers (shared with the stage constructors) ──────────────

pub(crate) fn ensure_positive(parameter: &'static str, value: f64) -> FlowResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(FlowError::config(parameter, format!("must be positive and finite, got {value}")));
    }
    Ok(())
}

pub(crate) fn ensure_non_negative(parameter: &'static str, value: f64) -> FlowResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(FlowError::config(parameter, format!("must be non-negative and finite, got {value}")));
    }
    Ok(())
}

pub(crate) fn ensure_range_factor(r: f64) -> FlowResult<()> {
    if !r.is_finite() || r <= 1.0 {
        return Err(FlowError::config("range_factor", format!("must be > 1 for a non-degenerate range, got {r}")));
    }
    Ok(())
}

pub(crate) fn ensure_grid(size: usize, margin_low: f64, margin_high: f64) -> FlowResult<()> {
    if size < 2 {
        return Err(FlowError::config("grid_size", format!("need at least 2 points, got {size}")));
    }
    if !margin_low.is_finite() || margin_low <= 0.0 || margin_low > 1.0 {
        return Err(FlowError::config("margin_low", format!("must lie in (0, 1], got {margin_low}")));
    }
    if !margin_high.is_finite() || margin_high < 1.0 {
        return Err(FlowError::config("margin_high", format!("must be >= 1, got {margin_high}")));
    }
    Ok(())
}

// ── Env parsing ──────────────────────────────────────────────────────────

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn parse_env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        _ => Ok(None),
    }
}

fn parse_list<T>(key: &str, raw: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| anyhow::anyhow!("Config key {key}: {s:?}: {e}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = RunConfig::default();
        cfg.validate().expect("defaults must validate");
        let windows = cfg.horizon_windows();
        assert_eq!(
            windows,
            vec![
                ("vpin_daily".to_string(), 50),
                ("vpin_5day".to_string(), 250),
                ("vpin_7day".to_string(), 350),
            ]
        );
    }

    #[test]
    fn rejects_degenerate_range_factor() {
        let mut cfg = RunConfig::default();
        cfg.range.range_factors = vec![1.0];
        match cfg.validate() {
            Err(FlowError::InvalidConfiguration { parameter, .. }) => assert_eq!(parameter, "range_factor"),
            other => panic!("expected range_factor error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_non_positive_bucket_volume() {
        let mut cfg = RunConfig::default();
        cfg.bucket.volume = Some(0.0);
        assert!(matches!(
            cfg.validate(),
            Err(FlowError::InvalidConfiguration { parameter: "bucket_volume", .. })
        ));
    }

    #[test]
    fn rejects_unknown_fee_horizon() {
        let mut cfg = RunConfig::default();
        cfg.fee.horizon = "vpin_30day".into();
        assert!(matches!(
            cfg.validate(),
            Err(FlowError::InvalidConfiguration { parameter: "fee_horizon", .. })
        ));
    }

    #[test]
    fn rejects_sigma_window_shorter_than_minimum_sample() {
        let mut cfg = RunConfig::default();
        cfg.classifier.sigma_window = Some(cfg.classifier.min_sigma_samples - 1);
        assert!(matches!(
            cfg.validate(),
            Err(FlowError::InvalidConfiguration { parameter: "sigma_window", .. })
        ));
        cfg.classifier.sigma_window = Some(cfg.classifier.min_sigma_samples);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_position_buffer_outside_unit_interval() {
        let mut cfg = RunConfig::default();
        for bad in [1.0, -0.1, f64::NAN] {
            cfg.fee.position_buffer = bad;
            assert!(matches!(
                cfg.validate(),
                Err(FlowError::InvalidConfiguration { parameter: "position_buffer", .. })
            ));
        }
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("ABORT".parse::<InvalidTradePolicy>(), Ok(InvalidTradePolicy::Abort));
        assert_eq!(" skip ".parse::<InvalidTradePolicy>(), Ok(InvalidTradePolicy::Skip));
        assert!("ignore".parse::<InvalidTradePolicy>().is_err());
    }

    #[test]
    fn parse_list_trims_and_skips_blanks() {
        let v: Vec<f64> = parse_list("RANGE_FACTORS", "1.1, 2 ,,5").unwrap();
        assert_eq!(v, vec![1.1, 2.0, 5.0]);
    }
}
