/// pipeline.rs — Batch run over one trade series
///
/// Wires the stages together and owns nothing between runs.
///
/// ARCHITECTURE
/// ┌─────────────────────────────────────────────────────┐
/// │  TradeSeries (validated, ordered)                   │
/// │        │                          │                 │
/// │        ▼                          ▼                 │
/// │  VolumeBucketer (lazy)      p0 = ref / first price  │
/// │        │                          │                 │
/// │        ▼                          ▼                 │
/// │  Classify (BVC, σ trailing)  LiquidityRangeModel    │
/// │        │                     × range factors        │
/// │        ▼                     (rayon)                │
/// │  closed ClassifiedBuckets         │                 │
/// │        │                          │                 │
/// │        ▼                          │                 │
/// │  VpinEngine × horizons (rows)     │                 │
/// │        │                          │                 │
/// │        ▼                          ▼                 │
/// │  FeeSimulator  ◄──── LP share (fee position, path)  │
/// │        │                                            │
/// │        ▼                                            │
/// │  RunSummary                                         │
/// └─────────────────────────────────────────────────────┘

use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{FlowError, FlowResult};
use crate::metrics::{fee_position_stats, horizon_stats, mean_imbalance, position_stats, RunSummary};
use crate::models::bucket::{VolumeBucket, VolumeBucketer};
use crate::models::classifier::{ClassifiedBucket, Classify, OrderFlowClassifier};
use crate::models::fee::{FeeRecord, FeeSimulator, FeeSummary};
use crate::models::liquidity::{sweep_range_factors, GridSpec, LiquidityRangeModel, PathRow, PositionTable};
use crate::models::trade::TradeSeries;
use crate::models::vpin::{VpinEngine, VpinRow};

/// Output of the order-flow half of a run.
#[derive(Debug, Clone)]
pub struct VpinRun {
    pub bucket_volume:    f64,
    /// Horizon labels, in configured order
    pub labels:           Vec<String>,
    /// Window length in buckets per horizon
    pub windows:          Vec<usize>,
    pub buckets:          Vec<ClassifiedBucket>,
    pub rows:             Vec<VpinRow>,
    /// Under-filled final bucket, excluded from classification
    pub trailing_partial: Option<VolumeBucket>,
}

#[derive(Debug, Clone)]
pub struct FeeRun {
    pub horizon:  String,
    /// Fee-earning position; `None` only when there is no reference price
    pub position: Option<LiquidityRangeModel>,
    /// That position marked along the trade price path
    pub path:     Vec<PathRow>,
    pub records:  Vec<FeeRecord>,
    pub summary:  FeeSummary,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub vpin:            VpinRun,
    pub reference_price: Option<f64>,
    pub positions:       Vec<PositionTable>,
    pub fees:            FeeRun,
    pub summary:         RunSummary,
}

/// V from config, else average daily volume / buckets per day.
pub fn resolve_bucket_volume(series: &TradeSeries, cfg: &RunConfig) -> FlowResult<f64> {
    match cfg.bucket.volume {
        Some(v) => Ok(v),
        None => {
            let v = series.derived_bucket_volume(cfg.bucket.buckets_per_day)?;
            debug!(bucket_volume = v, buckets_per_day = cfg.bucket.buckets_per_day, "derived bucket volume");
            Ok(v)
        }
    }
}

/// p0 from config, else the first trade price.
pub fn reference_price(series: &TradeSeries, cfg: &RunConfig) -> Option<f64> {
    cfg.range.reference_price.or_else(|| series.first_price())
}

pub fn run_vpin(series: &TradeSeries, cfg: &RunConfig) -> FlowResult<VpinRun> {
    let bucket_volume = resolve_bucket_volume(series, cfg)?;
    let bucketer = VolumeBucketer::new(series.trades(), bucket_volume)?;
    let classifier = OrderFlowClassifier::new(&cfg.classifier)?;

    let mut engine = VpinEngine::from_config(cfg)?;
    let (labels, windows): (Vec<String>, Vec<usize>) = cfg.horizon_windows().into_iter().unzip();

    let mut classify = Classify::new(bucketer, classifier);
    let mut buckets: Vec<ClassifiedBucket> = Vec::new();
    let mut rows: Vec<VpinRow> = Vec::new();
    for bucket in classify.by_ref() {
        let bucket = bucket?;
        rows.push(engine.push(&bucket));
        buckets.push(bucket);
    }
    let trailing_partial = classify.trailing_partial().cloned();

    for (label, &w) in labels.iter().zip(&windows) {
        if w > buckets.len() {
            warn!(horizon = %label, window = w, buckets = buckets.len(), "horizon longer than bucket history, no VPIN values");
        }
    }

    info!(
        bucket_volume,
        buckets = buckets.len(),
        low_confidence = buckets.iter().filter(|b| b.low_confidence).count(),
        partial = trailing_partial.is_some(),
        "VPIN run complete"
    );

    Ok(VpinRun { bucket_volume, labels, windows, buckets, rows, trailing_partial })
}

pub fn run_positions(series: &TradeSeries, cfg: &RunConfig) -> FlowResult<Vec<PositionTable>> {
    let grid = GridSpec::from_config(&cfg.range)?;
    let Some(p0) = reference_price(series, cfg) else {
        warn!("no reference price and no trades, skipping LP position sweep");
        return Ok(Vec::new());
    };

    let tables = sweep_range_factors(p0, &cfg.range.range_factors, cfg.range.capital, &grid)?;
    info!(reference_price = p0, range_factors = tables.len(), grid = grid.size, "LP position sweep complete");
    Ok(tables)
}

/// The position whose liquidity earns the fees: the configured fee range
/// factor around p0, else the narrowest range covering the price path
/// widened by the position buffer.
pub fn fee_position(series: &TradeSeries, cfg: &RunConfig) -> FlowResult<Option<LiquidityRangeModel>> {
    let Some(p0) = reference_price(series, cfg) else {
        return Ok(None);
    };
    let model = match cfg.fee.range_factor {
        Some(r) => LiquidityRangeModel::new(p0, r, cfg.range.capital)?,
        None => LiquidityRangeModel::covering(
            p0,
            series.min_price().unwrap_or(p0),
            series.max_price().unwrap_or(p0),
            cfg.fee.position_buffer,
            cfg.range.capital,
        )?,
    };
    debug!(
        range_factor = model.range_factor,
        price_lower = model.price_lower,
        price_upper = model.price_upper,
        "fee position"
    );
    Ok(Some(model))
}

pub fn run_fees(vpin: &VpinRun, series: &TradeSeries, cfg: &RunConfig) -> FlowResult<FeeRun> {
    let position = fee_position(series, cfg)?;
    if cfg.fee.pool_liquidity.is_some() && position.is_none() {
        return Err(FlowError::InsufficientData(
            "pool share needs a reference price but the series has no trades".into(),
        ));
    }
    let path = position.as_ref().map(|m| m.along(series.trades())).unwrap_or_default();

    let simulator = FeeSimulator::from_config(cfg, position)?;
    let records: Vec<FeeRecord> = simulator.simulate(&vpin.rows).collect();
    let summary = FeeSummary::from_records(&records);

    if summary.vpin_unavailable > 0 {
        debug!(records = summary.vpin_unavailable, "base fee charged before VPIN horizon filled");
    }
    info!(
        horizon = %cfg.fee.horizon,
        records = summary.records,
        revenue = summary.total_revenue,
        "fee simulation complete"
    );

    Ok(FeeRun { horizon: cfg.fee.horizon.clone(), position, path, records, summary })
}

/// Validate the configuration, then run every stage.
pub fn run(series: &TradeSeries, cfg: &RunConfig) -> FlowResult<RunReport> {
    cfg.validate()?;
    info!(trades = series.len(), rejected = series.rejected(), "starting run");

    let vpin = run_vpin(series, cfg)?;
    let positions = run_positions(series, cfg)?;
    let fees = run_fees(&vpin, series, cfg)?;
    let reference_price = reference_price(series, cfg);

    let summary = RunSummary {
        trades:                  series.len(),
        rejected_trades:         series.rejected(),
        bucket_volume:           vpin.bucket_volume,
        closed_buckets:          vpin.buckets.len(),
        low_confidence_buckets:  vpin.buckets.iter().filter(|b| b.low_confidence).count(),
        trailing_partial_volume: vpin.trailing_partial.as_ref().map(|b| b.volume),
        mean_order_imbalance:    mean_imbalance(&vpin.rows),
        horizons: vpin
            .labels
            .iter()
            .zip(&vpin.windows)
            .enumerate()
            .map(|(k, (label, &w))| horizon_stats(&vpin.rows, k, label, w))
            .collect(),
        reference_price,
        positions: positions.iter().map(|t| position_stats(t, cfg.range.capital)).collect(),
        fee_horizon: fees.horizon.clone(),
        fee_position: fees.position.as_ref().map(|m| fee_position_stats(m, &fees.path)),
        fees: fees.summary.clone(),
    };

    Ok(RunReport { vpin, reference_price, positions, fees, summary })
}
