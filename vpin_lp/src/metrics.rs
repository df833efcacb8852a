/// metrics.rs — Run summary statistics
///
/// ─────────────────────────────────────────────────────────────────────────
/// SUMMARY DEFINITIONS
/// ─────────────────────────────────────────────────────────────────────────
///
/// VPIN PER HORIZON h
///   Over the n_h buckets where VPIN(·, h) is defined:
///
///   mean = (1/n_h) Σ VPIN_i,   min, max, last = VPIN at the final bucket
///
///   n_h = max(0, N − h + 1) for N closed buckets.
///
/// ORDER IMBALANCE
///   mean OI = (1/N) Σ |V^B − V^S| / V  over every closed bucket.
///
/// LP POSITION
///   Worst IL = min over the price grid of V(p) − H(p)  (≤ 0)
///   Also reported as a fraction of capital.
///
/// FEES
///   See `FeeSummary`: base revenue, VPIN surcharge, revenue / volume.
/// ─────────────────────────────────────────────────────────────────────────

use serde::Serialize;

use crate::models::fee::FeeSummary;
use crate::models::liquidity::{LiquidityRangeModel, PathRow, PositionTable};
use crate::models::vpin::VpinRow;

/// VPIN distribution over one horizon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HorizonStats {
    pub label:  String,
    /// Window length in buckets
    pub window: usize,
    /// Buckets with a defined VPIN
    pub count:  usize,
    pub mean:   Option<f64>,
    pub min:    Option<f64>,
    pub max:    Option<f64>,
    pub last:   Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionStats {
    pub range_factor:      f64,
    pub price_lower:       f64,
    pub price_upper:       f64,
    pub liquidity:         f64,
    pub worst_il:          f64,
    pub worst_il_fraction: f64,
    pub in_range_points:   usize,
}

/// The fee-earning position marked along the trade path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeePositionStats {
    pub range_factor:  f64,
    pub price_lower:   f64,
    pub price_upper:   f64,
    pub liquidity:     f64,
    pub path_rows:     usize,
    pub in_range_rows: usize,
    pub final_value:   Option<f64>,
    pub worst_il:      Option<f64>,
}

/// Everything the run summary JSON carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub trades:                  usize,
    pub rejected_trades:         usize,
    pub bucket_volume:           f64,
    pub closed_buckets:          usize,
    pub low_confidence_buckets:  usize,
    /// Volume held back in the final under-filled bucket
    pub trailing_partial_volume: Option<f64>,
    pub mean_order_imbalance:    f64,
    pub horizons:                Vec<HorizonStats>,
    pub reference_price:         Option<f64>,
    pub positions:               Vec<PositionStats>,
    pub fee_horizon:             String,
    pub fee_position:            Option<FeePositionStats>,
    pub fees:                    FeeSummary,
}

pub fn horizon_stats(rows: &[VpinRow], index: usize, label: &str, window: usize) -> HorizonStats {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.vpin.get(index).copied().flatten())
        .collect();

    HorizonStats {
        label: label.to_string(),
        window,
        count: values.len(),
        mean: mean(&values),
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
        last: values.last().copied(),
    }
}

pub fn position_stats(table: &PositionTable, capital: f64) -> PositionStats {
    let worst_il = table
        .rows
        .iter()
        .map(|r| r.impermanent_loss)
        .reduce(f64::min)
        .unwrap_or(0.0);

    PositionStats {
        range_factor: table.range_factor,
        price_lower: table.price_lower,
        price_upper: table.price_upper,
        liquidity: table.liquidity,
        worst_il,
        worst_il_fraction: if capital > 0.0 { worst_il / capital } else { 0.0 },
        in_range_points: table.rows.iter().filter(|r| r.in_range).count(),
    }
}

pub fn fee_position_stats(model: &LiquidityRangeModel, path: &[PathRow]) -> FeePositionStats {
    FeePositionStats {
        range_factor:  model.range_factor,
        price_lower:   model.price_lower,
        price_upper:   model.price_upper,
        liquidity:     model.liquidity,
        path_rows:     path.len(),
        in_range_rows: path.iter().filter(|r| r.in_range).count(),
        final_value:   path.last().map(|r| r.position_value),
        worst_il:      path.iter().map(|r| r.impermanent_loss).reduce(f64::min),
    }
}

pub fn mean_imbalance(rows: &[VpinRow]) -> f64 {
    mean(&rows.iter().map(|r| r.order_imbalance).collect::<Vec<_>>()).unwrap_or(0.0)
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".to_string(), |x| format!("{x:.4}"))
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  VPIN / LP RANGE — RUN REPORT")?;
        writeln!(f, "════════════════════════════════════════════")?;
        writeln!(f, "  Trades         : {} ({} rejected)", self.trades, self.rejected_trades)?;
        writeln!(f, "  Bucket Volume  : {:.4}", self.bucket_volume)?;
        writeln!(f, "  Closed Buckets : {}", self.closed_buckets)?;
        writeln!(f, "  Low Confidence : {}", self.low_confidence_buckets)?;
        match self.trailing_partial_volume {
            Some(v) => writeln!(f, "  Partial (excl) : {v:.4}")?,
            None => writeln!(f, "  Partial (excl) : none")?,
        }
        writeln!(f, "  Mean OI        : {:.4}", self.mean_order_imbalance)?;
        writeln!(f, "────────────────────────────────────────────")?;
        for h in &self.horizons {
            writeln!(
                f,
                "  {:<14} : n={:<6} mean={} min={} max={} last={}",
                h.label,
                h.count,
                fmt_opt(h.mean),
                fmt_opt(h.min),
                fmt_opt(h.max),
                fmt_opt(h.last),
            )?;
        }
        writeln!(f, "────────────────────────────────────────────")?;
        writeln!(f, "  Reference p0   : {}", fmt_opt(self.reference_price))?;
        for p in &self.positions {
            writeln!(
                f,
                "  r={:<8} [{:.4}, {:.4}]  worst IL {:.2}%",
                p.range_factor,
                p.price_lower,
                p.price_upper,
                p.worst_il_fraction * 100.0,
            )?;
        }
        writeln!(f, "────────────────────────────────────────────")?;
        writeln!(f, "  Fee Horizon    : {}", self.fee_horizon)?;
        if let Some(p) = &self.fee_position {
            writeln!(
                f,
                "  Fee Position   : r={:.4} [{:.4}, {:.4}]  in range {}/{}",
                p.range_factor, p.price_lower, p.price_upper, p.in_range_rows, p.path_rows,
            )?;
            writeln!(f, "  Path IL (worst): {}", fmt_opt(p.worst_il))?;
        }
        writeln!(f, "  Mean Fee       : {:.4}%", self.fees.mean_fee * 100.0)?;
        writeln!(f, "  Base Revenue   : {:.4}", self.fees.base_revenue)?;
        writeln!(f, "  VPIN Surcharge : {:.4}", self.fees.vpin_surcharge)?;
        writeln!(f, "  Total Revenue  : {:.4}", self.fees.total_revenue)?;
        writeln!(f, "  Revenue / Vol  : {:.4}%", self.fees.revenue_fraction * 100.0)?;
        writeln!(f, "  No VPIN yet    : {}", self.fees.vpin_unavailable)?;
        writeln!(f, "════════════════════════════════════════════")
    }
}

// ── Statistical helpers ───────────────────────────────────────────────────

fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::liquidity::{GridSpec, LiquidityRangeModel};
    use crate::models::trade::{from_unix_seconds, Trade};

    fn row(index: u64, oi: f64, vpin: Vec<Option<f64>>) -> VpinRow {
        VpinRow {
            bucket_index: index,
            bucket_end_ts: from_unix_seconds(index as i64).unwrap(),
            volume: 10.0,
            price_end: 1.0,
            buy_volume: 5.0,
            sell_volume: 5.0,
            order_imbalance: oi,
            low_confidence: false,
            vpin,
        }
    }

    #[test]
    fn horizon_stats_skip_undefined_values() {
        let rows = vec![
            row(0, 0.1, vec![None, None]),
            row(1, 0.3, vec![Some(0.2), None]),
            row(2, 0.5, vec![Some(0.4), Some(0.3)]),
        ];
        let short = horizon_stats(&rows, 0, "short", 2);
        assert_eq!(short.count, 2);
        assert!((short.mean.unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(short.min, Some(0.2));
        assert_eq!(short.max, Some(0.4));
        assert_eq!(short.last, Some(0.4));

        let long = horizon_stats(&rows, 1, "long", 3);
        assert_eq!(long.count, 1);

        assert!((mean_imbalance(&rows) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn empty_horizon_has_no_statistics() {
        let stats = horizon_stats(&[], 0, "vpin_daily", 50);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.mean, None);
        assert_eq!(stats.last, None);
        assert_eq!(mean_imbalance(&[]), 0.0);
    }

    #[test]
    fn worst_il_is_non_positive() {
        let model = LiquidityRangeModel::new(100.0, 2.0, 1_000.0).unwrap();
        let table = model.sweep(&GridSpec::new(52, 0.95, 1.05).unwrap());
        let stats = position_stats(&table, 1_000.0);
        assert!(stats.worst_il < 0.0);
        assert!(stats.worst_il_fraction > -1.0);
        assert!(stats.in_range_points > 0 && stats.in_range_points < 52);
    }

    #[test]
    fn fee_position_stats_follow_the_path() {
        let model = LiquidityRangeModel::new(100.0, 1.21, 1_000.0).unwrap();
        let trades: Vec<Trade> = [100.0, 104.0, 115.0]
            .iter()
            .enumerate()
            .map(|(i, &price)| Trade { ts: from_unix_seconds(i as i64).unwrap(), price, volume: 1.0 })
            .collect();
        let path = model.along(&trades);
        let stats = fee_position_stats(&model, &path);
        assert_eq!(stats.path_rows, 3);
        // 115 lies above p_b = 110
        assert_eq!(stats.in_range_rows, 2);
        assert_eq!(stats.final_value, Some(path[2].position_value));
        assert!(stats.worst_il.unwrap() < 0.0);

        assert_eq!(fee_position_stats(&model, &[]).final_value, None);
    }
}
