// models/fee.rs — VPIN-modulated dynamic fee simulation
//
// ─────────────────────────────────────────────────────────────────────────
// FEE MODEL
// ─────────────────────────────────────────────────────────────────────────
//
//   Per classified bucket j with VPIN v_j on the fee horizon:
//
//       f_j       = f0 · (1 + k · v_j)
//       revenue_j = f_j · V_j · s_j
//
//   s_j is the LP's share of in-range liquidity at the bucket end price:
//
//       s_j = L_pos / (L_pos + L_pool)    if p_a ≤ p_j ≤ p_b
//           = 0                           otherwise
//
//   Before the horizon fills there is no v_j: f0 is charged unmodulated
//   and the record is flagged.  base_revenue_j = f0 · V_j · s_j, so
//   revenue − base_revenue is the informed-flow surcharge.
// ─────────────────────────────────────────────────────────────────────────

use serde::Serialize;

use chrono::{DateTime, Utc};

use crate::config::{ensure_non_negative, RunConfig};
use crate::error::{FlowError, FlowResult};
use crate::models::liquidity::LiquidityRangeModel;
use crate::models::vpin::VpinRow;

/// How much of each bucket's fee flow accrues to the simulated LP.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LpShare {
    /// The LP is the whole pool: share is always 1.
    Unmodeled,
    /// One position competing with `pool_liquidity` of other liquidity.
    Pool {
        position:       LiquidityRangeModel,
        pool_liquidity: f64,
    },
}

impl LpShare {
    pub fn at(&self, price: f64) -> f64 {
        match self {
            LpShare::Unmodeled => 1.0,
            LpShare::Pool { position, pool_liquidity } => {
                if !position.in_range(price) {
                    return 0.0;
                }
                let own = position.liquidity;
                if own + pool_liquidity <= 0.0 {
                    return 0.0;
                }
                own / (own + pool_liquidity)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeRecord {
    pub bucket_index:     u64,
    pub bucket_end_ts:    DateTime<Utc>,
    pub effective_fee:    f64,
    pub revenue:          f64,
    /// `None` when the fee horizon had not filled yet
    pub vpin_value_used:  Option<f64>,
    pub base_fee:         f64,
    pub volume:           f64,
    pub lp_share:         f64,
    pub base_revenue:     f64,
    pub vpin_unavailable: bool,
}

#[derive(Debug, Clone)]
pub struct FeeSimulator {
    base_fee:    f64,
    sensitivity: f64,
    /// Index into `VpinRow::vpin`
    horizon:     usize,
    share:       LpShare,
}

impl FeeSimulator {
    pub fn new(base_fee: f64, sensitivity: f64, horizon: usize, share: LpShare) -> FlowResult<Self> {
        ensure_non_negative("base_fee", base_fee)?;
        ensure_non_negative("fee_sensitivity", sensitivity)?;
        if let LpShare::Pool { pool_liquidity, .. } = share {
            ensure_non_negative("pool_liquidity", pool_liquidity)?;
        }
        Ok(Self { base_fee, sensitivity, horizon, share })
    }

    /// Resolve the fee horizon label and LP share from the run config.
    /// `position` is only consulted when pool liquidity is configured.
    pub fn from_config(cfg: &RunConfig, position: Option<LiquidityRangeModel>) -> FlowResult<Self> {
        let horizon = cfg.horizon_index(&cfg.fee.horizon).ok_or_else(|| {
            FlowError::config(
                "fee_horizon",
                format!("{:?} is not one of the configured VPIN horizons", cfg.fee.horizon),
            )
        })?;
        let share = match (cfg.fee.pool_liquidity, position) {
            (Some(pool_liquidity), Some(position)) => LpShare::Pool { position, pool_liquidity },
            (Some(_), None) => {
                return Err(FlowError::config("pool_liquidity", "an LP position is required to model pool share"));
            }
            (None, _) => LpShare::Unmodeled,
        };
        Self::new(cfg.fee.base_fee, cfg.fee.sensitivity, horizon, share)
    }

    pub fn share(&self) -> &LpShare {
        &self.share
    }

    pub fn effective_fee(&self, vpin: Option<f64>) -> f64 {
        match vpin {
            Some(v) => self.base_fee * (1.0 + self.sensitivity * v),
            None => self.base_fee,
        }
    }

    pub fn record(&self, row: &VpinRow) -> FeeRecord {
        let vpin = row.vpin.get(self.horizon).copied().flatten();
        let effective_fee = self.effective_fee(vpin);
        let lp_share = self.share.at(row.price_end);
        FeeRecord {
            bucket_index:     row.bucket_index,
            bucket_end_ts:    row.bucket_end_ts,
            effective_fee,
            revenue:          effective_fee * row.volume * lp_share,
            vpin_value_used:  vpin,
            base_fee:         self.base_fee,
            volume:           row.volume,
            lp_share,
            base_revenue:     self.base_fee * row.volume * lp_share,
            vpin_unavailable: vpin.is_none(),
        }
    }

    pub fn simulate<'a, I>(&'a self, rows: I) -> impl Iterator<Item = FeeRecord> + 'a
    where
        I: IntoIterator<Item = &'a VpinRow>,
        I::IntoIter: 'a,
    {
        rows.into_iter().map(move |row| self.record(row))
    }
}

/// Totals over a fee record sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeeSummary {
    pub records:           usize,
    pub total_volume:      f64,
    pub base_revenue:      f64,
    pub vpin_surcharge:    f64,
    pub total_revenue:     f64,
    pub mean_fee:          f64,
    /// total_revenue / total_volume
    pub revenue_fraction:  f64,
    pub vpin_unavailable:  usize,
}

impl FeeSummary {
    pub fn from_records(records: &[FeeRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let total_volume: f64 = records.iter().map(|r| r.volume).sum();
        let base_revenue: f64 = records.iter().map(|r| r.base_revenue).sum();
        let total_revenue: f64 = records.iter().map(|r| r.revenue).sum();
        let mean_fee = records.iter().map(|r| r.effective_fee).sum::<f64>() / records.len() as f64;

        Self {
            records: records.len(),
            total_volume,
            base_revenue,
            vpin_surcharge: total_revenue - base_revenue,
            total_revenue,
            mean_fee,
            revenue_fraction: if total_volume > 0.0 { total_revenue / total_volume } else { 0.0 },
            vpin_unavailable: records.iter().filter(|r| r.vpin_unavailable).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trade::from_unix_seconds;

    fn row(index: u64, price_end: f64, vpin: Option<f64>) -> VpinRow {
        VpinRow {
            bucket_index:    index,
            bucket_end_ts:   from_unix_seconds(index as i64).unwrap(),
            volume:          1_000.0,
            price_end,
            buy_volume:      500.0,
            sell_volume:     500.0,
            order_imbalance: 0.0,
            low_confidence:  false,
            vpin:            vec![vpin],
        }
    }

    #[test]
    fn effective_fee_scales_with_vpin() {
        let sim = FeeSimulator::new(0.003, 2.0, 0, LpShare::Unmodeled).unwrap();
        let rec = sim.record(&row(0, 100.0, Some(0.2)));
        assert_eq!(rec.effective_fee, 0.0042);
        assert!((rec.revenue - 4.2).abs() < 1e-12);
        assert!((rec.base_revenue - 3.0).abs() < 1e-12);
        assert_eq!(rec.lp_share, 1.0);
        assert!(!rec.vpin_unavailable);
    }

    #[test]
    fn missing_vpin_falls_back_to_base_fee() {
        let sim = FeeSimulator::new(0.003, 2.0, 0, LpShare::Unmodeled).unwrap();
        let rec = sim.record(&row(0, 100.0, None));
        assert_eq!(rec.effective_fee, 0.003);
        assert_eq!(rec.vpin_value_used, None);
        assert!(rec.vpin_unavailable);
    }

    #[test]
    fn zero_sensitivity_charges_flat_fee() {
        let sim = FeeSimulator::new(0.0005, 0.0, 0, LpShare::Unmodeled).unwrap();
        assert_eq!(sim.effective_fee(Some(0.9)), 0.0005);
    }

    #[test]
    fn pool_share_is_zero_out_of_range() {
        let position = LiquidityRangeModel::new(100.0, 2.0, 10_000.0).unwrap();
        let share = LpShare::Pool { position, pool_liquidity: position.liquidity };
        let sim = FeeSimulator::new(0.003, 1.0, 0, share).unwrap();

        let inside = sim.record(&row(0, 100.0, Some(0.5)));
        assert!((inside.lp_share - 0.5).abs() < 1e-12);

        let outside = sim.record(&row(1, 200.0, Some(0.5)));
        assert_eq!(outside.lp_share, 0.0);
        assert_eq!(outside.revenue, 0.0);
        assert!(outside.effective_fee > 0.003);
    }

    #[test]
    fn negative_parameters_are_rejected() {
        assert!(matches!(
            FeeSimulator::new(-0.001, 1.0, 0, LpShare::Unmodeled),
            Err(FlowError::InvalidConfiguration { parameter: "base_fee", .. })
        ));
        assert!(FeeSimulator::new(0.001, -1.0, 0, LpShare::Unmodeled).is_err());
        let position = LiquidityRangeModel::new(100.0, 2.0, 10_000.0).unwrap();
        assert!(FeeSimulator::new(0.001, 1.0, 0, LpShare::Pool { position, pool_liquidity: -1.0 }).is_err());
    }

    #[test]
    fn unknown_fee_horizon_is_rejected() {
        let mut cfg = RunConfig::default();
        cfg.fee.horizon = "vpin_hourly".into();
        assert!(matches!(
            FeeSimulator::from_config(&cfg, None),
            Err(FlowError::InvalidConfiguration { parameter: "fee_horizon", .. })
        ));
    }

    #[test]
    fn summary_splits_surcharge_from_base() {
        let sim = FeeSimulator::new(0.001, 1.0, 0, LpShare::Unmodeled).unwrap();
        let rows = vec![row(0, 100.0, None), row(1, 100.0, Some(0.5)), row(2, 100.0, Some(1.0))];
        let records: Vec<FeeRecord> = sim.simulate(&rows).collect();
        let summary = FeeSummary::from_records(&records);

        assert_eq!(summary.records, 3);
        assert_eq!(summary.vpin_unavailable, 1);
        assert!((summary.total_volume - 3_000.0).abs() < 1e-9);
        assert!((summary.base_revenue - 3.0).abs() < 1e-9);
        // 1.0 + 1.5 + 2.0
        assert!((summary.total_revenue - 4.5).abs() < 1e-9);
        assert!((summary.vpin_surcharge - 1.5).abs() < 1e-9);
        assert!((summary.revenue_fraction - 0.0015).abs() < 1e-12);
        assert!((summary.mean_fee - 0.0015).abs() < 1e-12);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        assert_eq!(FeeSummary::from_records(&[]), FeeSummary::default());
    }
}
