// models/liquidity.rs — Concentrated-liquidity (Uniswap V3) range position
//
// ─────────────────────────────────────────────────────────────────────────
// MATHEMATICAL SPECIFICATION
// ─────────────────────────────────────────────────────────────────────────
//
//   Position around reference price p0 with range factor r > 1:
//
//       p_a = p0 / √r,     p_b = p0 · √r
//
//   Token amounts for liquidity L at price p (token0 = base, token1 = quote):
//
//       p ≤ p_a :  x = L·(1/√p_a − 1/√p_b),  y = 0           (all base)
//       p_a<p<p_b: x = L·(1/√p − 1/√p_b),    y = L·(√p − √p_a)
//       p ≥ p_b :  x = 0,                    y = L·(√p_b − √p_a) (all quote)
//
//   Value in quote:  V(p) = x·p + y
//
//   L is solved so that V(p0) = C (capital):
//
//       L = C / [ p0·(1/√p0 − 1/√p_b) + (√p0 − √p_a) ]
//
//   Buy-and-hold baseline keeps the p0 split (x0, y0):
//
//       H(p)  = x0·p + y0
//       IL(p) = V(p) − H(p)        (≤ 0, and exactly 0 at p0)
//
//   Inventory exposure (token0 share):  x·p / V(p)
//
//   As r → 1⁺ the range collapses onto p0 and the position is a single
//   token everywhere except p0 itself.
// ─────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{ensure_grid, ensure_positive, ensure_range_factor, RangeConfig};
use crate::error::{FlowError, FlowResult};
use crate::models::trade::Trade;

/// Below this |price step| the IL/price-impact ratio is reported as 0.
const MIN_PRICE_IMPACT: f64 = 1e-8;

/// Price grid shape: `size` evenly spaced points over
/// [p_a × margin_low, p_b × margin_high].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridSpec {
    pub size:        usize,
    pub margin_low:  f64,
    pub margin_high: f64,
}

impl GridSpec {
    pub fn new(size: usize, margin_low: f64, margin_high: f64) -> FlowResult<Self> {
        ensure_grid(size, margin_low, margin_high)?;
        Ok(Self { size, margin_low, margin_high })
    }

    pub fn from_config(cfg: &RangeConfig) -> FlowResult<Self> {
        Self::new(cfg.grid_size, cfg.margin_low, cfg.margin_high)
    }
}

/// Position snapshot at one price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LpPosition {
    pub range_factor:   f64,
    pub price:          f64,
    pub price_lower:    f64,
    pub price_upper:    f64,
    pub liquidity:      f64,
    pub token0_amount:  f64,
    pub token1_amount:  f64,
    pub value_in_quote: f64,
}

impl LpPosition {
    /// Fraction of value held as token0.
    pub fn token0_share(&self) -> f64 {
        if self.value_in_quote <= 0.0 {
            return 0.0;
        }
        self.token0_amount * self.price / self.value_in_quote
    }

    pub fn in_range(&self) -> bool {
        self.price >= self.price_lower && self.price <= self.price_upper
    }
}

/// One row of the LP position table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionRow {
    pub range_factor:     f64,
    pub price:            f64,
    pub token0_amount:    f64,
    pub token1_amount:    f64,
    pub position_value:   f64,
    pub hold_value:       f64,
    pub impermanent_loss: f64,
    pub token0_share:     f64,
    pub in_range:         bool,
    /// p / p_prior − 1, stepping outward from p0
    pub price_impact:     f64,
    /// V(p) / V(p_prior) − 1
    pub incremental_il:   f64,
    pub il_price_ratio:   f64,
}

/// The position marked at one trade of the observed price path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathRow {
    pub ts:               DateTime<Utc>,
    pub price:            f64,
    pub token0_amount:    f64,
    pub token1_amount:    f64,
    pub position_value:   f64,
    pub hold_value:       f64,
    pub impermanent_loss: f64,
    pub token0_share:     f64,
    pub in_range:         bool,
}

/// Full sweep for one range factor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionTable {
    pub range_factor:    f64,
    pub reference_price: f64,
    pub price_lower:     f64,
    pub price_upper:     f64,
    pub liquidity:       f64,
    pub rows:            Vec<PositionRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LiquidityRangeModel {
    pub reference_price: f64,
    pub range_factor:    f64,
    pub capital:         f64,
    pub price_lower:     f64,
    pub price_upper:     f64,
    pub liquidity:       f64,
    sqrt_lower:          f64,
    sqrt_upper:          f64,
    /// (x0, y0): the split at p0, the buy-and-hold baseline
    initial_token0:      f64,
    initial_token1:      f64,
}

impl LiquidityRangeModel {
    pub fn new(reference_price: f64, range_factor: f64, capital: f64) -> FlowResult<Self> {
        ensure_positive("reference_price", reference_price)?;
        ensure_range_factor(range_factor)?;
        ensure_positive("capital", capital)?;

        let sqrt_r      = range_factor.sqrt();
        let price_lower = reference_price / sqrt_r;
        let price_upper = reference_price * sqrt_r;
        let sqrt_lower  = price_lower.sqrt();
        let sqrt_upper  = price_upper.sqrt();
        let sqrt_p0     = reference_price.sqrt();

        // value of one unit of liquidity at p0
        let unit_value = reference_price * (1.0 / sqrt_p0 - 1.0 / sqrt_upper) + (sqrt_p0 - sqrt_lower);
        if !unit_value.is_finite() || unit_value <= 0.0 {
            return Err(FlowError::config(
                "range_factor",
                format!("range {range_factor} is too narrow to hold value at p0 = {reference_price}"),
            ));
        }
        let liquidity = capital / unit_value;

        let mut model = Self {
            reference_price,
            range_factor,
            capital,
            price_lower,
            price_upper,
            liquidity,
            sqrt_lower,
            sqrt_upper,
            initial_token0: 0.0,
            initial_token1: 0.0,
        };
        let (x0, y0) = model.amounts_at(reference_price);
        model.initial_token0 = x0;
        model.initial_token1 = y0;
        Ok(model)
    }

    /// Narrowest symmetric range around p0 that contains
    /// [min_price × (1 − buffer), max_price × (1 + buffer)].
    pub fn covering(
        reference_price: f64,
        min_price: f64,
        max_price: f64,
        buffer: f64,
        capital: f64,
    ) -> FlowResult<Self> {
        ensure_positive("reference_price", reference_price)?;
        ensure_positive("min_price", min_price)?;
        ensure_positive("max_price", max_price)?;
        if max_price < min_price {
            return Err(FlowError::config("max_price", format!("{max_price} is below min_price {min_price}")));
        }
        if !buffer.is_finite() || !(0.0..1.0).contains(&buffer) {
            return Err(FlowError::config("buffer", format!("must lie in [0, 1), got {buffer}")));
        }

        let lower = min_price * (1.0 - buffer);
        let upper = max_price * (1.0 + buffer);
        let r = (reference_price / lower).powi(2).max((upper / reference_price).powi(2));
        Self::new(reference_price, r, capital)
    }

    /// (token0, token1) held at price p.
    pub fn amounts_at(&self, price: f64) -> (f64, f64) {
        let l = self.liquidity;
        if price <= self.price_lower {
            (l * (1.0 / self.sqrt_lower - 1.0 / self.sqrt_upper), 0.0)
        } else if price >= self.price_upper {
            (0.0, l * (self.sqrt_upper - self.sqrt_lower))
        } else {
            let sqrt_p = price.sqrt();
            (l * (1.0 / sqrt_p - 1.0 / self.sqrt_upper), l * (sqrt_p - self.sqrt_lower))
        }
    }

    pub fn position_at(&self, price: f64) -> LpPosition {
        let (token0_amount, token1_amount) = self.amounts_at(price);
        LpPosition {
            range_factor: self.range_factor,
            price,
            price_lower: self.price_lower,
            price_upper: self.price_upper,
            liquidity: self.liquidity,
            token0_amount,
            token1_amount,
            value_in_quote: token0_amount * price + token1_amount,
        }
    }

    pub fn value_at(&self, price: f64) -> f64 {
        self.position_at(price).value_in_quote
    }

    pub fn hold_value(&self, price: f64) -> f64 {
        self.initial_token0 * price + self.initial_token1
    }

    pub fn impermanent_loss(&self, price: f64) -> f64 {
        self.value_at(price) - self.hold_value(price)
    }

    pub fn in_range(&self, price: f64) -> bool {
        price >= self.price_lower && price <= self.price_upper
    }

    pub fn initial_amounts(&self) -> (f64, f64) {
        (self.initial_token0, self.initial_token1)
    }

    pub fn price_grid(&self, grid: &GridSpec) -> Vec<f64> {
        let lo = self.price_lower * grid.margin_low;
        let hi = self.price_upper * grid.margin_high;
        let n = grid.size.max(2);
        let step = (hi - lo) / (n - 1) as f64;
        (0..n)
            .map(|i| if i == n - 1 { hi } else { lo + step * i as f64 })
            .collect()
    }

    /// Position table over the grid.  Step metrics compare each point with
    /// its neighbour one step closer to p0.
    pub fn sweep(&self, grid: &GridSpec) -> PositionTable {
        let prices = self.price_grid(grid);
        let positions: Vec<LpPosition> = prices.iter().map(|&p| self.position_at(p)).collect();

        let anchor = prices
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                (*a - self.reference_price)
                    .abs()
                    .total_cmp(&(*b - self.reference_price).abs())
            })
            .map_or(0, |(i, _)| i);

        let rows = positions
            .iter()
            .enumerate()
            .map(|(i, pos)| {
                let prior = match i.cmp(&anchor) {
                    std::cmp::Ordering::Equal   => None,
                    std::cmp::Ordering::Greater => Some(&positions[i - 1]),
                    std::cmp::Ordering::Less    => Some(&positions[i + 1]),
                };
                let (price_impact, incremental_il) = match prior {
                    Some(prev) if prev.value_in_quote > 0.0 => (
                        pos.price / prev.price - 1.0,
                        pos.value_in_quote / prev.value_in_quote - 1.0,
                    ),
                    Some(prev) => (pos.price / prev.price - 1.0, 0.0),
                    None => (0.0, 0.0),
                };
                let il_price_ratio = if price_impact.abs() > MIN_PRICE_IMPACT {
                    incremental_il / price_impact
                } else {
                    0.0
                };
                let hold_value = self.hold_value(pos.price);

                PositionRow {
                    range_factor:     self.range_factor,
                    price:            pos.price,
                    token0_amount:    pos.token0_amount,
                    token1_amount:    pos.token1_amount,
                    position_value:   pos.value_in_quote,
                    hold_value,
                    impermanent_loss: pos.value_in_quote - hold_value,
                    token0_share:     pos.token0_share(),
                    in_range:         pos.in_range(),
                    price_impact,
                    incremental_il,
                    il_price_ratio,
                }
            })
            .collect();

        PositionTable {
            range_factor:    self.range_factor,
            reference_price: self.reference_price,
            price_lower:     self.price_lower,
            price_upper:     self.price_upper,
            liquidity:       self.liquidity,
            rows,
        }
    }

    /// Mark the position at every trade price, in trade order.
    pub fn along(&self, trades: &[Trade]) -> Vec<PathRow> {
        trades
            .iter()
            .map(|t| {
                let pos = self.position_at(t.price);
                let hold_value = self.hold_value(t.price);
                PathRow {
                    ts:               t.ts,
                    price:            t.price,
                    token0_amount:    pos.token0_amount,
                    token1_amount:    pos.token1_amount,
                    position_value:   pos.value_in_quote,
                    hold_value,
                    impermanent_loss: pos.value_in_quote - hold_value,
                    token0_share:     pos.token0_share(),
                    in_range:         pos.in_range(),
                }
            })
            .collect()
    }
}

/// Independent position tables for several range factors, swept in
/// parallel.  Output order follows `range_factors`.
pub fn sweep_range_factors(
    reference_price: f64,
    range_factors: &[f64],
    capital: f64,
    grid: &GridSpec,
) -> FlowResult<Vec<PositionTable>> {
    range_factors
        .par_iter()
        .map(|&r| LiquidityRangeModel::new(reference_price, r, capital).map(|m| m.sweep(grid)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const P0: f64 = 2_500.0;
    const CAPITAL: f64 = 10_000.0;

    fn grid() -> GridSpec {
        GridSpec::new(52, 0.95, 1.05).unwrap()
    }

    #[test]
    fn value_at_reference_price_equals_capital() {
        for r in [1.0001, 1.1, 1.5, 2.0, 5.0] {
            let m = LiquidityRangeModel::new(P0, r, CAPITAL).unwrap();
            assert!((m.value_at(P0) - CAPITAL).abs() < 1e-6 * CAPITAL, "r = {r}");
        }
    }

    #[test]
    fn impermanent_loss_is_zero_at_p0_and_never_positive() {
        for r in [1.0001, 1.2, 2.0, 5.0] {
            let m = LiquidityRangeModel::new(P0, r, CAPITAL).unwrap();
            assert!(m.impermanent_loss(P0).abs() < 1e-9 * CAPITAL);
            for row in m.sweep(&grid()).rows {
                assert!(row.impermanent_loss <= 1e-9 * CAPITAL, "r = {r}, p = {}", row.price);
            }
        }
    }

    #[test]
    fn bounds_follow_range_factor() {
        let m = LiquidityRangeModel::new(P0, 4.0, CAPITAL).unwrap();
        assert!((m.price_lower - 1_250.0).abs() < 1e-9);
        assert!((m.price_upper - 5_000.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_holds_a_single_token() {
        let m = LiquidityRangeModel::new(P0, 2.0, CAPITAL).unwrap();
        let below = m.position_at(m.price_lower * 0.5);
        assert!(below.token0_amount > 0.0);
        assert_eq!(below.token1_amount, 0.0);
        assert_eq!(below.token0_share(), 1.0);

        let above = m.position_at(m.price_upper * 2.0);
        assert_eq!(above.token0_amount, 0.0);
        assert!(above.token1_amount > 0.0);

        // exact boundaries take the single-token branch
        assert_eq!(m.amounts_at(m.price_lower).1, 0.0);
        assert_eq!(m.amounts_at(m.price_upper).0, 0.0);
    }

    #[test]
    fn amounts_are_continuous_at_boundaries() {
        let m = LiquidityRangeModel::new(P0, 1.5, CAPITAL).unwrap();
        let inside = m.position_at(m.price_upper * (1.0 - 1e-12));
        let edge = m.position_at(m.price_upper);
        assert!((inside.value_in_quote - edge.value_in_quote).abs() < 1e-6);
    }

    #[test]
    fn narrow_range_collapses_onto_p0() {
        let m = LiquidityRangeModel::new(P0, 1.0001, CAPITAL).unwrap();
        assert!((m.price_upper - m.price_lower) / P0 < 1.1e-4);
        let up = m.position_at(P0 * 1.01);
        let down = m.position_at(P0 * 0.99);
        assert_eq!(up.token0_amount, 0.0);
        assert_eq!(down.token1_amount, 0.0);
        // fully converted either way: value moves like the held token
        assert!((up.value_in_quote - CAPITAL).abs() / CAPITAL < 1e-3);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(matches!(
            LiquidityRangeModel::new(P0, 1.0, CAPITAL),
            Err(FlowError::InvalidConfiguration { parameter: "range_factor", .. })
        ));
        assert!(LiquidityRangeModel::new(P0, 0.5, CAPITAL).is_err());
        assert!(matches!(
            LiquidityRangeModel::new(P0, 2.0, 0.0),
            Err(FlowError::InvalidConfiguration { parameter: "capital", .. })
        ));
        assert!(LiquidityRangeModel::new(-1.0, 2.0, CAPITAL).is_err());
        assert!(GridSpec::new(1, 0.95, 1.05).is_err());
    }

    #[test]
    fn grid_spans_margins_with_fixed_cardinality() {
        let m = LiquidityRangeModel::new(P0, 2.0, CAPITAL).unwrap();
        let prices = m.price_grid(&grid());
        assert_eq!(prices.len(), 52);
        assert!((prices[0] - m.price_lower * 0.95).abs() < 1e-9);
        assert_eq!(*prices.last().unwrap(), m.price_upper * 1.05);
        assert!(prices.windows(2).all(|w| w[1] > w[0]));
        // boundary behaviour is visible on both sides
        let table = m.sweep(&grid());
        assert!(!table.rows.first().unwrap().in_range);
        assert!(!table.rows.last().unwrap().in_range);
    }

    #[test]
    fn token0_share_falls_as_price_rises() {
        let m = LiquidityRangeModel::new(P0, 2.0, CAPITAL).unwrap();
        let table = m.sweep(&grid());
        let shares: Vec<f64> = table.rows.iter().map(|r| r.token0_share).collect();
        assert!(shares.windows(2).all(|w| w[1] <= w[0] + 1e-12));
        assert!((shares[0] - 1.0).abs() < 1e-12);
        assert_eq!(*shares.last().unwrap(), 0.0);
    }

    #[test]
    fn step_metrics_anchor_at_reference_price() {
        let m = LiquidityRangeModel::new(P0, 2.0, CAPITAL).unwrap();
        let table = m.sweep(&grid());
        let anchor = table
            .rows
            .iter()
            .min_by(|a, b| (a.price - P0).abs().total_cmp(&(b.price - P0).abs()))
            .unwrap();
        assert_eq!(anchor.price_impact, 0.0);
        assert_eq!(anchor.incremental_il, 0.0);
        // below p0 steps go down, above p0 steps go up
        for row in &table.rows {
            if row.price < anchor.price {
                assert!(row.price_impact < 0.0);
            } else if row.price > anchor.price {
                assert!(row.price_impact > 0.0);
            }
        }
    }

    #[test]
    fn covering_range_contains_buffered_path() {
        let m = LiquidityRangeModel::covering(P0, 2_300.0, 2_800.0, 0.15, CAPITAL).unwrap();
        assert!(m.price_lower <= 2_300.0 * 0.85 * (1.0 + 1e-9));
        assert!(m.price_upper >= 2_800.0 * 1.15 * (1.0 - 1e-9));
        assert!(m.in_range(2_300.0) && m.in_range(2_800.0));
    }

    #[test]
    fn covering_position_stays_in_range_along_path() {
        use crate::models::trade::from_unix_seconds;

        let trades: Vec<Trade> = [2_450.0, 2_520.0, 2_300.0, 2_800.0, 2_610.0]
            .iter()
            .enumerate()
            .map(|(i, &p)| Trade::new(from_unix_seconds(i as i64).unwrap(), p, 1.0))
            .collect();
        let m = LiquidityRangeModel::covering(2_450.0, 2_300.0, 2_800.0, 0.15, CAPITAL).unwrap();
        let path = m.along(&trades);

        assert_eq!(path.len(), trades.len());
        assert!(path.iter().all(|r| r.in_range));
        assert!(path.iter().all(|r| r.token0_amount > 0.0 && r.token1_amount > 0.0));
        assert!((path[0].position_value - CAPITAL).abs() < 1e-6 * CAPITAL);
        assert!(path[0].impermanent_loss.abs() < 1e-9 * CAPITAL);
        assert_eq!(path[3].ts, trades[3].ts);
        // inventory shifts to token1 as price rises
        assert!(path[3].token0_share < path[2].token0_share);
    }

    #[test]
    fn parallel_sweep_keeps_configured_order() {
        let factors = [5.0, 1.1, 2.0];
        let tables = sweep_range_factors(P0, &factors, CAPITAL, &grid()).unwrap();
        let got: Vec<f64> = tables.iter().map(|t| t.range_factor).collect();
        assert_eq!(got, factors.to_vec());
        assert!(tables.iter().all(|t| t.rows.len() == 52));

        assert!(sweep_range_factors(P0, &[2.0, 1.0], CAPITAL, &grid()).is_err());
    }
}
