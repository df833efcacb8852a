/// table.rs — CSV exchange layer (polars DataFrames)
///
/// Input:  trades CSV {timestamp, price, volume}
/// Output: VPIN table, LP position table, fee-position path table, fee table,
///         run summary JSON
use std::fs;
use std::path::Path;

use polars::prelude::*;
use tracing::info;

use crate::config::InvalidTradePolicy;
use crate::error::{FlowResult, TradeDefect};
use crate::metrics::RunSummary;
use crate::models::fee::FeeRecord;
use crate::models::liquidity::{PathRow, PositionTable};
use crate::models::trade::{parse_timestamp, RawTrade, TradeSeries};
use crate::pipeline::VpinRun;

// ── Input ────────────────────────────────────────────────────────────────

/// Load a trades CSV and validate it under `policy`.
///
/// Timestamps may be text (RFC 3339, `YYYY-MM-DD HH:MM:SS`) or integer
/// Unix seconds.  Null or unparseable cells make the row an invalid trade.
pub fn read_trades(path: &Path, policy: InvalidTradePolicy) -> FlowResult<TradeSeries> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    info!(path = %path.display(), rows = df.height(), "trades CSV loaded");
    trades_from_frame(&df, policy)
}

pub fn trades_from_frame(df: &DataFrame, policy: InvalidTradePolicy) -> FlowResult<TradeSeries> {
    let ts = df.column("timestamp")?.cast(&DataType::String)?;
    let price = df.column("price")?.cast(&DataType::Float64)?;
    let volume = df.column("volume")?.cast(&DataType::Float64)?;

    let ts = ts.as_materialized_series().str()?;
    let price = price.as_materialized_series().f64()?;
    let volume = volume.as_materialized_series().f64()?;

    let rows = ts
        .into_iter()
        .zip(price.into_iter())
        .zip(volume.into_iter())
        .map(|((ts, price), volume)| -> Result<RawTrade, TradeDefect> {
            Ok(RawTrade {
                ts:     parse_timestamp(ts.ok_or(TradeDefect::Missing("timestamp"))?)?,
                price:  price.ok_or(TradeDefect::Missing("price"))?,
                volume: volume.ok_or(TradeDefect::Missing("volume"))?,
            })
        });

    TradeSeries::ingest_rows(rows, policy)
}

// ── Output frames ────────────────────────────────────────────────────────

pub fn vpin_frame(run: &VpinRun) -> FlowResult<DataFrame> {
    let rows = &run.rows;
    let mut columns: Vec<Column> = vec![
        Column::new("bucket_index".into(), rows.iter().map(|r| r.bucket_index).collect::<Vec<_>>()),
        Column::new(
            "bucket_end_timestamp".into(),
            rows.iter().map(|r| r.bucket_end_ts.to_rfc3339()).collect::<Vec<_>>(),
        ),
    ];
    for (k, label) in run.labels.iter().enumerate() {
        let values: Vec<Option<f64>> = rows.iter().map(|r| r.vpin.get(k).copied().flatten()).collect();
        columns.push(Column::new(label.as_str().into(), values));
    }
    columns.extend([
        Column::new("buy_volume".into(), rows.iter().map(|r| r.buy_volume).collect::<Vec<_>>()),
        Column::new("sell_volume".into(), rows.iter().map(|r| r.sell_volume).collect::<Vec<_>>()),
        Column::new("order_imbalance".into(), rows.iter().map(|r| r.order_imbalance).collect::<Vec<_>>()),
        Column::new("low_confidence".into(), rows.iter().map(|r| r.low_confidence).collect::<Vec<_>>()),
    ]);
    Ok(DataFrame::new(columns)?)
}

/// All range factors stacked into one long table.
pub fn position_frame(tables: &[PositionTable]) -> FlowResult<DataFrame> {
    let rows: Vec<_> = tables.iter().flat_map(|t| t.rows.iter()).collect();
    let df = df!(
        "range_factor"     => rows.iter().map(|r| r.range_factor).collect::<Vec<_>>(),
        "price"            => rows.iter().map(|r| r.price).collect::<Vec<_>>(),
        "token0_amount"    => rows.iter().map(|r| r.token0_amount).collect::<Vec<_>>(),
        "token1_amount"    => rows.iter().map(|r| r.token1_amount).collect::<Vec<_>>(),
        "position_value"   => rows.iter().map(|r| r.position_value).collect::<Vec<_>>(),
        "hold_value"       => rows.iter().map(|r| r.hold_value).collect::<Vec<_>>(),
        "impermanent_loss" => rows.iter().map(|r| r.impermanent_loss).collect::<Vec<_>>(),
        "token0_share"     => rows.iter().map(|r| r.token0_share).collect::<Vec<_>>(),
        "in_range"         => rows.iter().map(|r| r.in_range).collect::<Vec<_>>(),
        "price_impact"     => rows.iter().map(|r| r.price_impact).collect::<Vec<_>>(),
        "incremental_il"   => rows.iter().map(|r| r.incremental_il).collect::<Vec<_>>(),
        "il_price_ratio"   => rows.iter().map(|r| r.il_price_ratio).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

/// The fee-earning position marked at every trade, with its inventory mix.
pub fn path_frame(path: &[PathRow]) -> FlowResult<DataFrame> {
    let df = df!(
        "timestamp"        => path.iter().map(|r| r.ts.to_rfc3339()).collect::<Vec<_>>(),
        "price"            => path.iter().map(|r| r.price).collect::<Vec<_>>(),
        "token0_amount"    => path.iter().map(|r| r.token0_amount).collect::<Vec<_>>(),
        "token1_amount"    => path.iter().map(|r| r.token1_amount).collect::<Vec<_>>(),
        "position_value"   => path.iter().map(|r| r.position_value).collect::<Vec<_>>(),
        "hold_value"       => path.iter().map(|r| r.hold_value).collect::<Vec<_>>(),
        "impermanent_loss" => path.iter().map(|r| r.impermanent_loss).collect::<Vec<_>>(),
        "token0_share"     => path.iter().map(|r| r.token0_share).collect::<Vec<_>>(),
        "in_range"         => path.iter().map(|r| r.in_range).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

pub fn fee_frame(records: &[FeeRecord]) -> FlowResult<DataFrame> {
    let df = df!(
        "bucket_index"         => records.iter().map(|r| r.bucket_index).collect::<Vec<_>>(),
        "bucket_end_timestamp" => records.iter().map(|r| r.bucket_end_ts.to_rfc3339()).collect::<Vec<_>>(),
        "effective_fee"        => records.iter().map(|r| r.effective_fee).collect::<Vec<_>>(),
        "revenue"              => records.iter().map(|r| r.revenue).collect::<Vec<_>>(),
        "vpin_value_used"      => records.iter().map(|r| r.vpin_value_used).collect::<Vec<_>>(),
        "base_fee"             => records.iter().map(|r| r.base_fee).collect::<Vec<_>>(),
        "volume"               => records.iter().map(|r| r.volume).collect::<Vec<_>>(),
        "lp_share"             => records.iter().map(|r| r.lp_share).collect::<Vec<_>>(),
        "base_revenue"         => records.iter().map(|r| r.base_revenue).collect::<Vec<_>>(),
        "vpin_unavailable"     => records.iter().map(|r| r.vpin_unavailable).collect::<Vec<_>>(),
    )?;
    Ok(df)
}

// ── Writers ──────────────────────────────────────────────────────────────

pub fn write_csv(df: &mut DataFrame, path: &Path) -> FlowResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = fs::File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    info!(path = %path.display(), rows = df.height(), "table written");
    Ok(())
}

pub fn write_summary(summary: &RunSummary, path: &Path) -> FlowResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(file, summary)?;
    info!(path = %path.display(), "run summary written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::error::FlowError;
    use crate::pipeline::run;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vpin_lp_{}_{name}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_text_timestamps_and_skips_bad_rows() {
        let dir = scratch("text_ts");
        let path = dir.join("trades.csv");
        fs::write(
            &path,
            "timestamp,price,volume\n\
             2025-05-19 00:29:00,2500.5,1.25\n\
             2025-05-19T00:30:00Z,-1.0,2.0\n\
             not a time,2501.0,2.0\n\
             2025-05-19 00:31:00,2502.0,\n\
             2025-05-19 00:32:00,2503.0,3.0\n",
        )
        .unwrap();

        let series = read_trades(&path, InvalidTradePolicy::Skip).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.rejected(), 3);
        assert_eq!(series.first_price(), Some(2500.5));

        assert!(matches!(
            read_trades(&path, InvalidTradePolicy::Abort),
            Err(FlowError::InvalidTrade { index: 1, .. })
        ));
    }

    #[test]
    fn reads_integer_unix_seconds() {
        let df = df!(
            "timestamp" => [1_747_614_540i64, 1_747_614_600],
            "price"     => [10.0, 11.0],
            "volume"    => [1i64, 2],
        )
        .unwrap();
        let series = trades_from_frame(&df, InvalidTradePolicy::Abort).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.total_volume(), 3.0);
        assert_eq!(series.trades()[0].ts.to_rfc3339(), "2025-05-19T00:29:00+00:00");
    }

    #[test]
    fn missing_column_is_a_table_error() {
        let df = df!("timestamp" => ["2025-05-19 00:29:00"], "price" => [1.0]).unwrap();
        assert!(matches!(
            trades_from_frame(&df, InvalidTradePolicy::Skip),
            Err(FlowError::Table(_))
        ));
    }

    #[test]
    fn output_frames_have_declared_columns() {
        let rows: Vec<RawTrade> = (0..400)
            .map(|i| RawTrade {
                ts: crate::models::trade::from_unix_seconds(1_747_612_800 + 30 * i).unwrap(),
                price: 100.0 + ((i * 7) % 13) as f64 * 0.1,
                volume: 1.0 + (i % 3) as f64,
            })
            .collect();
        let series = TradeSeries::ingest(rows, InvalidTradePolicy::Abort).unwrap();
        let mut cfg = RunConfig::default();
        cfg.bucket.volume = Some(10.0);
        let report = run(&series, &cfg).unwrap();

        let vpin = vpin_frame(&report.vpin).unwrap();
        let names: Vec<String> = vpin.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            [
                "bucket_index", "bucket_end_timestamp", "vpin_daily", "vpin_5day", "vpin_7day",
                "buy_volume", "sell_volume", "order_imbalance", "low_confidence",
            ]
        );
        assert_eq!(vpin.height(), report.vpin.rows.len());
        // first 49 buckets precede the daily window
        assert_eq!(vpin.column("vpin_daily").unwrap().null_count(), 49);

        let positions = position_frame(&report.positions).unwrap();
        assert_eq!(positions.height(), cfg.range.range_factors.len() * cfg.range.grid_size);
        assert_eq!(positions.width(), 12);

        let path = path_frame(&report.fees.path).unwrap();
        assert_eq!(path.height(), series.len());
        assert_eq!(path.width(), 9);
        // default fee position covers the whole path
        assert!(path.column("in_range").unwrap().bool().unwrap().into_iter().all(|b| b == Some(true)));

        let fees = fee_frame(&report.fees.records).unwrap();
        assert_eq!(fees.height(), report.fees.records.len());
        assert_eq!(fees.width(), 10);

        let dir = scratch("outputs");
        write_csv(&mut fees.clone(), &dir.join("fees.csv")).unwrap();
        write_summary(&report.summary, &dir.join("run_summary.json")).unwrap();
        let json = fs::read_to_string(dir.join("run_summary.json")).unwrap();
        assert!(json.contains("\"bucket_volume\": 10.0"));
    }
}
