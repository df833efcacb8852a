/// main.rs — Batch entry point
///
/// Runs one VPIN / LP range analysis:
///   1. Load config from .env
///   2. Read and validate the trades CSV
///   3. Bucket, classify, roll VPIN; sweep LP ranges; simulate fees
///   4. Write the four tables and the run summary, print the report
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpin_lp::config::AppConfig;
use vpin_lp::pipeline::run;
use vpin_lp::table::{fee_frame, path_frame, position_frame, read_trades, vpin_frame, write_csv, write_summary};

fn main() -> Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║   VPIN  +  CONCENTRATED-LIQUIDITY LP MODEL   ║");
    info!("╚══════════════════════════════════════════════╝");

    // ── Config ───────────────────────────────────────────────────────────
    let cfg = AppConfig::from_env()?;
    let run_cfg = &cfg.run;
    info!(
        "Buckets: volume={:?} per_day={}  σ window={:?} min_samples={}",
        run_cfg.bucket.volume,
        run_cfg.bucket.buckets_per_day,
        run_cfg.classifier.sigma_window,
        run_cfg.classifier.min_sigma_samples,
    );
    info!(
        "Ranges: factors={:?} capital={} grid={}",
        run_cfg.range.range_factors, run_cfg.range.capital, run_cfg.range.grid_size
    );
    info!(
        "Fees:   f0={:.4}% k={} horizon={} range={:?} buffer={}",
        run_cfg.fee.base_fee * 100.0,
        run_cfg.fee.sensitivity,
        run_cfg.fee.horizon,
        run_cfg.fee.range_factor,
        run_cfg.fee.position_buffer,
    );

    // ── Load Trades ──────────────────────────────────────────────────────
    let series = read_trades(&cfg.trades_csv, run_cfg.invalid_trade_policy)
        .with_context(|| format!("reading trades from {}", cfg.trades_csv.display()))?;
    if series.is_empty() {
        anyhow::bail!("No valid trades in {}.", cfg.trades_csv.display());
    }
    if let Some((first, last)) = series.span() {
        info!("Loaded {} trades  ({} → {})", series.len(), first, last);
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let report = run(&series, run_cfg)?;

    // ── Write Outputs ────────────────────────────────────────────────────
    let out = &cfg.output_dir;
    write_csv(&mut vpin_frame(&report.vpin)?, &out.join("vpin.csv"))?;
    write_csv(&mut position_frame(&report.positions)?, &out.join("lp_positions.csv"))?;
    write_csv(&mut path_frame(&report.fees.path)?, &out.join("lp_path.csv"))?;
    write_csv(&mut fee_frame(&report.fees.records)?, &out.join("fees.csv"))?;
    write_summary(&report.summary, &out.join("run_summary.json"))?;

    // ── Print Report ─────────────────────────────────────────────────────
    println!("\n{}", report.summary);

    Ok(())
}
