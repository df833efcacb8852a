pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod table;

pub use config::{AppConfig, InvalidTradePolicy, RunConfig};
pub use error::{FlowError, FlowResult, TradeDefect};
pub use models::*;
pub use pipeline::{fee_position, run, run_fees, run_positions, run_vpin, FeeRun, RunReport, VpinRun};
