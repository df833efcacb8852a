/// error.rs — Error taxonomy for the VPIN / LP pipeline
///
/// Configuration errors are fatal for the parameter set that produced them.
/// Trade errors are raised only under `InvalidTradePolicy::Abort`; under the
/// default skip policy the record is dropped and logged instead.
/// Insufficient data normally degrades the output (empty VPIN series, 50/50
/// classification, unmodulated fee) and is only an error where no sensible
/// degradation exists.
use thiserror::Error;

pub type FlowResult<T> = Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid configuration for {parameter}: {reason}")]
    InvalidConfiguration {
        parameter: &'static str,
        reason: String,
    },

    #[error("invalid trade at row {index}: {defect}")]
    InvalidTrade { index: usize, defect: TradeDefect },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("table error: {0}")]
    Table(#[from] polars::error::PolarsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    pub fn config(parameter: &'static str, reason: impl Into<String>) -> Self {
        FlowError::InvalidConfiguration {
            parameter,
            reason: reason.into(),
        }
    }
}

/// Why a trade row was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TradeDefect {
    #[error("non-positive or non-finite price {0}")]
    BadPrice(f64),

    #[error("negative or non-finite volume {0}")]
    BadVolume(f64),

    #[error("timestamp {ts} precedes previous trade at {prev}")]
    OutOfOrder { ts: String, prev: String },

    #[error("unparseable timestamp {0:?}")]
    BadTimestamp(String),

    #[error("missing value in column {0}")]
    Missing(&'static str),
}
