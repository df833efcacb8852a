pub mod trade;
pub mod bucket;
pub mod classifier;
pub mod vpin;
pub mod liquidity;
pub mod fee;

pub use trade::{parse_timestamp, RawTrade, Trade, TradeSeries};
pub use bucket::{bucketize, VolumeBucket, VolumeBucketer};
pub use classifier::{ClassifiedBucket, Classify, OrderFlowClassifier, SigmaEstimator, Split};
pub use vpin::{horizon_points, points_by_horizon, RollingImbalance, VpinEngine, VpinPoint, VpinRow};
pub use liquidity::{sweep_range_factors, GridSpec, LiquidityRangeModel, LpPosition, PathRow, PositionRow, PositionTable};
pub use fee::{FeeRecord, FeeSimulator, FeeSummary, LpShare};
