//! Quota aggregation and prediction.
//!
//! Per-model samples are folded into configured groups (most restrictive
//! member wins), the group being consumed is tracked as "active", and a
//! rolling history drives usage buckets and a runway prediction.

mod groups;
mod history;
mod prediction;
mod view_model;

pub use groups::{default_groups, GroupStrategy, QuotaGroup, DEFAULT_COLOR};
pub use history::{max_usage, HistoryPoint, QuotaHistory, UsageBucket, UsageItem};
pub use prediction::{predict, runway, usage_rate, Prediction, QUOTA_RESET_HOURS, STABLE};
pub use view_model::{
    aggregate_groups, detect_active_group, ChartBucket, ChartItem, DisplayItemKind,
    QuotaDisplayItem, QuotaGroupState, QuotaViewModel, QuotaViewState, Severity,
    StatusBarData, StatusBarGroupItem, UsageChartData, ViewMode, ViewOptions,
    ACTIVE_GROUP_THRESHOLD,
};
