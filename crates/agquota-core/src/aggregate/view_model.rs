//! Quota view model: group aggregation, active-group tracking, and the
//! display records handed to the presentation layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::groups::{GroupStrategy, DEFAULT_COLOR};
use super::history::{max_usage, QuotaHistory, UsageBucket};
use super::prediction::{predict, Prediction, STABLE};
use crate::quota::QuotaSnapshot;
use crate::utils::round_percentage;

/// Minimum drop (percentage points) that counts as real consumption
pub const ACTIVE_GROUP_THRESHOLD: f64 = 0.1;

/// Group shown as a placeholder when nothing has data
const UNKNOWN_GROUP: &str = "unknown";

/// Reset text for groups without data
const NO_RESET: &str = "N/A";

/// Aggregated quota of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaGroupState {
    pub id: String,
    pub label: String,
    /// Minimum remaining percentage across member models
    pub remaining: f64,
    /// Countdown of the model holding the minimum
    pub reset_time: String,
    pub theme_color: String,
    pub has_data: bool,
}

/// Persistable view state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaViewState {
    pub groups: Vec<QuotaGroupState>,
    pub active_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

impl QuotaViewState {
    pub fn group(&self, id: &str) -> Option<&QuotaGroupState> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Remaining percentage of the active group, 0 when unknown
    pub fn active_remaining(&self) -> f64 {
        self.group(&self.active_group_id)
            .map(|g| g.remaining)
            .unwrap_or(0.0)
    }
}

/// How the quota list is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Groups,
    Models,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayItemKind {
    Group,
    Model,
}

/// One row of the quota list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDisplayItem {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: DisplayItemKind,
    pub remaining: f64,
    pub reset_time: String,
    pub has_data: bool,
    pub theme_color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartItem {
    pub group_id: String,
    pub usage: f64,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartBucket {
    pub start_time: i64,
    pub end_time: i64,
    pub items: Vec<ChartItem>,
}

/// Usage chart bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageChartData {
    pub buckets: Vec<ChartBucket>,
    pub max_usage: f64,
    pub group_colors: BTreeMap<String, String>,
    pub display_minutes: u64,
    pub interval_secs: u64,
    pub prediction: Option<Prediction>,
}

impl Default for UsageChartData {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            max_usage: 1.0,
            group_colors: BTreeMap::new(),
            display_minutes: 0,
            interval_secs: 0,
            prediction: None,
        }
    }
}

/// Status bar entry for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBarGroupItem {
    pub id: String,
    pub label: String,
    pub short_label: String,
    pub percentage: u8,
    pub reset_time: String,
    pub color: String,
    pub usage_rate: f64,
    pub runway: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBarData {
    pub primary: StatusBarGroupItem,
    pub all_groups: Vec<StatusBarGroupItem>,
}

/// Status severity from the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn classify(percentage: f64, warning_threshold: f64, critical_threshold: f64) -> Self {
        if percentage <= critical_threshold {
            Severity::Critical
        } else if percentage <= warning_threshold {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }
}

/// Presentation options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewOptions {
    pub view_mode: ViewMode,
    pub history_range_minutes: u64,
    pub refresh_secs: u64,
    pub include_secondary_models: bool,
    /// Group hidden from model lists and charts unless secondary models are included
    pub secondary_group: String,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            view_mode: ViewMode::Groups,
            history_range_minutes: 90,
            refresh_secs: 120,
            include_secondary_models: false,
            secondary_group: "gpt".to_string(),
        }
    }
}

impl ViewOptions {
    fn hidden_group(&self) -> Option<&str> {
        if self.include_secondary_models {
            None
        } else {
            Some(self.secondary_group.as_str())
        }
    }

    fn bucket_minutes(&self) -> f64 {
        self.refresh_secs as f64 / 60.0
    }
}

/// Aggregate a snapshot into one state per configured group.
///
/// A group takes the minimum remaining percentage among its members and
/// the countdown of that same member.
pub fn aggregate_groups(strategy: &GroupStrategy, snapshot: &QuotaSnapshot) -> Vec<QuotaGroupState> {
    strategy
        .groups()
        .iter()
        .map(|group| {
            let min_model = snapshot
                .models
                .iter()
                .filter(|m| strategy.group_for_model(&m.model_id, &m.label).id == group.id)
                .min_by(|a, b| a.remaining_percentage.total_cmp(&b.remaining_percentage));

            match min_model {
                Some(model) => QuotaGroupState {
                    id: group.id.clone(),
                    label: group.label.clone(),
                    remaining: model.remaining_percentage,
                    reset_time: model.time_until_reset.clone(),
                    theme_color: group.theme_color.clone(),
                    has_data: true,
                },
                None => QuotaGroupState {
                    id: group.id.clone(),
                    label: group.label.clone(),
                    remaining: 0.0,
                    reset_time: NO_RESET.to_string(),
                    theme_color: group.theme_color.clone(),
                    has_data: false,
                },
            }
        })
        .collect()
}

/// Group with the largest drop above [`ACTIVE_GROUP_THRESHOLD`], else the
/// previously active group.
pub fn detect_active_group(previous: &QuotaViewState, groups: &[QuotaGroupState]) -> String {
    let mut max_drop = 0.0;
    let mut active = previous.active_group_id.clone();

    for group in groups.iter().filter(|g| g.has_data) {
        let Some(prev) = previous.group(&group.id).filter(|p| p.has_data) else {
            continue;
        };
        let drop = prev.remaining - group.remaining;
        if drop > max_drop && drop > ACTIVE_GROUP_THRESHOLD {
            max_drop = drop;
            active = group.id.clone();
        }
    }

    active
}

/// Stateful view model fed by quota snapshots
#[derive(Debug, Clone)]
pub struct QuotaViewModel {
    strategy: GroupStrategy,
    options: ViewOptions,
    state: QuotaViewState,
    chart: UsageChartData,
    display_items: Vec<QuotaDisplayItem>,
    last_snapshot: Option<QuotaSnapshot>,
    history: QuotaHistory,
}

impl QuotaViewModel {
    pub fn new(strategy: GroupStrategy, options: ViewOptions, history: QuotaHistory) -> Self {
        let active_group_id = strategy
            .groups()
            .first()
            .map(|g| g.id.clone())
            .unwrap_or_default();
        Self {
            strategy,
            options,
            state: QuotaViewState {
                groups: Vec::new(),
                active_group_id,
                last_updated: None,
            },
            chart: UsageChartData::default(),
            display_items: Vec::new(),
            last_snapshot: None,
            history,
        }
    }

    pub fn state(&self) -> &QuotaViewState {
        &self.state
    }

    pub fn history(&self) -> &QuotaHistory {
        &self.history
    }

    pub fn options(&self) -> &ViewOptions {
        &self.options
    }

    pub fn strategy(&self) -> &GroupStrategy {
        &self.strategy
    }

    pub fn last_snapshot(&self) -> Option<&QuotaSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn display_items(&self) -> &[QuotaDisplayItem] {
        &self.display_items
    }

    pub fn prediction(&self) -> Option<&Prediction> {
        self.chart.prediction.as_ref()
    }

    /// Whether any quota data has been loaded or restored
    pub fn has_data(&self) -> bool {
        self.state.groups.iter().any(|g| g.has_data)
    }

    /// Apply a new snapshot: aggregate, detect the active group, record
    /// history, and rebuild chart and display items.
    pub fn update_from_snapshot(&mut self, snapshot: QuotaSnapshot, now_ms: i64) -> &QuotaViewState {
        let groups = aggregate_groups(&self.strategy, &snapshot);
        let active_group_id = detect_active_group(&self.state, &groups);
        if active_group_id != self.state.active_group_id {
            debug!(
                "Active group changed: {} -> {}",
                self.state.active_group_id, active_group_id
            );
        }

        let usage: BTreeMap<String, f64> = groups
            .iter()
            .filter(|g| g.has_data)
            .map(|g| (g.id.clone(), g.remaining))
            .collect();
        self.history.record(usage, now_ms);

        self.last_snapshot = Some(snapshot);
        self.state = QuotaViewState {
            groups,
            active_group_id,
            last_updated: Some(now_ms),
        };
        self.rebuild(now_ms);
        &self.state
    }

    /// Restore a previously persisted state and rebuild the chart from
    /// history. Returns false when there is nothing to restore.
    pub fn restore(
        &mut self,
        cached: Option<QuotaViewState>,
        snapshot: Option<QuotaSnapshot>,
        now_ms: i64,
    ) -> bool {
        let Some(cached) = cached else {
            return false;
        };
        self.state = cached;
        self.last_snapshot = snapshot;
        self.rebuild(now_ms);
        true
    }

    /// Change presentation options and re-render from cached data
    pub fn set_options(&mut self, options: ViewOptions, now_ms: i64) {
        self.history
            .set_retention(options.history_range_minutes, now_ms);
        self.options = options;
        self.rebuild(now_ms);
    }

    /// Replace the group configuration, re-aggregating the last snapshot
    pub fn set_strategy(&mut self, strategy: GroupStrategy, now_ms: i64) {
        self.strategy = strategy;
        if let Some(snapshot) = &self.last_snapshot {
            let groups = aggregate_groups(&self.strategy, snapshot);
            if self.strategy.group(&self.state.active_group_id).is_none() {
                self.state.active_group_id = groups
                    .first()
                    .map(|g| g.id.clone())
                    .unwrap_or_default();
            }
            self.state.groups = groups;
        }
        self.rebuild(now_ms);
    }

    fn rebuild(&mut self, now_ms: i64) {
        self.chart = self.build_chart(now_ms);
        self.display_items = self.build_display_items();
    }

    fn build_chart(&self, now_ms: i64) -> UsageChartData {
        let buckets = self.history.usage_buckets(
            self.options.history_range_minutes,
            self.options.bucket_minutes(),
            now_ms,
        );

        let group_colors: BTreeMap<String, String> = self
            .strategy
            .groups()
            .iter()
            .map(|g| (g.id.clone(), g.theme_color.clone()))
            .collect();

        let active = &self.state.active_group_id;
        let label = self
            .strategy
            .group(active)
            .map(|g| g.label.clone())
            .unwrap_or_else(|| active.clone());
        let prediction = predict(
            &buckets,
            active,
            &label,
            self.state.active_remaining(),
            self.options.history_range_minutes,
        );

        UsageChartData {
            max_usage: max_usage(&buckets),
            buckets: buckets
                .into_iter()
                .map(|b| color_bucket(b, &group_colors))
                .collect(),
            group_colors,
            display_minutes: self.options.history_range_minutes,
            interval_secs: self.options.refresh_secs,
            prediction: Some(prediction),
        }
    }

    fn build_display_items(&self) -> Vec<QuotaDisplayItem> {
        let hidden = self.options.hidden_group();

        if self.options.view_mode == ViewMode::Models {
            if let Some(snapshot) = &self.last_snapshot {
                let mut models: Vec<_> = snapshot
                    .models
                    .iter()
                    .map(|m| (self.strategy.group_for_model(&m.model_id, &m.label), m))
                    .filter(|(group, _)| Some(group.id.as_str()) != hidden)
                    .collect();
                models.sort_by_key(|(group, _)| self.strategy.position(&group.id).unwrap_or(usize::MAX));

                return models
                    .into_iter()
                    .map(|(group, m)| {
                        let label = self
                            .strategy
                            .display_name(&m.model_id)
                            .map(str::to_string)
                            .or_else(|| (!m.label.is_empty()).then(|| m.label.clone()))
                            .unwrap_or_else(|| m.model_id.clone());
                        QuotaDisplayItem {
                            id: m.model_id.clone(),
                            label,
                            kind: DisplayItemKind::Model,
                            // The server may lag behind a reset that already happened
                            remaining: if m.is_ready() { 100.0 } else { m.remaining_percentage },
                            reset_time: m.time_until_reset.clone(),
                            has_data: true,
                            theme_color: group.theme_color.clone(),
                        }
                    })
                    .collect();
            }
        }

        self.state
            .groups
            .iter()
            .filter(|g| Some(g.id.as_str()) != hidden)
            .map(|g| QuotaDisplayItem {
                id: g.id.clone(),
                label: g.label.clone(),
                kind: DisplayItemKind::Group,
                remaining: g.remaining,
                reset_time: g.reset_time.clone(),
                has_data: g.has_data,
                theme_color: g.theme_color.clone(),
            })
            .collect()
    }

    /// Chart data with the hidden secondary group filtered out
    pub fn chart_data(&self) -> UsageChartData {
        let Some(hidden) = self.options.hidden_group() else {
            return self.chart.clone();
        };
        let mut chart = self.chart.clone();
        for bucket in &mut chart.buckets {
            bucket.items.retain(|item| item.group_id != hidden);
        }
        chart
    }

    /// Status bar record: the active group (else the first with data) plus
    /// every group with data. The primary carries the prediction.
    pub fn status_bar(&self) -> StatusBarData {
        let all_groups: Vec<StatusBarGroupItem> = self
            .state
            .groups
            .iter()
            .filter(|g| g.has_data)
            .map(|g| StatusBarGroupItem {
                id: g.id.clone(),
                label: g.label.clone(),
                short_label: self
                    .strategy
                    .group(&g.id)
                    .map(|cfg| cfg.short().to_string())
                    .unwrap_or_else(|| g.label.chars().take(3).collect()),
                percentage: round_percentage(g.remaining),
                reset_time: g.reset_time.clone(),
                color: g.theme_color.clone(),
                usage_rate: 0.0,
                runway: STABLE.to_string(),
            })
            .collect();

        let mut primary = all_groups
            .iter()
            .find(|g| g.id == self.state.active_group_id)
            .or_else(|| all_groups.first())
            .cloned()
            .unwrap_or_else(|| StatusBarGroupItem {
                id: UNKNOWN_GROUP.to_string(),
                label: "Unknown".to_string(),
                short_label: NO_RESET.to_string(),
                percentage: 0,
                reset_time: NO_RESET.to_string(),
                color: DEFAULT_COLOR.to_string(),
                usage_rate: 0.0,
                runway: STABLE.to_string(),
            });

        if let Some(prediction) = self.prediction().filter(|p| p.group_id == primary.id) {
            primary.usage_rate = prediction.usage_rate;
            primary.runway = prediction.runway.clone();
        }

        StatusBarData {
            primary,
            all_groups,
        }
    }
}

fn color_bucket(bucket: UsageBucket, colors: &BTreeMap<String, String>) -> ChartBucket {
    ChartBucket {
        start_time: bucket.start_time,
        end_time: bucket.end_time,
        items: bucket
            .items
            .into_iter()
            .map(|item| ChartItem {
                color: colors
                    .get(&item.group_id)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_COLOR.to_string()),
                group_id: item.group_id,
                usage: item.usage,
            })
            .collect(),
    }
}
