//! Rolling per-group remaining-percentage history and usage bucketing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const MINUTE_MS: i64 = 60_000;

/// Remaining percentage per group at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    /// Unix epoch milliseconds
    pub timestamp: i64,
    pub usage: BTreeMap<String, f64>,
}

/// Consumption of one group inside a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageItem {
    pub group_id: String,
    pub usage: f64,
}

/// Fixed-width time interval with per-group consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    pub start_time: i64,
    pub end_time: i64,
    pub items: Vec<UsageItem>,
}

impl UsageBucket {
    pub fn total(&self) -> f64 {
        self.items.iter().map(|i| i.usage).sum()
    }

    pub fn usage_of(&self, group_id: &str) -> f64 {
        self.items
            .iter()
            .filter(|i| i.group_id == group_id)
            .map(|i| i.usage)
            .sum()
    }
}

/// History bounded to a retention window
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaHistory {
    points: Vec<HistoryPoint>,
    retention_minutes: u64,
}

impl QuotaHistory {
    pub fn new(retention_minutes: u64) -> Self {
        Self {
            points: Vec::new(),
            retention_minutes,
        }
    }

    /// Restore persisted points; they are sorted and pruned on the next record
    pub fn from_points(mut points: Vec<HistoryPoint>, retention_minutes: u64) -> Self {
        points.sort_by_key(|p| p.timestamp);
        Self {
            points,
            retention_minutes,
        }
    }

    pub fn points(&self) -> &[HistoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn retention_minutes(&self) -> u64 {
        self.retention_minutes
    }

    pub fn set_retention(&mut self, minutes: u64, now_ms: i64) {
        self.retention_minutes = minutes;
        self.prune(now_ms);
    }

    /// Append a point and drop points older than the retention window
    pub fn record(&mut self, usage: BTreeMap<String, f64>, now_ms: i64) {
        if usage.is_empty() {
            return;
        }
        self.points.push(HistoryPoint {
            timestamp: now_ms,
            usage,
        });
        self.prune(now_ms);
    }

    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.retention_minutes as i64 * MINUTE_MS;
        self.points.retain(|p| p.timestamp >= cutoff);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Points within the last `minutes`
    pub fn recent(&self, minutes: u64, now_ms: i64) -> Vec<&HistoryPoint> {
        let cutoff = now_ms - minutes as i64 * MINUTE_MS;
        self.points
            .iter()
            .filter(|p| p.timestamp >= cutoff && p.timestamp <= now_ms)
            .collect()
    }

    /// Bucket consumption over the window `[now - display_minutes, now]`.
    ///
    /// Consumption between consecutive points is `max(0, previous - current)`
    /// per group (a reset that raises the percentage counts as zero) and is
    /// credited to the bucket containing the later point. Buckets end at
    /// `now` and are `bucket_minutes` wide.
    pub fn usage_buckets(
        &self,
        display_minutes: u64,
        bucket_minutes: f64,
        now_ms: i64,
    ) -> Vec<UsageBucket> {
        let window_ms = display_minutes as i64 * MINUTE_MS;
        let bucket_ms = ((bucket_minutes * MINUTE_MS as f64).round() as i64).max(1_000);
        if window_ms <= 0 {
            return Vec::new();
        }

        let count = ((window_ms + bucket_ms - 1) / bucket_ms) as usize;
        let first_start = now_ms - count as i64 * bucket_ms;
        let mut sums: Vec<BTreeMap<String, f64>> = vec![BTreeMap::new(); count];

        let window: Vec<&HistoryPoint> = self.recent(display_minutes, now_ms);
        for pair in window.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);
            let index = ((cur.timestamp - first_start - 1).max(0) / bucket_ms) as usize;
            let slot = &mut sums[index.min(count - 1)];
            for (group_id, current) in &cur.usage {
                if let Some(previous) = prev.usage.get(group_id) {
                    *slot.entry(group_id.clone()).or_insert(0.0) += (previous - current).max(0.0);
                }
            }
        }

        sums.into_iter()
            .enumerate()
            .map(|(i, groups)| {
                let start_time = first_start + i as i64 * bucket_ms;
                UsageBucket {
                    start_time,
                    end_time: start_time + bucket_ms,
                    items: groups
                        .into_iter()
                        .map(|(group_id, usage)| UsageItem { group_id, usage })
                        .collect(),
                }
            })
            .collect()
    }
}

/// Largest bucket total, at least 1
pub fn max_usage(buckets: &[UsageBucket]) -> f64 {
    buckets.iter().map(UsageBucket::total).fold(1.0, f64::max)
}
