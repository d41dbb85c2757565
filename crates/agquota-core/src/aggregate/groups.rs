//! Quota group definitions and model-to-group matching.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Fallback color for groups without a theme color
pub const DEFAULT_COLOR: &str = "#888888";

/// A named set of models sharing a quota pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaGroup {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub short_label: String,
    #[serde(default = "default_theme_color")]
    pub theme_color: String,
    /// Case-insensitive substrings matched against model id, then label
    #[serde(default)]
    pub models: Vec<String>,
    /// Friendly names keyed by model id
    #[serde(default)]
    pub display_names: BTreeMap<String, String>,
}

fn default_theme_color() -> String {
    DEFAULT_COLOR.to_string()
}

impl QuotaGroup {
    pub fn new(id: &str, label: &str, short_label: &str, theme_color: &str, models: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            short_label: short_label.to_string(),
            theme_color: theme_color.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            display_names: BTreeMap::new(),
        }
    }

    /// Whether a model (by id or label) belongs to this group
    pub fn matches(&self, model_id: &str, label: &str) -> bool {
        let id = model_id.to_lowercase();
        let label = label.to_lowercase();
        let patterns: Vec<String> = self.models.iter().map(|m| m.to_lowercase()).collect();
        patterns.iter().any(|p| !p.is_empty() && id.contains(p.as_str()))
            || patterns.iter().any(|p| !p.is_empty() && label.contains(p.as_str()))
    }

    /// Short label, falling back to the full label
    pub fn short(&self) -> &str {
        if self.short_label.is_empty() {
            &self.label
        } else {
            &self.short_label
        }
    }
}

/// Built-in groups, in display order
pub fn default_groups() -> Vec<QuotaGroup> {
    vec![
        QuotaGroup::new(
            "gemini-pro",
            "Gemini Pro",
            "Pro",
            "#4285F4",
            &["gemini-3-pro", "gemini 3 pro", "gemini-2.5-pro", "gemini 2.5 pro"],
        ),
        QuotaGroup::new("gemini-flash", "Gemini Flash", "Flash", "#34A853", &["flash"]),
        QuotaGroup::new("claude", "Claude", "Cla", "#D97757", &["claude", "sonnet", "opus"]),
        QuotaGroup::new("gpt", "GPT-OSS", "GPT", "#10A37F", &["gpt", "oss"]),
    ]
}

/// Ordered group list plus the group unmatched models fall into
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStrategy {
    groups: Vec<QuotaGroup>,
    default_index: usize,
}

impl Default for GroupStrategy {
    fn default() -> Self {
        Self::new(default_groups(), None)
    }
}

impl GroupStrategy {
    /// An empty group list falls back to [`default_groups`]. An unknown
    /// `default_group` id falls back to the first group.
    pub fn new(groups: Vec<QuotaGroup>, default_group: Option<&str>) -> Self {
        let groups = if groups.is_empty() {
            default_groups()
        } else {
            groups
        };
        let default_index = default_group
            .and_then(|id| groups.iter().position(|g| g.id == id))
            .unwrap_or(0);
        Self {
            groups,
            default_index,
        }
    }

    pub fn groups(&self) -> &[QuotaGroup] {
        &self.groups
    }

    /// First group whose patterns match; otherwise the default group
    pub fn group_for_model(&self, model_id: &str, label: &str) -> &QuotaGroup {
        self.groups
            .iter()
            .find(|g| g.matches(model_id, label))
            .unwrap_or(&self.groups[self.default_index])
    }

    pub fn group(&self, id: &str) -> Option<&QuotaGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.id == id)
    }

    pub fn color_of(&self, id: &str) -> &str {
        self.group(id)
            .map(|g| g.theme_color.as_str())
            .unwrap_or(DEFAULT_COLOR)
    }

    /// Configured friendly name for a model, if any group defines one
    pub fn display_name(&self, model_id: &str) -> Option<&str> {
        self.groups
            .iter()
            .find_map(|g| g.display_names.get(model_id))
            .map(String::as_str)
    }
}
