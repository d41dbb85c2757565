//! Text rendering for the terminal.

use anyhow::Result;
use chrono::{DateTime, Local};

use agquota_core::aggregate::{Severity, STABLE};
use agquota_core::config::{DisplayFormat, StatusSettings};
use agquota_core::housekeeping::CacheInfo;
use agquota_core::monitor::MonitorSnapshot;
use agquota_core::utils::format_bytes;

pub fn print_snapshot(snapshot: &MonitorSnapshot, settings: &StatusSettings, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
    } else {
        println!("{}", status_line(snapshot, settings));
    }
    Ok(())
}

/// One-line summary of the primary group, runway, and cache size
pub fn status_line(snapshot: &MonitorSnapshot, settings: &StatusSettings) -> String {
    let mut parts = Vec::new();
    let primary = &snapshot.status_bar.primary;
    let has_data = snapshot.state.groups.iter().any(|g| g.has_data);

    if settings.show_quota {
        if has_data {
            let value = match settings.display_format {
                DisplayFormat::Percentage => format!("{}%", primary.percentage),
                DisplayFormat::ResetTime => primary.reset_time.clone(),
                DisplayFormat::Used => format!("{}% used", 100 - primary.percentage.min(100)),
                DisplayFormat::Remaining => format!("{}% left", primary.percentage),
            };
            let mut quota = format!("{} {}", primary.label, value);
            if snapshot.severity != Severity::Normal {
                quota.push_str(&format!(" ({})", snapshot.severity.as_str()));
            }
            parts.push(quota);
            if primary.runway != STABLE {
                parts.push(format!(
                    "runway {} at {:.1}%/h",
                    primary.runway, primary.usage_rate
                ));
            }
        } else {
            parts.push("quota unavailable".to_string());
        }
    }

    if settings.show_cache {
        if let Some(size) = snapshot.cache_size {
            parts.push(format!("cache {}", format_bytes(size)));
        }
    }

    if let Some(updated) = snapshot
        .state
        .last_updated
        .and_then(DateTime::from_timestamp_millis)
    {
        parts.push(format!(
            "updated {}",
            updated.with_timezone(&Local).format("%H:%M")
        ));
    }

    if let Some(error) = &snapshot.last_error {
        parts.push(format!("error: {}", error));
    }

    parts.join(" | ")
}

/// Multi-line cache report for `agquota cache info`
pub fn cache_summary(info: &CacheInfo) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Brain:         {} ({} tasks)\n",
        format_bytes(info.brain_size),
        info.brain_count
    ));
    out.push_str(&format!(
        "Conversations: {} ({} files)\n",
        format_bytes(info.conversations_size),
        info.conversations_count
    ));
    out.push_str(&format!("Total:         {}\n", format_bytes(info.total_size)));

    if !info.brain_tasks.is_empty() {
        out.push_str("\nTasks (newest first):\n");
        for task in &info.brain_tasks {
            out.push_str(&format!(
                "  {:<38} {:>10}  {}\n",
                task.id,
                format_bytes(task.size),
                task.label
            ));
        }
    }

    if !info.code_contexts.is_empty() {
        out.push_str("\nCode contexts:\n");
        for context in &info.code_contexts {
            out.push_str(&format!(
                "  {:<38} {:>10}\n",
                context.name,
                format_bytes(context.size)
            ));
        }
    }
    out
}
