//! Output formatting for system reports.
//!
//! Supports both human-readable terminal output and JSON for scripting.

use localrt_core::system::DeviceReport;
use localrt_core::{DeviceStatus, LoadedRef, SystemReport};
use serde::Serialize;

/// JSON output for `lrt load`
#[derive(Serialize)]
struct JsonLoaded<'a> {
    loaded: &'a LoadedRef,
    resident_artifacts: usize,
}

/// Formats a system report as JSON.
pub fn format_json(report: &SystemReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

/// Formats a system report for human-readable terminal output.
pub fn format_human(report: &SystemReport) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{} ({}): {} device{}\n",
        report.system,
        report.state,
        report.devices.len(),
        if report.devices.len() == 1 { "" } else { "s" }
    ));

    if !report.devices.is_empty() {
        output.push('\n');
    }
    for device in &report.devices {
        output.push_str(&format_device(device));
    }

    if !report.skipped.is_empty() {
        output.push_str("\nSkipped backends:\n");
        for skipped in &report.skipped {
            output.push_str(&format!("  {:<8} {}\n", skipped.kind, skipped.reason));
        }
    }

    if let Some(stats) = report.scheduler {
        output.push_str(&format!(
            "\nScheduler: {} context{}, {} queued, {} in flight, {} completed, {} cancelled\n",
            stats.contexts,
            if stats.contexts == 1 { "" } else { "s" },
            stats.queued,
            stats.in_flight,
            stats.completed,
            stats.cancelled
        ));
    }

    if report.resident_artifacts > 0 {
        output.push_str(&format!(
            "Resident artifacts: {}\n",
            report.resident_artifacts
        ));
    }

    output.trim_end().to_string()
}

fn format_device(device: &DeviceReport) -> String {
    let status = match device.status {
        DeviceStatus::Pending => "pending",
        DeviceStatus::Open => "open",
        DeviceStatus::Failed => "failed",
        DeviceStatus::Closed => "closed",
    };
    let mut line = format!(
        "  {:<10} {:<8} {} [{}] x{}{}\n",
        device.id.to_string(),
        status,
        device.name,
        device.identity,
        device.capabilities.concurrency,
        if device.capabilities.supports_plugins {
            ""
        } else {
            ", no plugins"
        }
    );
    if let Some(error) = &device.error {
        line.push_str(&format!("             {}\n", error));
    }
    line
}

/// Formats the result of a successful load.
pub fn format_loaded(loaded: &LoadedRef, resident_artifacts: usize) -> String {
    format!(
        "Loaded '{}' onto {} ({} resident)",
        loaded.artifact(),
        loaded.device(),
        resident_artifacts
    )
}

/// Formats the result of a successful load as JSON.
pub fn format_loaded_json(loaded: &LoadedRef, resident_artifacts: usize) -> String {
    serde_json::to_string_pretty(&JsonLoaded {
        loaded,
        resident_artifacts,
    })
    .unwrap_or_else(|_| "{}".to_string())
}
