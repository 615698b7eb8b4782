//! Append-only JSONL run event log.
//!
//! Each orchestrator run appends timestamped events to `<prefix>/events.jsonl`.
//! The log is the observable record of pipeline ordering — in particular that
//! a replica only reaches `running` after its primary did.

use crate::core::types::{InstanceRole, InstanceState};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// One event in a provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        version: String,
    },
    PipelineStarted {
        role: InstanceRole,
    },
    StateChanged {
        role: InstanceRole,
        from: InstanceState,
        to: InstanceState,
    },
    PipelineFailed {
        role: InstanceRole,
        error: String,
    },
    RunCompleted {
        run_id: String,
        failed: u32,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Generate an ISO 8601 UTC timestamp without a chrono dependency.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let days = secs / 86400;
    let (hours, minutes, seconds) = {
        let t = secs % 86400;
        (t / 3600, (t % 3600) / 60, t % 60)
    };

    let mut year = 1970u64;
    let mut remaining = days;
    while remaining >= days_in_year(year) {
        remaining -= days_in_year(year);
        year += 1;
    }
    let mut month = 1;
    for len in month_lengths(year) {
        if remaining < len {
            break;
        }
        remaining -= len;
        month += 1;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining + 1,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(y: u64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn days_in_year(y: u64) -> u64 {
    if is_leap(y) {
        366
    } else {
        365
    }
}

fn month_lengths(y: u64) -> [u64; 12] {
    let feb = if is_leap(y) { 29 } else { 28 };
    [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
}

/// Generate a run id from the current time.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("run-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Append one event to the log, creating it (and its parent) if needed.
/// Line-buffered appends keep concurrent pipeline threads from interleaving
/// within a record.
pub fn append_event(path: &Path, event: RunEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(std::io::Error::other)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", json)?;
    Ok(())
}

/// Read every event back in order. Used by tests and failure reports.
pub fn read_events(path: &Path) -> std::io::Result<Vec<TimestampedEvent>> {
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let te: TimestampedEvent =
            serde_json::from_str(line).map_err(std::io::Error::other)?;
        events.push(te);
    }
    Ok(events)
}
