//! Parser for the report appended by the measurement utility at job exit.
//!
//! The report is a list of `Key=Value` lines (see [`USAGE_KEYS`]) with unit
//! suffixes as GNU time prints them (`1.02s`, `99%`, `2048kB`, `4096B`).
//! Parsing never fails: the job may have been killed while the report was
//! being written, and whatever reached the disk is still worth keeping.

use serde::{Deserialize, Serialize};

use crate::scheduler::ExitStatus;

/// Report keys paired with the GNU time directive producing each value.
pub const USAGE_KEYS: [(&str, &str); 22] = [
    ("WallTime", "%es"),
    ("KernelTime", "%Ss"),
    ("UserTime", "%Us"),
    ("CPUUsage", "%P"),
    ("MaxResidentMemory", "%MkB"),
    ("AverageResidentMemory", "%tkB"),
    ("AverageTotalMemory", "%KkB"),
    ("AverageUnsharedMemory", "%DkB"),
    ("AverageUnsharedStack", "%pkB"),
    ("AverageSharedMemory", "%XkB"),
    ("PageSize", "%ZB"),
    ("MajorPageFaults", "%F"),
    ("MinorPageFaults", "%R"),
    ("Swaps", "%W"),
    ("ForcedSwitches", "%c"),
    ("WaitSwitches", "%w"),
    ("Inputs", "%I"),
    ("Outputs", "%O"),
    ("SocketReceived", "%r"),
    ("SocketSent", "%s"),
    ("Signals", "%k"),
    ("ReturnCode", "%x"),
];

const SIGNAL_PREFIX: &str = "Command terminated by signal";

/// The `-f` format string handed to the measurement utility.
pub fn usage_format() -> String {
    USAGE_KEYS
        .iter()
        .map(|(key, directive)| format!("{}={}", key, directive))
        .collect::<Vec<_>>()
        .join("\\n")
}

/// Resource consumption of a finished job. Times are seconds, memory figures
/// bytes, everything else plain counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub wall_time: f64,
    pub kernel_time: f64,
    pub user_time: f64,
    pub cpu_usage: f64,
    pub max_resident_memory: u64,
    pub average_resident_memory: u64,
    pub average_total_memory: u64,
    pub average_unshared_memory: u64,
    pub average_unshared_stack: u64,
    pub average_shared_memory: u64,
    pub page_size: u64,
    pub major_page_faults: u64,
    pub minor_page_faults: u64,
    pub swaps: u64,
    pub forced_switches: u64,
    pub wait_switches: u64,
    pub inputs: u64,
    pub outputs: u64,
    pub socket_received: u64,
    pub socket_sent: u64,
    pub signals: u64,
    pub return_code: i32,
    /// Set when the utility reported the job as killed by a signal.
    pub terminated_by_signal: Option<i32>,
    #[serde(default)]
    has_return_code: bool,
}

impl UsageReport {
    /// How the job ended according to this report. A report cut short
    /// before `ReturnCode` yields [`ExitStatus::Unknown`].
    pub fn exit_status(&self) -> ExitStatus {
        match self.terminated_by_signal {
            Some(signal) => ExitStatus::Signaled(signal),
            None if self.has_return_code => ExitStatus::Exited(self.return_code),
            None => ExitStatus::Unknown,
        }
    }
}

/// Parse report text. Unknown keys and lines without `=` are skipped, missing
/// or unreadable values stay zero.
pub fn parse(text: &str) -> UsageReport {
    let mut report = UsageReport::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix(SIGNAL_PREFIX) {
            report.terminated_by_signal = rest.trim().parse().ok();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "WallTime" => report.wall_time = seconds(value),
            "KernelTime" => report.kernel_time = seconds(value),
            "UserTime" => report.user_time = seconds(value),
            "CPUUsage" => report.cpu_usage = number(value),
            "MaxResidentMemory" => report.max_resident_memory = bytes(value),
            "AverageResidentMemory" => report.average_resident_memory = bytes(value),
            "AverageTotalMemory" => report.average_total_memory = bytes(value),
            "AverageUnsharedMemory" => report.average_unshared_memory = bytes(value),
            "AverageUnsharedStack" => report.average_unshared_stack = bytes(value),
            "AverageSharedMemory" => report.average_shared_memory = bytes(value),
            "PageSize" => report.page_size = bytes(value),
            "MajorPageFaults" => report.major_page_faults = count(value),
            "MinorPageFaults" => report.minor_page_faults = count(value),
            "Swaps" => report.swaps = count(value),
            "ForcedSwitches" => report.forced_switches = count(value),
            "WaitSwitches" => report.wait_switches = count(value),
            "Inputs" => report.inputs = count(value),
            "Outputs" => report.outputs = count(value),
            "SocketReceived" => report.socket_received = count(value),
            "SocketSent" => report.socket_sent = count(value),
            "Signals" => report.signals = count(value),
            "ReturnCode" => {
                if let Ok(code) = numeric_prefix(value).parse() {
                    report.return_code = code;
                    report.has_return_code = true;
                }
            }
            other => tracing::trace!(key = other, "Ignoring unknown usage key"),
        }
    }
    report
}

fn numeric_prefix(value: &str) -> &str {
    let end = value
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    &value[..end]
}

fn number(value: &str) -> f64 {
    numeric_prefix(value).parse().unwrap_or(0.0)
}

fn seconds(value: &str) -> f64 {
    number(value)
}

fn count(value: &str) -> u64 {
    numeric_prefix(value).parse().unwrap_or(0)
}

fn bytes(value: &str) -> u64 {
    let amount = count(value);
    let unit = value[numeric_prefix(value).len()..].trim();
    match unit {
        "kB" | "KB" | "k" | "K" => amount.saturating_mul(1024),
        "MB" | "M" => amount.saturating_mul(1024 * 1024),
        _ => amount,
    }
}
