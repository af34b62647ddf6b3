//! Per-point status tracking.

use serde::{Deserialize, Serialize};

use pointpoll_common::{Reading, current_timestamp_millis};

/// Outcome of the most recent poll of a point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PointStatus {
    /// No operation has completed yet.
    #[default]
    Pending,
    /// The last operation succeeded.
    Ok,
    /// The last operation (or the connection attempt) failed.
    Error,
}

impl PointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointStatus::Pending => "PENDING",
            PointStatus::Ok => "OK",
            PointStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for PointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of a point, owned and updated by its task.
///
/// Only the latest outcome is kept; `last_reading` is the most recent
/// successful one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointState {
    pub status: PointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reading: Option<Reading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Unix epoch milliseconds of the last status change (0 while pending).
    pub updated_at: i64,
    /// Completed operations, successful or not.
    pub cycles: u64,
    /// True once the task has stopped issuing operations.
    pub terminated: bool,
}

impl PointState {
    /// Record a successful operation.
    pub fn record_success(&mut self, reading: Reading) {
        self.status = PointStatus::Ok;
        self.updated_at = reading.timestamp;
        self.last_reading = Some(reading);
        self.last_error = None;
        self.cycles += 1;
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, error: impl std::fmt::Display) {
        self.status = PointStatus::Error;
        self.last_error = Some(error.to_string());
        self.updated_at = current_timestamp_millis();
        self.cycles += 1;
    }

    /// Record a failure that happened before any operation was issued.
    pub fn record_startup_failure(&mut self, error: impl std::fmt::Display) {
        self.status = PointStatus::Error;
        self.last_error = Some(error.to_string());
        self.updated_at = current_timestamp_millis();
        self.terminated = true;
    }

    /// Last successfully decoded or written value, as a number.
    pub fn last_value(&self) -> Option<f64> {
        self.last_reading.as_ref().map(|r| r.value.as_f64())
    }
}
