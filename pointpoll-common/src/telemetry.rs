use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single observation produced by one poll cycle of a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Unix epoch milliseconds when the operation completed.
    pub timestamp: i64,

    /// Point name (e.g., "boiler-temp", "point-0").
    pub source: String,

    /// Register space the value came from or went to (e.g., "holding", "coil").
    pub kind: String,

    /// Starting register or coil address.
    pub address: u16,

    /// The decoded or written value.
    pub value: ReadingValue,
}

impl Reading {
    /// Create a new reading with the current timestamp.
    pub fn new(
        source: impl Into<String>,
        kind: impl Into<String>,
        address: u16,
        value: impl Into<ReadingValue>,
    ) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            source: source.into(),
            kind: kind.into(),
            address,
            value: value.into(),
        }
    }

    /// Render as a single-line JSON document.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Typed reading value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReadingValue {
    /// Engineering value decoded from registers.
    Gauge(f64),

    /// Coil state acknowledged by the device.
    Boolean(bool),
}

impl ReadingValue {
    /// Numeric view of the value; coils map to 0.0 / 1.0.
    pub fn as_f64(&self) -> f64 {
        match self {
            ReadingValue::Gauge(v) => *v,
            ReadingValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl From<f64> for ReadingValue {
    fn from(v: f64) -> Self {
        ReadingValue::Gauge(v)
    }
}

impl From<bool> for ReadingValue {
    fn from(v: bool) -> Self {
        ReadingValue::Boolean(v)
    }
}

impl std::fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadingValue::Gauge(v) => write!(f, "{}", v),
            ReadingValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch (should never happen in practice).
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
