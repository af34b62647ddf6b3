//! Configuration for the Modbus poller.
//!
//! A configuration file is a list of point records. Records stay untyped
//! JSON until their task is set up: [`resolve_record`] types one record as a
//! [`PointConfig`] and checks it into a [`PointSpec`], so a bad record (wrong
//! field type, missing key, out-of-range number) only ever takes itself out.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use pointpoll_common::LoggingConfig;

use crate::decoder::ByteOrder;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] pointpoll_common::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Unknown protocol '{0}' (use ModbusTCP or ModbusRTU)")]
    UnknownProtocol(String),
    #[error("Unknown function code '{0}' (use FC3, FC4 or FC5)")]
    UnknownFunctionCode(String),
    #[error("Malformed point: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Point records, typed one by one by [`resolve_record`]
    #[serde(alias = "points")]
    pub parameters: Vec<serde_json::Value>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PollerConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: PollerConfig = pointpoll_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: PollerConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the file-level shape.
    ///
    /// Per-point problems are not checked here; they are reported by
    /// [`resolve_record`] and only skip the offending point.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parameters.is_empty() {
            return Err(ConfigError::Validation(
                "At least one point must be configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// A point record as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointConfig {
    /// Optional label used in logs (default: `point-<index>`)
    #[serde(default)]
    pub name: Option<String>,

    /// "ModbusTCP" or "ModbusRTU", matched case-insensitively
    pub protocol: String,

    /// TCP host address (IP or hostname)
    #[serde(default)]
    pub host: Option<String>,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Serial device path (e.g., "/dev/ttyUSB0" or "COM1")
    #[serde(default)]
    pub device: Option<String>,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Data bits: 5 to 8 (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Modbus unit/slave ID (default: 1)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// "FC3", "FC4" or "FC5"
    #[serde(alias = "fc")]
    pub function_code: String,

    /// Starting register or coil address
    #[serde(default)]
    pub register_start: u16,

    /// Number of 16-bit words to read (ignored for FC5)
    #[serde(default)]
    pub register_length: u16,

    /// Coil value written by FC5
    #[serde(default)]
    pub value: CoilValue,

    /// "ABCD" for big-endian (default); anything else reads little-endian
    #[serde(default = "default_byte_order", alias = "format")]
    pub byte_order: String,

    /// Scaling expression over the placeholder `value`
    #[serde(default, alias = "evaluation", alias = "evaluatation")]
    pub formula: Option<String>,

    /// Poll interval in milliseconds; 0 runs the operation once
    #[serde(default, alias = "interval")]
    pub interval_ms: u64,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Connect attempts after the first failure
    #[serde(default = "default_retries")]
    pub connect_retries: u32,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_data_bits() -> u8 {
    8
}

fn default_unit_id() -> u8 {
    1
}

fn default_byte_order() -> String {
    "ABCD".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    3
}

/// Coil value, written either as a boolean or as a number (non-zero is on).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoilValue {
    Bool(bool),
    Number(f64),
}

impl Default for CoilValue {
    fn default() -> Self {
        CoilValue::Bool(false)
    }
}

impl CoilValue {
    pub fn as_bool(&self) -> bool {
        match self {
            CoilValue::Bool(b) => *b,
            CoilValue::Number(n) => *n != 0.0,
        }
    }
}

/// Transport protocol of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    ModbusTcp,
    ModbusRtu,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MODBUSTCP" => Ok(Protocol::ModbusTcp),
            "MODBUSRTU" => Ok(Protocol::ModbusRtu),
            _ => Err(ConfigError::UnknownProtocol(s.to_string())),
        }
    }
}

/// Modbus function selected for a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    /// FC3
    ReadHoldingRegisters,
    /// FC4
    ReadInputRegisters,
    /// FC5
    WriteSingleCoil,
}

impl FromStr for FunctionCode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FC3" | "3" => Ok(FunctionCode::ReadHoldingRegisters),
            "FC4" | "4" => Ok(FunctionCode::ReadInputRegisters),
            "FC5" | "5" => Ok(FunctionCode::WriteSingleCoil),
            _ => Err(ConfigError::UnknownFunctionCode(s.to_string())),
        }
    }
}

/// Register space read by FC3/FC4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Holding registers (read/write, 16-bit)
    Holding,
    /// Input registers (read-only, 16-bit)
    Input,
}

impl RegisterKind {
    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
        }
    }
}

/// Serial line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Serial line settings for an RTU point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub device: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub data_bits: u8,
}

/// Resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    Tcp { host: String, port: u16 },
    Rtu(SerialSettings),
}

/// The single Modbus operation a point performs each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read {
        kind: RegisterKind,
        start: u16,
        length: u16,
    },
    WriteCoil {
        address: u16,
        value: bool,
    },
}

/// A validated point, ready to be handed to a scheduler task.
#[derive(Debug, Clone)]
pub struct PointSpec {
    pub name: String,
    pub connection: ConnectionConfig,
    pub unit_id: u8,
    pub operation: Operation,
    pub byte_order: ByteOrder,
    pub formula: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub connect_retries: u32,
}

impl PointSpec {
    /// True when the point runs a single operation and stops.
    pub fn is_one_shot(&self) -> bool {
        self.interval.is_zero()
    }
}

/// Name of a raw record for logs, even when the record itself is malformed.
pub fn record_name(record: &serde_json::Value, index: usize) -> String {
    match record.get("name").and_then(serde_json::Value::as_str) {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => format!("point-{}", index),
    }
}

/// Type one raw record and check it into a [`PointSpec`].
pub fn resolve_record(record: &serde_json::Value, index: usize) -> Result<PointSpec, ConfigError> {
    PointConfig::deserialize(record)?.resolve(index)
}

impl PointConfig {
    /// Name used in logs; falls back to the position in the configuration.
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("point-{}", index),
        }
    }

    /// Check this record and turn it into a [`PointSpec`].
    pub fn resolve(&self, index: usize) -> Result<PointSpec, ConfigError> {
        let name = self.display_name(index);

        let connection = match self.protocol.parse::<Protocol>()? {
            Protocol::ModbusTcp => {
                let host = match self.host.as_deref().map(str::trim) {
                    Some(host) if !host.is_empty() => host.to_string(),
                    _ => {
                        return Err(ConfigError::Validation(format!(
                            "Point '{}': ModbusTCP requires a host",
                            name
                        )));
                    }
                };
                ConnectionConfig::Tcp {
                    host,
                    port: self.port,
                }
            }
            Protocol::ModbusRtu => ConnectionConfig::Rtu(self.serial_settings(&name)?),
        };

        let operation = match self.function_code.parse::<FunctionCode>()? {
            FunctionCode::ReadHoldingRegisters => self.read_operation(&name, RegisterKind::Holding)?,
            FunctionCode::ReadInputRegisters => self.read_operation(&name, RegisterKind::Input)?,
            FunctionCode::WriteSingleCoil => Operation::WriteCoil {
                address: self.register_start,
                value: self.value.as_bool(),
            },
        };

        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "Point '{}': timeoutMs must be greater than 0",
                name
            )));
        }

        let formula = self
            .formula
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        Ok(PointSpec {
            name,
            connection,
            unit_id: self.unit_id,
            operation,
            byte_order: ByteOrder::from_format(&self.byte_order),
            formula,
            interval: Duration::from_millis(self.interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            connect_retries: self.connect_retries,
        })
    }

    fn read_operation(&self, name: &str, kind: RegisterKind) -> Result<Operation, ConfigError> {
        // one f32 spans two registers
        if self.register_length < 2 {
            return Err(ConfigError::Validation(format!(
                "Point '{}': registerLength must be at least 2 to decode a float (got {})",
                name, self.register_length
            )));
        }
        if u32::from(self.register_start) + u32::from(self.register_length) > 0x1_0000 {
            return Err(ConfigError::Validation(format!(
                "Point '{}': register range {}+{} exceeds the address space",
                name, self.register_start, self.register_length
            )));
        }
        Ok(Operation::Read {
            kind,
            start: self.register_start,
            length: self.register_length,
        })
    }

    fn serial_settings(&self, name: &str) -> Result<SerialSettings, ConfigError> {
        let device = match self.device.as_deref().map(str::trim) {
            Some(device) if !device.is_empty() => device.to_string(),
            _ => {
                return Err(ConfigError::Validation(format!(
                    "Point '{}': ModbusRTU requires a device",
                    name
                )));
            }
        };

        let parity = match self.parity.to_lowercase().as_str() {
            "none" => Parity::None,
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            _ => {
                return Err(ConfigError::Validation(format!(
                    "Point '{}': invalid parity '{}' (use none, even, or odd)",
                    name, self.parity
                )));
            }
        };

        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ConfigError::Validation(format!(
                "Point '{}': stopBits must be 1 or 2",
                name
            )));
        }

        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::Validation(format!(
                "Point '{}': dataBits must be 5-8",
                name
            )));
        }

        if self.baud_rate == 0 {
            return Err(ConfigError::Validation(format!(
                "Point '{}': baudRate must be greater than 0",
                name
            )));
        }

        Ok(SerialSettings {
            device,
            baud_rate: self.baud_rate,
            parity,
            stop_bits: self.stop_bits,
            data_bits: self.data_bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(json: &str) -> PointConfig {
        json5::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_tcp_point() {
        let json = r#"{
            parameters: [
                {
                    protocol: "ModbusTCP",
                    host: "127.0.0.1",
                    functionCode: "FC3",
                    registerStart: 0,
                    registerLength: 2,
                    intervalMs: 1000
                }
            ]
        }"#;

        let config = PollerConfig::parse(json).unwrap();
        let spec = resolve_record(&config.parameters[0], 0).unwrap();

        assert_eq!(spec.name, "point-0");
        assert_eq!(
            spec.connection,
            ConnectionConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502
            }
        );
        assert_eq!(
            spec.operation,
            Operation::Read {
                kind: RegisterKind::Holding,
                start: 0,
                length: 2
            }
        );
        assert_eq!(spec.byte_order, ByteOrder::BigEndian);
        assert_eq!(spec.interval, Duration::from_millis(1000));
        assert_eq!(spec.timeout, Duration::from_millis(1000));
        assert!(spec.formula.is_none());
    }

    #[test]
    fn test_parse_legacy_keys() {
        let cfg = point(
            r#"{
                protocol: "modbusrtu",
                device: "/dev/ttyUSB0",
                baudRate: 19200,
                parity: "even",
                unitId: 7,
                fc: "fc4",
                registerStart: 10,
                registerLength: 2,
                format: "DCBA",
                evaluatation: "value * 10",
                interval: 500
            }"#,
        );

        let spec = cfg.resolve(3).unwrap();
        assert_eq!(spec.unit_id, 7);
        assert_eq!(spec.byte_order, ByteOrder::LittleEndian);
        assert_eq!(spec.formula.as_deref(), Some("value * 10"));
        assert_eq!(spec.interval, Duration::from_millis(500));
        match spec.connection {
            ConnectionConfig::Rtu(serial) => {
                assert_eq!(serial.device, "/dev/ttyUSB0");
                assert_eq!(serial.baud_rate, 19200);
                assert_eq!(serial.parity, Parity::Even);
                assert_eq!(serial.stop_bits, 1);
                assert_eq!(serial.data_bits, 8);
            }
            other => panic!("Expected RTU connection, got {:?}", other),
        }
    }

    #[test]
    fn test_write_coil_numeric_value() {
        let cfg = point(
            r#"{ protocol: "ModbusTCP", host: "plc", fc: "FC5", registerStart: 5, value: 1, interval: 0 }"#,
        );
        let spec = cfg.resolve(0).unwrap();

        assert_eq!(
            spec.operation,
            Operation::WriteCoil {
                address: 5,
                value: true
            }
        );
        assert!(spec.is_one_shot());
    }

    #[test]
    fn test_unknown_protocol() {
        let cfg = point(r#"{ protocol: "modbus-xyz", fc: "FC3", registerLength: 2 }"#);
        assert!(matches!(
            cfg.resolve(0),
            Err(ConfigError::UnknownProtocol(p)) if p == "modbus-xyz"
        ));
    }

    #[test]
    fn test_unknown_function_code() {
        let cfg = point(r#"{ protocol: "ModbusTCP", host: "plc", fc: "FC16" }"#);
        assert!(matches!(
            cfg.resolve(0),
            Err(ConfigError::UnknownFunctionCode(_))
        ));
    }

    #[test]
    fn test_short_register_length_rejected() {
        let cfg = point(r#"{ protocol: "ModbusTCP", host: "plc", fc: "FC3", registerLength: 1 }"#);
        let err = cfg.resolve(0).unwrap_err();
        assert!(err.to_string().contains("registerLength"));
    }

    #[test]
    fn test_register_range_overflow_rejected() {
        let cfg = point(
            r#"{ protocol: "ModbusTCP", host: "plc", fc: "FC3", registerStart: 65535, registerLength: 2 }"#,
        );
        assert!(cfg.resolve(0).is_err());
    }

    #[test]
    fn test_missing_host_rejected() {
        let cfg = point(r#"{ protocol: "ModbusTCP", fc: "FC3", registerLength: 2 }"#);
        assert!(matches!(cfg.resolve(0), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_invalid_parity_rejected() {
        let cfg = point(
            r#"{ protocol: "ModbusRTU", device: "COM1", parity: "mark", fc: "FC3", registerLength: 2 }"#,
        );
        let err = cfg.resolve(0).unwrap_err();
        assert!(err.to_string().contains("invalid parity"));
    }

    #[test]
    fn test_blank_formula_is_absent() {
        let cfg = point(
            r#"{ protocol: "ModbusTCP", host: "plc", fc: "FC3", registerLength: 2, formula: "   " }"#,
        );
        assert!(cfg.resolve(0).unwrap().formula.is_none());
    }

    #[test]
    fn test_named_point() {
        let cfg = point(
            r#"{ name: "boiler", protocol: "ModbusTCP", host: "plc", fc: "FC3", registerLength: 2 }"#,
        );
        assert_eq!(cfg.resolve(9).unwrap().name, "boiler");
    }

    #[test]
    fn test_validate_empty_points() {
        assert!(PollerConfig::parse("{ parameters: [] }").is_err());
    }

    #[test]
    fn test_points_alias() {
        let config = PollerConfig::parse(
            r#"{ points: [ { protocol: "ModbusTCP", host: "plc", fc: "FC3", registerLength: 2 } ] }"#,
        )
        .unwrap();
        assert_eq!(config.parameters.len(), 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_malformed_record_does_not_fail_the_file() {
        let config = PollerConfig::parse(
            r#"{ parameters: [
                { name: "good", protocol: "ModbusTCP", host: "plc", fc: "FC3", registerLength: 2 },
                { name: "too-far", protocol: "ModbusTCP", host: "plc", fc: "FC3", registerStart: 70000, registerLength: 2 },
                { protocol: "ModbusTCP", host: "plc", registerLength: 2 },
                { name: "typed", protocol: "ModbusTCP", host: "plc", fc: "FC3", registerLength: "two" },
            ] }"#,
        )
        .unwrap();
        assert_eq!(config.parameters.len(), 4);

        assert_eq!(resolve_record(&config.parameters[0], 0).unwrap().name, "good");
        for (index, record) in config.parameters.iter().enumerate().skip(1) {
            assert!(matches!(
                resolve_record(record, index),
                Err(ConfigError::Malformed(_))
            ));
        }

        assert_eq!(record_name(&config.parameters[1], 1), "too-far");
        assert_eq!(record_name(&config.parameters[2], 2), "point-2");
    }
}
