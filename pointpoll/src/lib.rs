//! Per-point Modbus poller.
//!
//! Each configured point is polled by its own task over Modbus TCP or RTU
//! (serial). Register reads are decoded into 32-bit floats, optionally scaled
//! by a formula, and reported through logs and a per-point state channel.
//!
//! # Pipeline
//!
//! ```text
//! record --resolve_record--> PointSpec --Dispatcher--> PointTask
//!                                                      |
//!                     Transport::read_registers -> decoder::decode -> PointState
//! ```
//!
//! - [`config`] - Point records and validation
//! - [`transport`] - TCP and RTU transports behind the [`transport::Transport`] trait
//! - [`decoder`] / [`formula`] - Float decoding and sandboxed scaling formulas
//! - [`scheduler`] - The per-point polling loop
//! - [`dispatcher`] - Protocol selection, connection and task startup
//! - [`runner`] - Process lifecycle (Ctrl+C, graceful shutdown)

pub mod args;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod formula;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod transport;

pub use config::{ConfigError, PointConfig, PointSpec, PollerConfig};
pub use dispatcher::{Dispatcher, PointHandle};
pub use runner::PollerRunner;
pub use status::{PointState, PointStatus};
