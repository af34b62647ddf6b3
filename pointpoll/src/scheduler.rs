//! Per-point polling loop.
//!
//! Each point gets one [`PointTask`], which owns its transport, its timer and
//! the sending half of its state channel. Tasks share nothing, so a failing
//! or stalled device only ever affects its own point.
//!
//! Cycles are sequential: the operation is awaited before the next tick is
//! taken, and late ticks are delayed rather than bursted. An operation that
//! takes longer than the interval (possible when `timeoutMs > intervalMs`)
//! therefore stretches the period instead of overlapping requests.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use pointpoll_common::{Reading, ReadingValue};

use crate::config::{Operation, PointSpec};
use crate::decoder::{DecodeError, decode};
use crate::formula::{Formula, FormulaError};
use crate::status::PointState;
use crate::transport::{Transport, TransportError};

/// Error type for a single poll cycle.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),
}

/// Resolve once the shutdown flag is raised.
///
/// A dropped sender means no shutdown can ever be requested, so this then
/// never resolves.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// The polling task of a single point.
pub struct PointTask<T: Transport> {
    spec: PointSpec,
    transport: T,
    formula: Result<Option<Formula>, FormulaError>,
    state: watch::Sender<PointState>,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> PointTask<T> {
    /// Create a task for a point whose transport is already connected.
    pub fn new(
        spec: PointSpec,
        transport: T,
        state: watch::Sender<PointState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let formula = spec.formula.as_deref().map(Formula::parse).transpose();
        match &formula {
            Ok(Some(f)) => debug!(point = %spec.name, formula = f.source(), "Scaling formula compiled"),
            Ok(None) => {}
            Err(e) => warn!(
                point = %spec.name,
                formula = spec.formula.as_deref().unwrap_or_default(),
                error = %e,
                "Formula rejected; every read will report an error"
            ),
        }

        Self {
            spec,
            transport,
            formula,
            state,
            shutdown,
        }
    }

    /// Run until the point terminates (interval 0) or shutdown is requested.
    ///
    /// The transport is closed on both exit paths.
    pub async fn run(mut self) {
        if self.spec.is_one_shot() {
            debug!(point = %self.spec.name, "Running single operation");
            self.cycle().await;
        } else {
            self.run_periodic(self.spec.interval).await;
        }

        if let Err(e) = self.transport.close().await {
            warn!(point = %self.spec.name, error = %e, "Error closing transport");
        }
        self.state.send_modify(|s| s.terminated = true);
        info!(point = %self.spec.name, "Point terminated");
    }

    async fn run_periodic(&mut self, period: Duration) {
        info!(
            point = %self.spec.name,
            interval_ms = period.as_millis() as u64,
            "Starting point scheduler"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                _ = shutdown_requested(&mut shutdown) => {
                    debug!(point = %self.spec.name, "Shutdown requested");
                    break;
                }
            }
        }
    }

    /// Perform one operation and record its outcome.
    async fn cycle(&mut self) {
        match self.poll_once().await {
            Ok(reading) => {
                match reading.value {
                    ReadingValue::Gauge(value) => {
                        info!(point = %self.spec.name, address = reading.address, value, "Read value");
                    }
                    ReadingValue::Boolean(value) => {
                        info!(point = %self.spec.name, address = reading.address, value, "Coil written");
                    }
                }
                match reading.to_json() {
                    Ok(json) => debug!(point = %self.spec.name, reading = %json, "Reading"),
                    Err(e) => debug!(point = %self.spec.name, error = %e, "Failed to encode reading"),
                }
                self.state.send_modify(|s| s.record_success(reading));
            }
            Err(e) => {
                warn!(point = %self.spec.name, error = %e, "Poll failed");
                self.state.send_modify(|s| s.record_failure(&e));
            }
        }
    }

    /// Issue the configured operation and decode its result.
    async fn poll_once(&mut self) -> Result<Reading, PollError> {
        match self.spec.operation {
            Operation::Read {
                kind,
                start,
                length,
            } => {
                let bytes = self.transport.read_registers(kind, start, length).await?;
                let formula = self.formula.as_ref().map_err(|e| DecodeError::Formula(e.clone()))?;
                let value = decode(&bytes, self.spec.byte_order, formula.as_ref())?;
                Ok(Reading::new(&self.spec.name, kind.as_str(), start, value))
            }
            Operation::WriteCoil { address, value } => {
                self.transport.write_single_coil(address, value).await?;
                Ok(Reading::new(&self.spec.name, "coil", address, value))
            }
        }
    }
}
