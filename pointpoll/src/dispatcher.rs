//! Point startup: protocol selection, connection and task spawning.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{ConfigError, PointSpec, record_name, resolve_record};
use crate::scheduler::{PointTask, shutdown_requested};
use crate::status::PointState;
pub use crate::transport::Backoff;
use crate::transport::{Link, Transport, TransportError};

/// Opens the transport for a point.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    fn connect(
        &self,
        spec: &PointSpec,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// Connects real Modbus TCP sockets and RTU serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusConnector;

impl Connector for ModbusConnector {
    type Transport = Link;

    async fn connect(&self, spec: &PointSpec) -> Result<Link, TransportError> {
        Link::establish(&spec.connection, spec.unit_id, spec.timeout).await
    }
}

/// A point that was rejected at startup.
#[derive(Debug)]
pub struct SkippedPoint {
    pub index: usize,
    pub name: String,
    pub error: ConfigError,
}

/// A started point.
#[derive(Debug, Clone)]
pub struct PointHandle {
    pub name: String,
    pub state: watch::Receiver<PointState>,
}

/// Everything produced by [`Dispatcher::dispatch`].
pub struct Dispatch {
    pub points: Vec<PointHandle>,
    pub skipped: Vec<SkippedPoint>,
    pub tasks: JoinSet<()>,
}

/// Starts one independent task per configured point.
pub struct Dispatcher<C = ModbusConnector> {
    connector: std::sync::Arc<C>,
    backoff: Backoff,
}

impl Default for Dispatcher<ModbusConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher<ModbusConnector> {
    pub fn new() -> Self {
        Self::with_connector(ModbusConnector)
    }
}

impl<C: Connector> Dispatcher<C> {
    pub fn with_connector(connector: C) -> Self {
        Self {
            connector: std::sync::Arc::new(connector),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate every point and spawn a task for each valid one.
    ///
    /// Invalid points are logged and returned in [`Dispatch::skipped`]; they
    /// never prevent the others from starting. Must be called from within a
    /// tokio runtime.
    pub fn dispatch(
        &self,
        points: &[serde_json::Value],
        shutdown: watch::Receiver<bool>,
    ) -> Dispatch {
        let mut dispatch = Dispatch {
            points: Vec::new(),
            skipped: Vec::new(),
            tasks: JoinSet::new(),
        };

        for (index, point) in points.iter().enumerate() {
            let spec = match resolve_record(point, index) {
                Ok(spec) => spec,
                Err(e) => {
                    let name = record_name(point, index);
                    error!(point = %name, error = %e, "Skipping point");
                    dispatch.skipped.push(SkippedPoint {
                        index,
                        name,
                        error: e,
                    });
                    continue;
                }
            };

            info!(point = %spec.name, connection = ?spec.connection, "Starting point");

            let (state_tx, state_rx) = watch::channel(PointState::default());
            dispatch.points.push(PointHandle {
                name: spec.name.clone(),
                state: state_rx,
            });

            let connector = self.connector.clone();
            let backoff = self.backoff;
            let shutdown = shutdown.clone();
            dispatch
                .tasks
                .spawn(run_point(connector, backoff, spec, state_tx, shutdown));
        }

        info!(
            started = dispatch.points.len(),
            skipped = dispatch.skipped.len(),
            "Dispatched points"
        );

        dispatch
    }
}

/// Connect a point, then hand it to its scheduler.
async fn run_point<C: Connector>(
    connector: std::sync::Arc<C>,
    backoff: Backoff,
    spec: PointSpec,
    state: watch::Sender<PointState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connected = tokio::select! {
        result = connect_with_retry(connector.as_ref(), backoff, &spec) => result,
        _ = shutdown_requested(&mut shutdown) => {
            state.send_modify(|s| s.terminated = true);
            return;
        }
    };

    match connected {
        Ok(transport) => {
            info!(point = %spec.name, "Connected");
            PointTask::new(spec, transport, state, shutdown).run().await;
        }
        Err(e) => {
            error!(point = %spec.name, error = %e, "Giving up on point");
            state.send_modify(|s| s.record_startup_failure(&e));
        }
    }
}

async fn connect_with_retry<C: Connector>(
    connector: &C,
    backoff: Backoff,
    spec: &PointSpec,
) -> Result<C::Transport, TransportError> {
    let mut attempt = 0;
    loop {
        match connector.connect(spec).await {
            Ok(transport) => return Ok(transport),
            Err(e) if attempt < spec.connect_retries => {
                attempt += 1;
                let delay = backoff.delay(attempt);
                warn!(
                    point = %spec.name,
                    error = %e,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
