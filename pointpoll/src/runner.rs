//! Poller runner for lifecycle management.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Connector, Dispatch, Dispatcher, PointHandle, SkippedPoint};
use crate::status::PointState;

/// Final state of a point, reported when the runner stops.
#[derive(Debug, Clone, Serialize)]
pub struct PointSummary {
    pub name: String,
    #[serde(flatten)]
    pub state: PointState,
}

/// Runner that owns every point task and the shutdown signal.
///
/// Handles:
/// - Dispatching points
/// - Waiting for Ctrl+C or for every point to finish
/// - Graceful shutdown, letting each task close its transport
/// - Final status reporting
///
/// # Example
///
/// ```ignore
/// let config = PollerConfig::load_from_file("pointpoll.json5")?;
/// let runner = PollerRunner::start(&config.parameters);
/// runner.run().await;
/// ```
pub struct PollerRunner {
    shutdown: watch::Sender<bool>,
    dispatch: Dispatch,
    grace: Duration,
}

impl PollerRunner {
    /// Dispatch `points` over real Modbus transports.
    pub fn start(points: &[serde_json::Value]) -> Self {
        Self::start_with(&Dispatcher::new(), points)
    }

    /// Dispatch `points` with a custom dispatcher.
    pub fn start_with<C: Connector>(dispatcher: &Dispatcher<C>, points: &[serde_json::Value]) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatch = dispatcher.dispatch(points, shutdown_rx);
        Self {
            shutdown,
            dispatch,
            grace: Duration::from_secs(2),
        }
    }

    /// How long tasks get to close their transports after shutdown.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Points that were started.
    pub fn points(&self) -> &[PointHandle] {
        &self.dispatch.points
    }

    /// Points rejected at startup.
    pub fn skipped(&self) -> &[SkippedPoint] {
        &self.dispatch.skipped
    }

    /// Run until Ctrl+C is received or every point has terminated.
    pub async fn run(self) -> Vec<PointSummary> {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `signal` resolves or every point has terminated.
    pub async fn run_until<F: Future<Output = ()>>(mut self, signal: F) -> Vec<PointSummary> {
        info!(
            points = self.dispatch.points.len(),
            skipped = self.dispatch.skipped.len(),
            "Poller running. Press Ctrl+C to stop."
        );

        tokio::select! {
            _ = signal => info!("Received shutdown signal"),
            _ = join_all(&mut self.dispatch.tasks) => info!("All point tasks finished"),
        }

        self.stop().await
    }

    /// Signal shutdown, wait for the tasks, and report the final states.
    pub async fn stop(mut self) -> Vec<PointSummary> {
        self.shutdown.send_replace(true);

        if tokio::time::timeout(self.grace, join_all(&mut self.dispatch.tasks))
            .await
            .is_err()
        {
            warn!(
                remaining = self.dispatch.tasks.len(),
                "Point tasks did not stop in time; aborting"
            );
            self.dispatch.tasks.shutdown().await;
        }

        let summaries: Vec<PointSummary> = self
            .dispatch
            .points
            .iter()
            .map(|p| PointSummary {
                name: p.name.clone(),
                state: p.state.borrow().clone(),
            })
            .collect();

        for summary in &summaries {
            info!(
                point = %summary.name,
                status = %summary.state.status,
                cycles = summary.state.cycles,
                last_error = summary.state.last_error.as_deref().unwrap_or(""),
                "Final point status"
            );
        }
        for skipped in &self.dispatch.skipped {
            info!(point = %skipped.name, error = %skipped.error, "Point was skipped");
        }

        match serde_json::to_string(&summaries) {
            Ok(json) => debug!(summary = %json, "Final state"),
            Err(e) => warn!(error = %e, "Failed to serialize final state"),
        }

        info!("Poller stopped");
        summaries
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Point task panicked");
            }
        }
    }
}
