//! Runner lifecycle tests using an in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pointpoll::config::{PointSpec, RegisterKind};
use pointpoll::dispatcher::{Connector, Dispatcher};
use pointpoll::transport::{Transport, TransportError};
use pointpoll::{PointStatus, PollerRunner};

/// Always answers with the given words, after `delay`, and counts operations and closes.
#[derive(Clone)]
struct StaticDevice {
    words: Vec<u16>,
    delay: Duration,
    operations: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Transport for StaticDevice {
    async fn read_registers(
        &mut self,
        _kind: RegisterKind,
        _start: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .words
            .iter()
            .take(length as usize)
            .flat_map(|w| w.to_be_bytes())
            .collect())
    }

    async fn write_single_coil(&mut self, _address: u16, _value: bool) -> Result<(), TransportError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
struct StaticConnector {
    device: StaticDevice,
    connected: Arc<Mutex<Vec<String>>>,
}

impl StaticConnector {
    fn new(words: Vec<u16>) -> Self {
        Self {
            device: StaticDevice {
                words,
                delay: Duration::ZERO,
                operations: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            },
            connected: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Connector for StaticConnector {
    type Transport = StaticDevice;

    async fn connect(&self, spec: &PointSpec) -> Result<StaticDevice, TransportError> {
        self.connected.lock().unwrap().push(spec.name.clone());
        Ok(self.device.clone())
    }
}

fn points(json: &str) -> Vec<serde_json::Value> {
    json5::from_str(json).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_runner_stops_on_signal_and_closes_transports() {
    let connector = StaticConnector::new(vec![0x4048, 0xF5C3]);
    let config = points(
        r#"[
            { name: "a", protocol: "ModbusTCP", host: "h", fc: "FC3", registerLength: 2, interval: 1000 },
            { name: "b", protocol: "ModbusRTU", device: "/dev/ttyS0", fc: "FC4", registerLength: 2, interval: 500 },
        ]"#,
    );

    let runner = PollerRunner::start_with(&Dispatcher::with_connector(connector.clone()), &config);
    let summaries = runner
        .run_until(tokio::time::sleep(Duration::from_millis(2100)))
        .await;

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].name, "a");
    assert_eq!(summaries[0].state.cycles, 2);
    assert_eq!(summaries[1].name, "b");
    assert_eq!(summaries[1].state.cycles, 4);
    assert!(summaries.iter().all(|s| s.state.status == PointStatus::Ok));
    assert!(summaries.iter().all(|s| s.state.terminated));

    assert_eq!(connector.device.operations.load(Ordering::SeqCst), 6);
    assert_eq!(connector.device.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_runner_exits_when_all_points_finish() {
    let connector = StaticConnector::new(vec![0x4048, 0xF5C3]);
    let config = points(
        r#"[
            { protocol: "ModbusTCP", host: "h", fc: "FC5", registerStart: 5, value: true, interval: 0 },
            { protocol: "ModbusTCP", host: "h", fc: "FC3", registerLength: 2, interval: 0 },
        ]"#,
    );

    let runner = PollerRunner::start_with(&Dispatcher::with_connector(connector.clone()), &config);
    let summaries = runner.run_until(std::future::pending()).await;

    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.state.cycles == 1));
    assert_eq!(connector.device.operations.load(Ordering::SeqCst), 2);
    assert_eq!(connector.device.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_points_never_connect() {
    let connector = StaticConnector::new(vec![0x4048, 0xF5C3]);
    let config = points(
        r#"[
            { name: "typo", protocol: "modbus-xyz", fc: "FC3", registerLength: 2 },
            { name: "short", protocol: "ModbusTCP", host: "h", fc: "FC3", registerLength: 1 },
            { name: "fc", protocol: "ModbusTCP", host: "h", fc: "FC1", registerLength: 2 },
            { name: "ok", protocol: "ModbusTCP", host: "h", fc: "FC3", registerLength: 2, interval: 0 },
        ]"#,
    );

    let runner = PollerRunner::start_with(&Dispatcher::with_connector(connector.clone()), &config);
    let skipped: Vec<String> = runner.skipped().iter().map(|s| s.name.clone()).collect();
    assert_eq!(skipped, vec!["typo", "short", "fc"]);

    let summaries = runner.run_until(std::future::pending()).await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].state.status, PointStatus::Ok);
    assert_eq!(*connector.connected.lock().unwrap(), vec!["ok".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_no_valid_points_returns_immediately() {
    let connector = StaticConnector::new(Vec::new());
    let config = points(r#"[ { protocol: "bogus", fc: "FC3", registerLength: 2 } ]"#);

    let summaries = PollerRunner::start_with(&Dispatcher::with_connector(connector), &config)
        .run_until(std::future::pending())
        .await;

    assert!(summaries.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stuck_points_are_aborted_after_grace() {
    let mut connector = StaticConnector::new(vec![0x4048, 0xF5C3]);
    connector.device.delay = Duration::from_secs(60);
    let config = points(
        r#"[ { name: "stuck", protocol: "ModbusTCP", host: "h", fc: "FC3", registerLength: 2, interval: 100 } ]"#,
    );

    let started = tokio::time::Instant::now();
    let summaries = PollerRunner::start_with(&Dispatcher::with_connector(connector.clone()), &config)
        .with_grace(Duration::from_millis(500))
        .run_until(tokio::time::sleep(Duration::from_millis(300)))
        .await;

    assert_eq!(started.elapsed(), Duration::from_millis(800));
    assert_eq!(summaries[0].state.cycles, 0);
    assert!(!summaries[0].state.terminated);
    assert_eq!(connector.device.operations.load(Ordering::SeqCst), 1);
    assert_eq!(connector.device.closes.load(Ordering::SeqCst), 0);
}
