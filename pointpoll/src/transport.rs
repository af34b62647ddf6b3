//! Modbus transports (TCP and RTU) behind one capability interface.
//!
//! Both variants hand back register reads as big-endian bytes (word 0 first,
//! each word high byte first) so decoding never depends on the transport.
//! Every call is bounded by the point's timeout, and a link that failed with
//! an I/O error or a timeout is re-established on the next call.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use crate::config::{ConnectionConfig, Parity, RegisterKind, SerialSettings};
use crate::decoder::words_to_bytes;

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Exception: {0}")]
    Exception(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport is closed")]
    Closed,
}

/// Uniform register access over any Modbus link.
pub trait Transport: Send {
    /// Read `length` registers starting at `start`, as big-endian bytes.
    fn read_registers(
        &mut self,
        kind: RegisterKind,
        start: u16,
        length: u16,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Write one coil.
    fn write_single_coil(
        &mut self,
        address: u16,
        value: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Release the underlying socket or serial port. Later calls fail with
    /// [`TransportError::Closed`].
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Await a tokio-modbus call within `timeout`, flattening its nested result.
async fn bounded<T, E, X, F>(timeout: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<Result<T, X>, E>>,
    E: fmt::Display,
    X: fmt::Debug,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(|e| TransportError::Exception(format!("{:?}", e)))
}

/// Delay between connection attempts: doubles from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

async fn open_tcp(
    host: &str,
    port: u16,
    unit_id: u8,
    timeout: Duration,
) -> Result<(Context, SocketAddr), TransportError> {
    let peer = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
        .next()
        .ok_or_else(|| {
            TransportError::Connection(format!("No address found for {}:{}", host, port))
        })?;

    let ctx = tokio::time::timeout(timeout, tcp::connect_slave(peer, Slave(unit_id)))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    debug!("Connected to Modbus TCP device at {}", peer);
    Ok((ctx, peer))
}

fn open_rtu(
    settings: &SerialSettings,
    unit_id: u8,
    timeout: Duration,
) -> Result<Context, TransportError> {
    let builder = tokio_serial::new(&settings.device, settings.baud_rate)
        .parity(serial_parity(settings.parity))
        .stop_bits(serial_stop_bits(settings.stop_bits))
        .data_bits(serial_data_bits(settings.data_bits))
        .timeout(timeout);

    let serial = tokio_serial::SerialStream::open(&builder)
        .map_err(|e| TransportError::Connection(format!("Serial open failed: {}", e)))?;

    debug!("Opened serial port {}", settings.device);
    Ok(rtu::attach_slave(serial, Slave(unit_id)))
}

async fn open(
    connection: &ConnectionConfig,
    unit_id: u8,
    timeout: Duration,
) -> Result<Context, TransportError> {
    match connection {
        ConnectionConfig::Tcp { host, port } => Ok(open_tcp(host, *port, unit_id, timeout).await?.0),
        ConnectionConfig::Rtu(settings) => open_rtu(settings, unit_id, timeout),
    }
}

/// A tokio-modbus context shared by both transport variants.
///
/// The context is dropped after an I/O error or a timeout, so neither a late
/// reply nor a socket closed by the peer reaches the next request. The next
/// call opens a fresh one, no earlier than the backoff allows.
struct Session {
    connection: ConnectionConfig,
    unit_id: u8,
    timeout: Duration,
    ctx: Option<Context>,
    closed: bool,
    backoff: Backoff,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Session {
    fn new(connection: ConnectionConfig, unit_id: u8, timeout: Duration, ctx: Context) -> Self {
        Self {
            connection,
            unit_id,
            timeout,
            ctx: Some(ctx),
            closed: false,
            backoff: Backoff::default(),
            failures: 0,
            retry_at: None,
        }
    }

    /// The live context, reconnecting first if the last one was dropped.
    async fn context(&mut self) -> Result<&mut Context, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        if self.ctx.is_none() {
            if let Some(at) = self.retry_at {
                let now = Instant::now();
                if now < at {
                    return Err(TransportError::Connection(format!(
                        "Reconnect in {:?}",
                        at - now
                    )));
                }
            }

            match open(&self.connection, self.unit_id, self.timeout).await {
                Ok(ctx) => {
                    info!(connection = ?self.connection, "Reconnected");
                    self.ctx = Some(ctx);
                    self.failures = 0;
                    self.retry_at = None;
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    self.retry_at = Some(Instant::now() + self.backoff.delay(self.failures));
                    return Err(e);
                }
            }
        }

        self.ctx.as_mut().ok_or(TransportError::Closed)
    }

    /// Drop the context when `result` leaves the link in an unknown state.
    fn settle<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(TransportError::Io(_) | TransportError::Timeout(_)) = &result {
            if self.ctx.take().is_some() {
                debug!(connection = ?self.connection, "Dropping connection after failure");
            }
        }
        result
    }

    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        start: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let timeout = self.timeout;
        let ctx = self.context().await?;
        let result = match kind {
            RegisterKind::Holding => bounded(timeout, ctx.read_holding_registers(start, length)).await,
            RegisterKind::Input => bounded(timeout, ctx.read_input_registers(start, length)).await,
        };
        self.settle(result).map(|words| words_to_bytes(&words))
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let ctx = self.context().await?;
        let result = bounded(timeout, ctx.write_single_coil(address, value)).await;
        self.settle(result)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        match self.ctx.take() {
            Some(mut ctx) => tokio::time::timeout(self.timeout, ctx.disconnect())
                .await
                .map_err(|_| TransportError::Timeout(self.timeout))?
                .map_err(|e| TransportError::Io(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Modbus TCP transport.
pub struct TcpTransport {
    session: Session,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Resolve `host:port` and open the socket.
    pub async fn connect(
        host: &str,
        port: u16,
        unit_id: u8,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (ctx, peer) = open_tcp(host, port, unit_id, timeout).await?;
        let connection = ConnectionConfig::Tcp {
            host: host.to_string(),
            port,
        };
        Ok(Self {
            session: Session::new(connection, unit_id, timeout, ctx),
            peer,
        })
    }

    /// Address the first connection resolved to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        start: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        self.session.read_registers(kind, start, length).await
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        self.session.write_single_coil(address, value).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session.close().await
    }
}

/// Modbus RTU transport over a serial line.
///
/// Exceptions leave the port open; I/O errors and timeouts reopen it.
pub struct RtuTransport {
    session: Session,
    device: String,
}

impl RtuTransport {
    /// Open the serial device and bind the unit address.
    pub fn open(
        settings: &SerialSettings,
        unit_id: u8,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let ctx = open_rtu(settings, unit_id, timeout)?;
        Ok(Self {
            session: Session::new(ConnectionConfig::Rtu(settings.clone()), unit_id, timeout, ctx),
            device: settings.device.clone(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Transport for RtuTransport {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        start: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        self.session.read_registers(kind, start, length).await
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        self.session.write_single_coil(address, value).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session.close().await
    }
}

fn serial_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn serial_stop_bits(stop_bits: u8) -> tokio_serial::StopBits {
    match stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn serial_data_bits(data_bits: u8) -> tokio_serial::DataBits {
    match data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

/// Either transport, selected from a point's connection settings.
pub enum Link {
    Tcp(TcpTransport),
    Rtu(RtuTransport),
}

impl Link {
    /// Connect (TCP) or open (RTU) according to `connection`.
    pub async fn establish(
        connection: &ConnectionConfig,
        unit_id: u8,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        match connection {
            ConnectionConfig::Tcp { host, port } => {
                Ok(Link::Tcp(TcpTransport::connect(host, *port, unit_id, timeout).await?))
            }
            ConnectionConfig::Rtu(settings) => {
                Ok(Link::Rtu(RtuTransport::open(settings, unit_id, timeout)?))
            }
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Tcp(t) => write!(f, "Link::Tcp({})", t.peer()),
            Link::Rtu(r) => write!(f, "Link::Rtu({})", r.device()),
        }
    }
}

impl Transport for Link {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        start: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        match self {
            Link::Tcp(t) => t.read_registers(kind, start, length).await,
            Link::Rtu(r) => r.read_registers(kind, start, length).await,
        }
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), TransportError> {
        match self {
            Link::Tcp(t) => t.write_single_coil(address, value).await,
            Link::Rtu(r) => r.write_single_coil(address, value).await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self {
            Link::Tcp(t) => t.close().await,
            Link::Rtu(r) => r.close().await,
        }
    }
}
