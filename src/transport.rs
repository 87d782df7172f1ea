//! # Modbus TCP Transport Layer
//!
//! This module owns the TCP connection used to exchange MBAP frames with a
//! device. It serializes writes, runs a background read loop, matches
//! responses to requests by transaction id and closes the connection after a
//! configurable idle period.
//!
//! ## Architecture
//!
//! ```text
//!  caller ── send(frame) ──┐                        ┌── push handler (id 0)
//!                          ▼                        │
//!            ┌──────────────────────────┐   ┌───────┴────────┐
//!            │ state lock               │   │ read loop      │
//!            │  register id ─► table ◄──┼───┤  header + body │
//!            │  write frame             │   │  resolve id    │
//!            └──────────────────────────┘   └────────────────┘
//!                          │                        ▲
//!                          └──── TCP write ─► peer ─┘
//! ```
//!
//! The state lock covers activity tracking, correlation registration and the
//! write. The wait for the response happens outside the lock, so several
//! requests can be in flight on one connection as long as their transaction
//! ids differ.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_modbus_link::{TcpTransportConfig, TcpTransporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TcpTransportConfig::new("192.168.12.239:502")
//!         .with_timeout(Duration::from_secs(3));
//!
//!     let transporter = TcpTransporter::builder(config)
//!         .push_handler(|frame| println!("push: {:02X?}", frame))
//!         .build();
//!
//!     // keep the session alive in the background and reconnect on failure
//!     let supervisor = transporter.clone();
//!     tokio::spawn(async move {
//!         loop {
//!             if let Err(e) = supervisor.connect().await {
//!                 eprintln!("connection ended: {}", e);
//!             }
//!             tokio::time::sleep(Duration::from_secs(3)).await;
//!         }
//!     });
//!
//!     tokio::time::sleep(Duration::from_millis(100)).await;
//!     let response = transporter
//!         .send(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x02, 0x00, 0xC8, 0x00, 0x01])
//!         .await?;
//!     println!("response: {:02X?}", response);
//!     Ok(())
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TcpTransportConfig;
use crate::correlation::CorrelationTable;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{
    self, TransactionId, MAX_MBAP_LENGTH, MAX_TCP_FRAME_SIZE, MBAP_HEADER_SIZE,
    MIN_TCP_FRAME_SIZE, PUSH_TRANSACTION_ID,
};
use crate::utils::format::format_duration;
use crate::utils::{duration_ms, OperationTimer};

/// Callback receiving unsolicited frames (transaction id 0)
///
/// Invoked on the read loop, so it must return quickly; hand the frame off
/// to a channel for anything expensive.
pub type PushHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Frame transport capability consumed by the function-code layer
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Connect and keep the connection serviced until it terminates
    async fn connect(&self) -> ModbusResult<()>;

    /// Send a complete request frame and wait for the correlated response
    async fn send(&self, request: &[u8]) -> ModbusResult<Vec<u8>>;

    /// Close the current connection
    async fn close(&self) -> ModbusResult<()>;

    /// Check if a connection is currently established
    fn is_connected(&self) -> bool;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connections: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub push_messages: u64,
    pub dropped_frames: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct StatsCounters {
    connections: AtomicU64,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    push_messages: AtomicU64,
    dropped_frames: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            connections: self.connections.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            push_messages: self.push_messages.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Everything guarded by the connection lock
struct ConnectionState {
    writer: Option<OwnedWriteHalf>,
    /// Dropping the sender stops the read loop of the current session
    shutdown: Option<oneshot::Sender<()>>,
    session: u64,
    last_activity: Instant,
    idle_timer: Option<JoinHandle<()>>,
}

struct Inner {
    config: TcpTransportConfig,
    push_handler: Option<PushHandler>,
    logger: CallbackLogger,
    state: tokio::sync::Mutex<ConnectionState>,
    pending: CorrelationTable,
    connected: AtomicBool,
    last_error: Mutex<Option<ModbusError>>,
    stats: StatsCounters,
}

/// Builder for [`TcpTransporter`]
pub struct TcpTransporterBuilder {
    config: TcpTransportConfig,
    push_handler: Option<PushHandler>,
    logger: CallbackLogger,
}

impl TcpTransporterBuilder {
    /// Register the callback for unsolicited device frames
    pub fn push_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.push_handler = Some(Arc::new(handler));
        self
    }

    /// Attach a diagnostic log sink
    pub fn logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> TcpTransporter {
        TcpTransporter {
            inner: Arc::new(Inner {
                config: self.config,
                push_handler: self.push_handler,
                logger: self.logger,
                state: tokio::sync::Mutex::new(ConnectionState {
                    writer: None,
                    shutdown: None,
                    session: 0,
                    last_activity: Instant::now(),
                    idle_timer: None,
                }),
                pending: CorrelationTable::new(),
                connected: AtomicBool::new(false),
                last_error: Mutex::new(None),
                stats: StatsCounters::default(),
            }),
        }
    }
}

/// Modbus TCP transport with background response correlation
///
/// Clones share the same connection. One transporter drives at most one
/// physical connection at a time.
#[derive(Clone)]
pub struct TcpTransporter {
    inner: Arc<Inner>,
}

impl TcpTransporter {
    /// Create a transporter without push handler or log sink
    pub fn new(config: TcpTransportConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: TcpTransportConfig) -> TcpTransporterBuilder {
        TcpTransporterBuilder {
            config,
            push_handler: None,
            logger: CallbackLogger::default(),
        }
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.inner.config
    }

    pub fn logger(&self) -> &CallbackLogger {
        &self.inner.logger
    }

    /// Connect and service the connection until it terminates
    ///
    /// Returns `Ok(())` when the connection was closed locally (`close` or
    /// idle timeout) and the terminal error when the connection failed.
    /// Reconnecting is left to the caller.
    pub async fn connect(&self) -> ModbusResult<()> {
        let session = self.open().await?;
        session
            .await
            .map_err(|e| ModbusError::internal(format!("read loop task failed: {}", e)))?
    }

    /// Establish the connection and spawn its read loop
    ///
    /// The returned handle completes when the connection terminates, with the
    /// same result `connect` would return.
    pub async fn open(&self) -> ModbusResult<JoinHandle<ModbusResult<()>>> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.writer.is_some() {
            return Err(ModbusError::connection(format!(
                "already connected to {}",
                inner.config.address
            )));
        }

        let stream = match inner.dial().await {
            Ok(stream) => stream,
            Err(error) => {
                inner.logger.error(&format!("modbus: {}", error));
                inner.record_error(error.clone());
                return Err(error);
            }
        };
        let (reader, writer) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        state.session += 1;
        state.writer = Some(writer);
        state.shutdown = Some(shutdown_tx);
        state.last_activity = Instant::now();
        inner.arm_idle_timer(&mut state);
        inner.connected.store(true, Ordering::SeqCst);
        StatsCounters::incr(&inner.stats.connections);
        if let Ok(mut last_error) = inner.last_error.lock() {
            *last_error = None;
        }

        let session = state.session;
        info!(address = %inner.config.address, session, "modbus connection established");
        inner.logger.info(&format!("modbus: connected to {}", inner.config.address));

        let task_inner = inner.clone();
        Ok(tokio::spawn(async move {
            task_inner.read_loop(reader, shutdown_rx, session).await
        }))
    }

    /// Send a request frame and wait for the response with the same transaction id
    ///
    /// The wait is bounded by the configured timeout. The correlation entry is
    /// removed before this returns, whatever the outcome.
    pub async fn send(&self, request: &[u8]) -> ModbusResult<Vec<u8>> {
        let inner = &self.inner;
        if request.len() < MIN_TCP_FRAME_SIZE {
            return Err(ModbusError::frame_too_short(request.len(), MIN_TCP_FRAME_SIZE));
        }
        let transaction_id = protocol::transaction_id(request)
            .ok_or_else(|| ModbusError::frame_too_short(request.len(), MIN_TCP_FRAME_SIZE))?;
        let wait = inner.config.timeout;
        let timer = OperationTimer::start(format!("transaction {}", transaction_id));

        let (ticket, slot) = {
            let mut state = inner.state.lock().await;
            if state.writer.is_none() {
                return Err(ModbusError::connection(format!(
                    "not connected to {}",
                    inner.config.address
                )));
            }

            state.last_activity = Instant::now();
            inner.arm_idle_timer(&mut state);

            // registered before the write so a fast response cannot slip past
            let (ticket, slot) = inner.pending.register(transaction_id)?;
            inner.logger.log_frame("send", request);

            let result = match state.writer.as_mut() {
                Some(writer) => write_frame(writer, request, wait).await,
                None => Err(ModbusError::connection("connection lost")),
            };
            if let Err(error) = result {
                inner.pending.cancel(ticket);
                StatsCounters::incr(&inner.stats.errors);
                inner.logger.error(&format!("modbus: write transaction {}: {}", transaction_id, error));
                return Err(error);
            }

            StatsCounters::incr(&inner.stats.requests_sent);
            StatsCounters::add(&inner.stats.bytes_sent, request.len());
            (ticket, slot)
        };

        let _guard = inner.pending.guard(ticket);
        let outcome = if wait.is_zero() {
            Ok(slot.await)
        } else {
            timeout(wait, slot).await
        };

        match outcome {
            Ok(Ok(response)) => {
                timer.stop();
                Ok(response)
            }
            Ok(Err(_)) => {
                StatsCounters::incr(&inner.stats.errors);
                Err(ModbusError::connection(format!(
                    "connection closed while waiting for transaction {}",
                    transaction_id
                )))
            }
            Err(_) => {
                StatsCounters::incr(&inner.stats.timeouts);
                let error = ModbusError::transaction_timeout(transaction_id, duration_ms(wait));
                inner.logger.warn(&format!("modbus: {}", error));
                Err(error)
            }
        }
    }

    /// Close the current connection
    ///
    /// Idempotent. Waiting `send` calls are released with a connection error.
    pub async fn close(&self) -> ModbusResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.close_locked(&mut state, "closed by caller").await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Error that terminated the last connection attempt or session
    pub fn last_error(&self) -> Option<ModbusError> {
        self.inner.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Transaction ids currently waiting for a response
    pub fn pending_transactions(&self) -> Vec<TransactionId> {
        self.inner.pending.transaction_ids()
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }
}

#[async_trait]
impl Transporter for TcpTransporter {
    async fn connect(&self) -> ModbusResult<()> {
        TcpTransporter::connect(self).await
    }

    async fn send(&self, request: &[u8]) -> ModbusResult<Vec<u8>> {
        TcpTransporter::send(self, request).await
    }

    async fn close(&self) -> ModbusResult<()> {
        TcpTransporter::close(self).await
    }

    fn is_connected(&self) -> bool {
        TcpTransporter::is_connected(self)
    }
}

/// Write a complete frame, bounded by `deadline` unless it is zero
async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8], deadline: Duration) -> ModbusResult<()> {
    if deadline.is_zero() {
        return writer.write_all(frame).await.map_err(ModbusError::from);
    }
    match timeout(deadline, writer.write_all(frame)).await {
        Ok(result) => result.map_err(ModbusError::from),
        Err(_) => Err(ModbusError::timeout("write request", duration_ms(deadline))),
    }
}

/// Read the rest of a frame, bounded by `deadline` unless it is zero
async fn read_body(reader: &mut OwnedReadHalf, body: &mut [u8], deadline: Duration) -> ModbusResult<()> {
    if deadline.is_zero() {
        return reader.read_exact(body).await.map(|_| ()).map_err(ModbusError::from);
    }
    match timeout(deadline, reader.read_exact(body)).await {
        Ok(result) => result.map(|_| ()).map_err(ModbusError::from),
        Err(_) => Err(ModbusError::timeout("read response body", duration_ms(deadline))),
    }
}

impl Inner {
    async fn dial(&self) -> ModbusResult<TcpStream> {
        let address = self.config.address.as_str();
        let connect = TcpStream::connect(address);
        let result = if self.config.timeout.is_zero() {
            connect.await
        } else {
            match timeout(self.config.timeout, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ModbusError::timeout(
                        format!("connect to {}", address),
                        duration_ms(self.config.timeout),
                    ))
                }
            }
        };

        let stream = result
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        Ok(stream)
    }

    fn record_error(&self, error: ModbusError) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(error);
        }
    }

    /// (Re)start the idle timer from now
    fn arm_idle_timer(self: &Arc<Self>, state: &mut ConnectionState) {
        let idle_timeout = self.config.idle_timeout;
        if idle_timeout.is_zero() {
            return;
        }
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.close_idle().await;
            }
        }));
    }

    /// Close the connection if it saw no activity for the idle timeout
    ///
    /// The elapsed time is checked again here because the timer may have
    /// been rearmed while this task waited for the lock. A connection with
    /// requests still waiting for their response is not idle.
    async fn close_idle(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let idle_timeout = self.config.idle_timeout;
        if idle_timeout.is_zero() || state.writer.is_none() {
            return;
        }

        let idle = state.last_activity.elapsed();
        if idle >= idle_timeout {
            // this task is the timer, it must not abort itself
            drop(state.idle_timer.take());
            if !self.pending.is_empty() {
                debug!(pending = self.pending.len(), "idle timeout deferred, requests in flight");
                self.arm_idle_timer(&mut state);
                return;
            }
            info!(?idle, "closing modbus connection due to idle timeout");
            self.logger
                .info(&format!("modbus: closing connection due to idle timeout: {}", format_duration(idle)));
            let _ = self.close_locked(&mut state, "idle timeout").await;
        }
    }

    /// Tear down the connection; the caller holds the state lock
    async fn close_locked(&self, state: &mut ConnectionState, reason: &str) -> ModbusResult<()> {
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        // wakes the read loop of this session
        drop(state.shutdown.take());

        let was_open = match state.writer.take() {
            Some(mut writer) => {
                let _ = writer.shutdown().await;
                true
            }
            None => false,
        };
        self.connected.store(false, Ordering::SeqCst);

        let released = self.pending.clear();
        if was_open {
            info!(reason, released, "modbus connection closed");
        }
        if released > 0 {
            self.logger.warn(&format!(
                "modbus: connection closed ({}), released {} waiting request(s)",
                reason, released
            ));
        }
        Ok(())
    }

    /// Close the connection of `session` after a fatal read error
    async fn close_session(&self, session: u64, reason: &str) {
        let mut state = self.state.lock().await;
        if state.session == session {
            let _ = self.close_locked(&mut state, reason).await;
        }
    }

    /// Drain whatever is currently buffered on the connection without blocking
    fn flush(&self, reader: &OwnedReadHalf, buf: &mut [u8]) {
        let mut drained = 0usize;
        loop {
            match reader.try_read(buf) {
                Ok(0) => break,
                Ok(n) => drained += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "flush failed");
                    break;
                }
            }
        }
        if drained > 0 {
            debug!(drained, "flushed pending bytes");
        }
    }

    /// Parse frames off the connection until it fails or is closed
    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        mut shutdown: oneshot::Receiver<()>,
        session: u64,
    ) -> ModbusResult<()> {
        let mut buf = [0u8; MAX_TCP_FRAME_SIZE];

        loop {
            let header = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(session, "read loop stopped");
                    return Ok(());
                }
                result = reader.read_exact(&mut buf[..MBAP_HEADER_SIZE]) => result,
            };

            if let Err(e) = header {
                let error = ModbusError::io(format!("read header error: {}", e));
                warn!(session, error = %e, "modbus read loop terminated");
                StatsCounters::incr(&self.stats.errors);
                self.logger.error(&format!("modbus: {}", error));
                self.record_error(error.clone());
                self.close_session(session, "read header failed").await;
                return Err(error);
            }

            // transaction and protocol id are not needed to frame the body
            let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            if length == 0 || length > MAX_MBAP_LENGTH {
                self.flush(&reader, &mut buf);
                StatsCounters::incr(&self.stats.dropped_frames);
                self.logger.warn(&format!(
                    "modbus: length in response header '{}' must be between 1 and '{}'",
                    length, MAX_MBAP_LENGTH
                ));
                continue;
            }

            // the unit id was already read with the header
            let frame_len = MBAP_HEADER_SIZE - 1 + length;
            let body_result = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(session, "read loop stopped inside a frame");
                    return Ok(());
                }
                result = read_body(&mut reader, &mut buf[MBAP_HEADER_SIZE..frame_len], self.config.timeout) => result,
            };
            if let Err(error) = body_result {
                StatsCounters::incr(&self.stats.dropped_frames);
                self.logger.warn(&format!("modbus: dropping frame, {}", error));
                continue;
            }

            let frame = buf[..frame_len].to_vec();
            StatsCounters::add(&self.stats.bytes_received, frame.len());
            self.logger.log_frame("recv", &frame);
            self.dispatch(frame);
        }
    }

    /// Route a complete frame to the push handler or its waiter
    fn dispatch(&self, frame: Vec<u8>) {
        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);

        if transaction_id == PUSH_TRANSACTION_ID {
            StatsCounters::incr(&self.stats.push_messages);
            match &self.push_handler {
                Some(handler) => handler(&frame),
                None => debug!(len = frame.len(), "push message without handler dropped"),
            }
            return;
        }

        if self.pending.resolve(transaction_id, frame) {
            StatsCounters::incr(&self.stats.responses_received);
        } else {
            StatsCounters::incr(&self.stats.dropped_frames);
            self.logger.warn(&format!(
                "modbus: no request waiting for transaction {}, response dropped",
                transaction_id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, address)
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let transporter = TcpTransporter::new(TcpTransportConfig::new("127.0.0.1:1"));
        let err = transporter
            .send(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03])
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert!(transporter.pending_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_send_rejects_short_frame() {
        let transporter = TcpTransporter::new(TcpTransportConfig::new("127.0.0.1:1"));
        let err = transporter.send(&[0x00, 0x01, 0x00]).await.unwrap_err();
        assert!(matches!(err, ModbusError::FrameTooShort { length: 3, .. }));
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded() {
        let (listener, address) = listener().await;
        drop(listener);

        let transporter = TcpTransporter::new(TcpTransportConfig::new(address));
        let err = transporter.connect().await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert_eq!(transporter.last_error(), Some(err));
        assert!(!transporter.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, address) = listener().await;
        let transporter = TcpTransporter::new(TcpTransportConfig::new(address));

        let session = transporter.open().await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();
        assert!(transporter.is_connected());

        transporter.close().await.unwrap();
        transporter.close().await.unwrap();
        assert!(!transporter.is_connected());
        assert!(session.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_open_twice_is_rejected() {
        let (listener, address) = listener().await;
        let transporter = TcpTransporter::new(TcpTransportConfig::new(address));

        let _session = transporter.open().await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let err = transporter.open().await.unwrap_err();
        assert!(err.to_string().contains("already connected"));
        transporter.close().await.unwrap();
    }
}
