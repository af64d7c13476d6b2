//! One persistent TCP connection to one provider.
//!
//! The endpoint's background task owns the whole lifecycle:
//!
//! ```text
//!   Disconnected ──► Connecting ──connect ok──► Connected ──EOF / read error──┐
//!        ▲              │  ▲                        │                         │
//!        │              │  └── timeout: retry now   │                         │
//!        │              └───── io error: sleep ─────┘                         │
//!        └────────────────────────────────────────────────────────────────────┘
//!   close() from any state ──► Closed (terminal)
//! ```
//!
//! Sends issued while the endpoint is not connected wait for the connection
//! instead of failing. Inbound frames are handed to the [`FrameHandler`]
//! one at a time, in wire order.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::Address;
use crate::error::{Result, RpcError};
use crate::protocol::{Frame, FrameBuffer, ResyncPolicy, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{write_frame, OutboundFrame};

/// Boxed future type for handler callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default connect attempt timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default pause after a refused connect.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default socket read chunk size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal. Set by [`Endpoint::close`].
    Closed,
}

/// Receives inbound frames and connection-loss notifications.
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one complete frame read from `endpoint`.
    fn on_frame<'a>(&'a self, endpoint: &'a Endpoint, frame: Frame) -> BoxFuture<'a, ()>;

    /// Called after the connection dropped, before reconnecting.
    fn on_disconnect(&self, _endpoint: &Endpoint) {}
}

/// Endpoint tuning.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Upper bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Pause after a connect attempt fails with an I/O error.
    pub reconnect_delay: Duration,
    /// Largest accepted inbound payload.
    pub max_payload_size: u32,
    /// What to drop when the inbound stream loses alignment.
    pub resync: ResyncPolicy,
    /// Socket read chunk size.
    pub read_buffer_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            resync: ResyncPolicy::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

struct Inner {
    id: u64,
    addr: Address,
    config: EndpointConfig,
    handler: Arc<dyn FrameHandler>,
    state: watch::Sender<EndpointState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a persistent connection. Cheap to clone.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Create the endpoint and start connecting in the background.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(addr: Address, config: EndpointConfig, handler: Arc<dyn FrameHandler>) -> Self {
        let (state, _) = watch::channel(EndpointState::Disconnected);
        let endpoint = Self {
            inner: Arc::new(Inner {
                id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
                addr,
                config,
                handler,
                state,
                writer: Mutex::new(None),
                closed: AtomicBool::new(false),
                task: parking_lot::Mutex::new(None),
            }),
        };

        let task = tokio::spawn(endpoint.clone().run());
        *endpoint.inner.task.lock() = Some(task);
        endpoint
    }

    /// Process-unique endpoint id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn addr(&self) -> &Address {
        &self.inner.addr
    }

    /// Current connection state.
    pub fn state(&self) -> EndpointState {
        *self.inner.state.borrow()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait until the endpoint is connected.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                EndpointState::Connected => return Ok(()),
                EndpointState::Closed => return Err(RpcError::ConnectionClosed),
                _ => {}
            }
            state_rx
                .changed()
                .await
                .map_err(|_| RpcError::ConnectionClosed)?;
        }
    }

    /// Write one frame, waiting for the connection first if needed.
    ///
    /// Only a closed endpoint is an error. Write failures on a live socket
    /// are logged; the read side notices the broken connection and
    /// reconnects.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                EndpointState::Closed => return Err(RpcError::ConnectionClosed),
                EndpointState::Connected => {
                    let mut writer = self.inner.writer.lock().await;
                    if let Some(w) = writer.as_mut() {
                        if let Err(e) = write_frame(w, &frame).await {
                            tracing::warn!(
                                endpoint = %self.inner.addr,
                                error = %e,
                                "write failed, frame dropped"
                            );
                        }
                        // close() could not take the writer while this write held it.
                        if self.is_closed() {
                            writer.take();
                        }
                        return Ok(());
                    }
                }
                _ => {}
            }
            state_rx
                .changed()
                .await
                .map_err(|_| RpcError::ConnectionClosed)?;
        }
    }

    /// Close the endpoint. Idempotent; returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.state.send_replace(EndpointState::Closed);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        tracing::debug!(endpoint = %self.inner.addr, id = self.inner.id, "endpoint closed");
        true
    }

    fn set_state(&self, state: EndpointState) {
        if self.is_closed() {
            return;
        }
        self.inner.state.send_replace(state);
    }

    async fn run(self) {
        let config = &self.inner.config;
        let mut frame_buffer = FrameBuffer::with_config(config.max_payload_size, config.resync);
        loop {
            let stream = self.connect().await;
            let (reader, writer) = stream.into_split();
            *self.inner.writer.lock().await = Some(writer);
            if self.is_closed() {
                break;
            }
            self.set_state(EndpointState::Connected);
            tracing::info!(endpoint = %self.inner.addr, id = self.inner.id, "connected");

            // A partial frame from the previous connection never completes.
            frame_buffer.clear();
            let reason = self.read_loop(reader, &mut frame_buffer).await;

            self.inner.writer.lock().await.take();
            if self.is_closed() {
                break;
            }
            self.set_state(EndpointState::Disconnected);
            tracing::warn!(endpoint = %self.inner.addr, reason = %reason, "connection lost, reconnecting");
            self.inner.handler.on_disconnect(&self);
        }
    }

    /// Retry until a connection is established.
    ///
    /// Refused or failed attempts wait `reconnect_delay`; timed-out attempts
    /// have already waited `connect_timeout` and retry at once.
    async fn connect(&self) -> TcpStream {
        let addr = &self.inner.addr;
        loop {
            self.set_state(EndpointState::Connecting);
            match self.attempt().await {
                Ok(stream) => return stream,
                Err(e @ RpcError::Connect(_)) => {
                    tracing::error!(endpoint = %addr, error = %e, "connect timed out");
                }
                Err(e) => {
                    tracing::error!(endpoint = %addr, error = %e, "connect failed");
                    self.set_state(EndpointState::Disconnected);
                    tokio::time::sleep(self.inner.config.reconnect_delay).await;
                }
            }
        }
    }

    /// One connect attempt bounded by `connect_timeout`.
    async fn attempt(&self) -> Result<TcpStream> {
        let addr = &self.inner.addr;
        let timeout = self.inner.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect((addr.host.as_str(), addr.port)))
            .await
            .map_err(|_| {
                RpcError::Connect(format!(
                    "no connection to {} within {}ms",
                    addr,
                    timeout.as_millis()
                ))
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(endpoint = %addr, error = %e, "set_nodelay failed");
        }
        Ok(stream)
    }

    /// Read and dispatch frames until the connection ends. Returns the reason.
    async fn read_loop(&self, mut reader: OwnedReadHalf, frame_buffer: &mut FrameBuffer) -> String {
        let mut buf = vec![0u8; self.inner.config.read_buffer_size];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return "connection closed by peer".to_string(),
                Ok(n) => n,
                Err(e) => return format!("read failed: {}", e),
            };

            let frames = match frame_buffer.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => return e.to_string(),
            };

            for frame in frames {
                self.inner.handler.on_frame(self, frame).await;
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .finish()
    }
}
