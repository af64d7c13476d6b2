//! The logical connection to one provider address.
//!
//! A channel owns the endpoints for its address, decodes and dispatches
//! every inbound frame, and optionally drives an idle heartbeat.
//!
//! Endpoints are reached through a [`Route`]:
//! - `Shared` - the channel's single long-lived endpoint (pooled mode)
//! - `Session(token)` - an endpoint dedicated to one session, created on first use
//! - `Ephemeral` - a fresh endpoint closed as soon as its lease is dropped

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::Serialization;
use crate::config::ConnectionMode;
use crate::error::{Result, RpcError};
use crate::pending::PendingCalls;
use crate::protocol::{
    decode_frame, encode_request, encode_response, Frame, Message, Request, Response, Status,
};
use crate::transport::{Address, BoxFuture, Endpoint, EndpointConfig, FrameHandler};
use crate::writer::OutboundFrame;

/// Opaque token pinning calls to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(uuid::Uuid);

impl SessionToken {
    /// A fresh random token.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which endpoint a call goes out on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Shared,
    Session(SessionToken),
    Ephemeral,
}

/// Channel settings derived from the client config.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: EndpointConfig,
    pub mode: ConnectionMode,
    /// Idle interval after which a heartbeat goes out; `None` disables it.
    pub heartbeat: Option<Duration>,
    pub fail_pending_on_disconnect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            mode: ConnectionMode::Pooled,
            heartbeat: None,
            fail_pending_on_disconnect: false,
        }
    }
}

/// Last read/write times, as milliseconds since the channel was created.
pub struct Activity {
    origin: Instant,
    last_read: AtomicU64,
    last_write: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn touch_read(&self) {
        self.last_read.store(self.now_ms(), Ordering::Relaxed);
    }

    #[inline]
    pub fn touch_write(&self) {
        self.last_write.store(self.now_ms(), Ordering::Relaxed);
    }

    /// True when either direction has been idle for at least `interval`.
    pub fn needs_heartbeat(&self, interval: Duration) -> bool {
        idle_exceeded(
            self.now_ms(),
            self.last_read.load(Ordering::Relaxed),
            self.last_write.load(Ordering::Relaxed),
            interval.as_millis() as u64,
        )
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

fn idle_exceeded(now: u64, last_read: u64, last_write: u64, interval: u64) -> bool {
    now.saturating_sub(last_read) >= interval || now.saturating_sub(last_write) >= interval
}

/// Routes inbound frames: event requests get a heartbeat reply, event
/// responses are dropped, other responses resolve pending calls.
struct Dispatcher {
    registry: Arc<PendingCalls>,
    serialization: Arc<dyn Serialization>,
    activity: Arc<Activity>,
    fail_pending_on_disconnect: bool,
}

impl Dispatcher {
    async fn dispatch(&self, endpoint: &Endpoint, frame: Frame) {
        self.activity.touch_read();
        let id = frame.request_id();

        match decode_frame(&frame, self.serialization.as_ref()) {
            Ok(Message::Request(request)) if request.is_event() => {
                tracing::debug!(
                    endpoint = %endpoint.addr(),
                    request_id = id,
                    two_way = request.two_way,
                    "answering event"
                );
                match encode_response(&Response::heartbeat(id), self.serialization.as_ref())
                    .map(OutboundFrame::from_encoded)
                {
                    Ok(Some(reply)) => {
                        if endpoint.send(reply).await.is_ok() {
                            self.activity.touch_write();
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "failed to encode heartbeat reply"),
                }
            }
            Ok(Message::Request(_)) => {
                tracing::warn!(endpoint = %endpoint.addr(), request_id = id, "ignoring inbound request");
            }
            Ok(Message::Response(response)) if response.event => {
                tracing::debug!(endpoint = %endpoint.addr(), request_id = id, "heartbeat reply");
            }
            Ok(Message::Response(response)) => {
                self.registry.complete(response);
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint.addr(), request_id = id, error = %e, "undecodable frame");
                if frame.is_response() && !frame.is_event() {
                    self.registry.complete(Response::error(
                        id,
                        Status::ClientError,
                        format!("failed to decode response: {}", e),
                    ));
                }
            }
        }
    }
}

impl FrameHandler for Dispatcher {
    fn on_frame<'a>(&'a self, endpoint: &'a Endpoint, frame: Frame) -> BoxFuture<'a, ()> {
        Box::pin(self.dispatch(endpoint, frame))
    }

    fn on_disconnect(&self, endpoint: &Endpoint) {
        if self.fail_pending_on_disconnect {
            self.registry
                .fail_endpoint(endpoint.id(), &format!("connection to {} lost", endpoint.addr()));
        }
    }
}

/// An endpoint borrowed for one call.
///
/// Ephemeral endpoints are closed when the lease is dropped.
pub struct EndpointLease {
    endpoint: Endpoint,
    ephemeral: bool,
}

impl EndpointLease {
    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLease")
            .field("endpoint", &self.endpoint)
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        if self.ephemeral {
            self.endpoint.close();
        }
    }
}

struct ChannelInner {
    addr: Address,
    config: ChannelConfig,
    registry: Arc<PendingCalls>,
    serialization: Arc<dyn Serialization>,
    activity: Arc<Activity>,
    handler: Arc<dyn FrameHandler>,
    pooled: Option<Endpoint>,
    sessions: Mutex<HashMap<SessionToken, Endpoint>>,
    closed: AtomicBool,
}

impl ChannelInner {
    fn open_endpoint(&self) -> Endpoint {
        Endpoint::start(self.addr.clone(), self.config.endpoint.clone(), self.handler.clone())
    }

    fn connected_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.pooled.iter().cloned().collect();
        endpoints.extend(self.sessions.lock().values().cloned());
        endpoints.retain(Endpoint::is_connected);
        endpoints
    }

    async fn heartbeat_tick(&self, interval: Duration) {
        if !self.activity.needs_heartbeat(interval) {
            return;
        }
        for endpoint in self.connected_endpoints() {
            let id = self.registry.next_id();
            let frame = match encode_request(&Request::heartbeat(id), self.serialization.as_ref()) {
                Ok(bytes) => OutboundFrame::from_encoded(bytes),
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode heartbeat");
                    return;
                }
            };
            let Some(frame) = frame else { return };
            tracing::debug!(endpoint = %endpoint.addr(), request_id = id, "sending heartbeat");
            if endpoint.send(frame).await.is_ok() {
                self.activity.touch_write();
            }
        }
    }
}

/// Connection(s) to one provider address.
pub struct Channel {
    inner: Arc<ChannelInner>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Channel {
    /// Create the channel. In pooled mode the shared endpoint starts
    /// connecting immediately.
    pub fn new(
        addr: Address,
        config: ChannelConfig,
        registry: Arc<PendingCalls>,
        serialization: Arc<dyn Serialization>,
    ) -> Self {
        let activity = Arc::new(Activity::new());
        let handler: Arc<dyn FrameHandler> = Arc::new(Dispatcher {
            registry: registry.clone(),
            serialization: serialization.clone(),
            activity: activity.clone(),
            fail_pending_on_disconnect: config.fail_pending_on_disconnect,
        });
        let pooled = match config.mode {
            ConnectionMode::Pooled => Some(Endpoint::start(
                addr.clone(),
                config.endpoint.clone(),
                handler.clone(),
            )),
            ConnectionMode::Ephemeral => None,
        };
        let heartbeat_interval = config.heartbeat;

        let inner = Arc::new(ChannelInner {
            addr,
            config,
            registry,
            serialization,
            activity,
            handler,
            pooled,
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let heartbeat =
            heartbeat_interval.map(|interval| spawn_heartbeat(Arc::downgrade(&inner), interval));

        Self { inner, heartbeat }
    }

    #[inline]
    pub fn addr(&self) -> &Address {
        &self.inner.addr
    }

    pub fn activity(&self) -> &Activity {
        &self.inner.activity
    }

    /// The shared endpoint, if this channel is pooled.
    pub fn pooled_endpoint(&self) -> Option<&Endpoint> {
        self.inner.pooled.as_ref()
    }

    /// Borrow the endpoint a call on `route` should use.
    pub fn lease(&self, route: &Route) -> Result<EndpointLease> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let lease = match route {
            Route::Shared => match &self.inner.pooled {
                Some(endpoint) => EndpointLease {
                    endpoint: endpoint.clone(),
                    ephemeral: false,
                },
                None => EndpointLease {
                    endpoint: self.inner.open_endpoint(),
                    ephemeral: true,
                },
            },
            Route::Session(token) => {
                let endpoint = self
                    .inner
                    .sessions
                    .lock()
                    .entry(token.clone())
                    .or_insert_with(|| self.inner.open_endpoint())
                    .clone();
                EndpointLease {
                    endpoint,
                    ephemeral: false,
                }
            }
            Route::Ephemeral => EndpointLease {
                endpoint: self.inner.open_endpoint(),
                ephemeral: true,
            },
        };
        Ok(lease)
    }

    /// Write a frame on `endpoint` and record the write time.
    pub async fn send(&self, endpoint: &Endpoint, frame: OutboundFrame) -> Result<()> {
        endpoint.send(frame).await?;
        self.inner.activity.touch_write();
        Ok(())
    }

    /// Close and forget the endpoint bound to `token`.
    pub fn close_session(&self, token: &SessionToken) -> bool {
        let endpoint = self.inner.sessions.lock().remove(token);
        match endpoint {
            Some(endpoint) => endpoint.close(),
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Close every endpoint and stop the heartbeat.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        if let Some(endpoint) = &self.inner.pooled {
            endpoint.close();
        }
        let sessions: Vec<Endpoint> = self.inner.sessions.lock().drain().map(|(_, e)| e).collect();
        for endpoint in sessions {
            endpoint.close();
        }
        tracing::debug!(addr = %self.inner.addr, "channel closed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_heartbeat(inner: Weak<ChannelInner>, interval: Duration) -> JoinHandle<()> {
    // interval_at panics on a zero period.
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.heartbeat_tick(interval).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerialization;
    use crate::protocol::{FrameBuffer, RequestData};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_idle_exceeded() {
        assert!(!idle_exceeded(2000, 1500, 1500, 3000));
        assert!(idle_exceeded(5000, 1000, 4900, 3000));
        assert!(idle_exceeded(5000, 4900, 2000, 3000));
        assert!(idle_exceeded(3000, 0, 0, 3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_tracks_both_directions() {
        let activity = Activity::new();
        let interval = Duration::from_secs(3);
        assert!(!activity.needs_heartbeat(interval));

        tokio::time::advance(Duration::from_secs(2)).await;
        activity.touch_read();
        tokio::time::advance(Duration::from_secs(2)).await;
        // Writes idle for 4s even though reads are fresh.
        assert!(activity.needs_heartbeat(interval));

        activity.touch_write();
        assert!(!activity.needs_heartbeat(interval));
    }

    #[test]
    fn test_session_tokens_are_unique() {
        assert_ne!(SessionToken::new(), SessionToken::new());
    }

    async fn read_frame(socket: &mut TcpStream, buffer: &mut FrameBuffer) -> Frame {
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed");
            let mut frames = buffer.push(&buf[..n]).unwrap();
            if !frames.is_empty() {
                return frames.remove(0);
            }
        }
    }

    fn setup(addr: Address, config: ChannelConfig) -> (Channel, Arc<PendingCalls>) {
        let registry = Arc::new(PendingCalls::new());
        let channel = Channel::new(addr, config, registry.clone(), Arc::new(MsgPackSerialization));
        (channel, registry)
    }

    async fn listener() -> (TcpListener, Address) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Address::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_inbound_heartbeat_is_answered() {
        let (listener, addr) = listener().await;
        let (channel, registry) = setup(addr, ChannelConfig::default());
        let (mut socket, _) = listener.accept().await.unwrap();

        let probe = encode_request(&Request::heartbeat(77), &MsgPackSerialization).unwrap();
        socket.write_all(&probe).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let reply = read_frame(&mut socket, &mut buffer).await;
        assert!(reply.is_response());
        assert!(reply.is_event());
        assert_eq!(reply.request_id(), 77);
        assert!(registry.is_empty());
        drop(channel);
    }

    #[tokio::test]
    async fn test_every_inbound_event_is_answered() {
        let (listener, addr) = listener().await;
        let (channel, registry) = setup(addr, ChannelConfig::default());
        let (mut socket, _) = listener.accept().await.unwrap();

        let oneway_probe = Request {
            id: 81,
            two_way: false,
            data: RequestData::Event(Value::Null),
        };
        let readonly_event = Request {
            id: 82,
            two_way: true,
            data: RequestData::Event(json!("R")),
        };

        let mut buffer = FrameBuffer::new();
        for request in [oneway_probe, readonly_event] {
            let bytes = encode_request(&request, &MsgPackSerialization).unwrap();
            socket.write_all(&bytes).await.unwrap();

            let reply = read_frame(&mut socket, &mut buffer).await;
            assert!(reply.is_response());
            assert!(reply.is_event());
            assert_eq!(reply.request_id(), request.id);
        }
        assert!(registry.is_empty());
        drop(channel);
    }

    #[tokio::test]
    async fn test_response_resolves_pending_call() {
        let (listener, addr) = listener().await;
        let (channel, registry) = setup(addr, ChannelConfig::default());
        let (mut socket, _) = listener.accept().await.unwrap();

        let pending = registry.register(7, Duration::from_secs(5), None).unwrap();
        let reply = encode_response(&Response::ok(7, json!(42)), &MsgPackSerialization).unwrap();
        socket.write_all(&reply).await.unwrap();

        assert_eq!(pending.wait().await.unwrap(), json!(42));
        drop(channel);
    }

    #[tokio::test]
    async fn test_undecodable_response_fails_fast() {
        let (listener, addr) = listener().await;
        let (channel, registry) = setup(addr, ChannelConfig::default());
        let (mut socket, _) = listener.accept().await.unwrap();

        let pending = registry.register(3, Duration::from_secs(30), None).unwrap();
        // Discriminator 9 is not a valid response body.
        let bytes = crate::protocol::build_frame(
            crate::protocol::flags::compose(MsgPackSerialization.content_type_id(), false, false, false),
            20,
            3,
            &[0x09],
        )
        .unwrap();
        socket.write_all(&bytes).await.unwrap();

        match pending.wait().await {
            Err(RpcError::RemoteStatus { status, .. }) => assert_eq!(status, Status::ClientError),
            other => panic!("expected client error, got {:?}", other),
        }
        drop(channel);
    }

    #[tokio::test]
    async fn test_heartbeat_sent_when_idle() {
        let (listener, addr) = listener().await;
        let config = ChannelConfig {
            heartbeat: Some(Duration::from_millis(200)),
            ..ChannelConfig::default()
        };
        let (channel, _registry) = setup(addr, config);
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut buffer = FrameBuffer::new();
        let probe = read_frame(&mut socket, &mut buffer).await;
        assert!(probe.is_request());
        assert!(probe.is_event());
        assert!(probe.header.is_two_way());
        drop(channel);
    }

    #[tokio::test]
    async fn test_idle_channel_sends_one_heartbeat_per_interval() {
        let (listener, addr) = listener().await;
        let config = ChannelConfig {
            heartbeat: Some(Duration::from_secs(3)),
            ..ChannelConfig::default()
        };
        let (channel, registry) = setup(addr, config);
        let (mut socket, _) = listener.accept().await.unwrap();
        channel.pooled_endpoint().unwrap().wait_connected().await.unwrap();

        // Five idle seconds span a single 3s tick.
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::time::resume();

        let mut buffer = FrameBuffer::new();
        let mut buf = [0u8; 1024];
        let mut events = 0;
        let window = tokio::time::sleep(Duration::from_millis(400));
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                read = socket.read(&mut buf) => {
                    let n = read.unwrap();
                    assert!(n > 0, "peer closed");
                    for frame in buffer.push(&buf[..n]).unwrap() {
                        assert!(frame.is_request());
                        assert!(frame.is_event());
                        events += 1;
                    }
                }
            }
        }

        assert_eq!(events, 1);
        assert!(registry.is_empty());
        drop(channel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritten_frame_is_not_write_activity() {
        let (_listener, addr) = listener().await;
        let (channel, _registry) = setup(addr, ChannelConfig::default());
        let endpoint = channel.pooled_endpoint().unwrap().clone();
        endpoint.close();

        tokio::time::advance(Duration::from_secs(4)).await;
        channel.activity().touch_read();

        let bytes = encode_request(&Request::heartbeat(1), &MsgPackSerialization).unwrap();
        let frame = OutboundFrame::from_encoded(bytes).unwrap();
        assert!(channel.send(&endpoint, frame).await.is_err());
        assert!(channel.activity().needs_heartbeat(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_session_routes_reuse_one_endpoint() {
        let (_listener, addr) = listener().await;
        let (channel, _registry) = setup(addr, ChannelConfig::default());
        let token = SessionToken::new();

        let first = channel.lease(&Route::Session(token.clone())).unwrap();
        let second = channel.lease(&Route::Session(token.clone())).unwrap();
        assert_eq!(first.endpoint().id(), second.endpoint().id());
        assert_ne!(first.endpoint().id(), channel.pooled_endpoint().unwrap().id());
        assert_eq!(channel.session_count(), 1);

        assert!(channel.close_session(&token));
        assert!(first.endpoint().is_closed());
        assert_eq!(channel.session_count(), 0);
        assert!(!channel.close_session(&token));
    }

    #[tokio::test]
    async fn test_ephemeral_lease_closes_on_drop() {
        let (_listener, addr) = listener().await;
        let config = ChannelConfig {
            mode: ConnectionMode::Ephemeral,
            ..ChannelConfig::default()
        };
        let (channel, _registry) = setup(addr, config);
        assert!(channel.pooled_endpoint().is_none());

        let lease = channel.lease(&Route::Shared).unwrap();
        let endpoint = lease.endpoint().clone();
        assert!(!endpoint.is_closed());
        drop(lease);
        assert!(endpoint.is_closed());
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_leases() {
        let (_listener, addr) = listener().await;
        let (channel, _registry) = setup(addr, ChannelConfig::default());
        let pooled = channel.pooled_endpoint().unwrap().clone();
        channel.close();
        assert!(pooled.is_closed());
        assert!(matches!(channel.lease(&Route::Shared), Err(RpcError::ConnectionClosed)));
    }
}
