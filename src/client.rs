//! Client builder and invocation paths.
//!
//! The [`ClientBuilder`] collects provider addresses and configuration and
//! builds a [`Client`]. The client owns one [`Channel`] per address, a
//! shared pending-call registry, and the sweeper task that times calls out.
//!
//! Each call:
//! 1. Picks a channel at random (or the one its session is bound to)
//! 2. Encodes the request under a fresh request id
//! 3. Registers a waiter (two-way calls only)
//! 4. Writes the frame and either waits, returns a handle, or returns at once
//!
//! # Example
//!
//! ```no_run
//! use dubbo_client::{Address, Client, Invocation};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .address(Address::new("127.0.0.1", 20880))
//!         .timeout(std::time::Duration::from_secs(2))
//!         .build()?;
//!
//!     let invocation = Invocation::new("greet", "Ljava/lang/String;", vec![json!("bob")])
//!         .with_attachment("path", "com.example.Greeter");
//!     let greeting = client.call(invocation).await?;
//!     println!("{}", greeting);
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelConfig, EndpointLease, Route, SessionToken};
use crate::codec::{MsgPackSerialization, Serialization};
use crate::config::{ClientConfig, ConnectionMode, TIMEOUT_KEY};
use crate::discovery::Discovery;
use crate::error::{Result, RpcError};
use crate::pending::{spawn_sweeper, PendingCall, PendingCalls};
use crate::protocol::{encode_request, Invocation, Request};
use crate::proxy::ServiceProxy;
use crate::service::MethodResolver;
use crate::transport::Address;
use crate::writer::OutboundFrame;

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    addresses: Vec<Address>,
    config: ClientConfig,
    serialization: Arc<dyn Serialization>,
}

impl ClientBuilder {
    /// Create a new client builder with default configuration.
    pub fn new() -> Self {
        Self {
            addresses: Vec::new(),
            config: ClientConfig::default(),
            serialization: Arc::new(MsgPackSerialization),
        }
    }

    /// Add a provider address.
    pub fn address(mut self, addr: Address) -> Self {
        self.addresses.push(addr);
        self
    }

    /// Add several provider addresses.
    pub fn addresses(mut self, addrs: impl IntoIterator<Item = Address>) -> Self {
        self.addresses.extend(addrs);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default call timeout.
    ///
    /// Default: 5 seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable the idle heartbeat.
    pub fn heartbeat(mut self, enabled: bool) -> Self {
        self.config.heartbeat = enabled;
        self
    }

    /// Idle time after which a heartbeat is sent.
    ///
    /// Default: 60 seconds
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Default service version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.config.owner = owner.into();
        self
    }

    pub fn customer(mut self, customer: impl Into<String>) -> Self {
        self.config.customer = customer.into();
        self
    }

    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.config.connection_mode = mode;
        self
    }

    /// Fail a connection's pending calls as soon as it drops.
    pub fn fail_pending_on_disconnect(mut self, enabled: bool) -> Self {
        self.config.fail_pending_on_disconnect = enabled;
        self
    }

    /// Payload serialization. Default: MessagePack.
    pub fn serialization(mut self, serialization: impl Serialization) -> Self {
        self.serialization = Arc::new(serialization);
        self
    }

    /// Add every provider `discovery` knows for `interface`.
    pub async fn discover(mut self, discovery: &dyn Discovery, interface: &str) -> Result<Self> {
        let addrs = discovery.discover(interface).await?;
        tracing::info!(interface, providers = addrs.len(), "discovered providers");
        self.addresses.extend(addrs);
        Ok(self)
    }

    /// Build the client. Channels start connecting right away.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Client> {
        if self.addresses.is_empty() {
            return Err(RpcError::Configuration(
                "at least one provider address is required".to_string(),
            ));
        }
        self.config.validate()?;
        Ok(Client::start(self.addresses, self.config, self.serialization))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Overrides the invocation's `timeout` attachment and the client default.
    pub timeout: Option<Duration>,
    /// False sends the request one-way: no waiter, no result.
    pub with_return: bool,
    /// Return a [`ResponseFuture`] instead of waiting.
    pub is_async: bool,
    /// Pin the call to a session's connection.
    pub session: Option<SessionToken>,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            with_return: true,
            is_async: false,
            session: None,
        }
    }
}

impl InvokeOptions {
    pub fn oneway() -> Self {
        Self {
            with_return: false,
            ..Self::default()
        }
    }

    pub fn asynchronous() -> Self {
        Self {
            is_async: true,
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn session(mut self, token: SessionToken) -> Self {
        self.session = Some(token);
        self
    }
}

/// What an invocation produced.
#[derive(Debug)]
pub enum Invoked {
    /// Synchronous call result.
    Value(Value),
    /// Asynchronous call handle.
    Pending(ResponseFuture),
    /// One-way call, written and done.
    Sent,
}

impl Invoked {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Invoked::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_pending(self) -> Option<ResponseFuture> {
        match self {
            Invoked::Pending(future) => Some(future),
            _ => None,
        }
    }
}

/// Handle to an asynchronous call.
#[derive(Debug)]
pub struct ResponseFuture {
    pending: PendingCall,
    lease: EndpointLease,
}

impl ResponseFuture {
    #[inline]
    pub fn request_id(&self) -> i64 {
        self.pending.id()
    }

    /// Non-blocking check whether the call has been resolved.
    pub fn is_done(&mut self) -> bool {
        self.pending.is_done()
    }

    /// Wait for the result.
    pub async fn wait(self) -> Result<Value> {
        let Self { pending, lease } = self;
        let result = pending.wait().await;
        drop(lease);
        result
    }

    /// Wait and deserialize the result.
    pub async fn wait_as<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.wait().await?)?)
    }
}

struct ClientInner {
    channels: Vec<Channel>,
    registry: Arc<PendingCalls>,
    config: ClientConfig,
    serialization: Arc<dyn Serialization>,
    sessions: Mutex<HashMap<SessionToken, usize>>,
    sweeper: JoinHandle<()>,
    closed: AtomicBool,
}

impl ClientInner {
    fn select_channel(&self) -> usize {
        random_index(self.channels.len())
    }

    fn timeout_for(&self, invocation: &Invocation) -> Duration {
        invocation
            .attachment(TIMEOUT_KEY)
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.timeout())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sweeper.abort();
        self.sessions.lock().clear();
        for channel in &self.channels {
            channel.close();
        }
        let failed = self.registry.fail_all("client shut down");
        tracing::info!(channels = self.channels.len(), failed, "client shut down");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An RPC client. Cheap to clone; the last clone dropped shuts it down.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    fn start(addresses: Vec<Address>, config: ClientConfig, serialization: Arc<dyn Serialization>) -> Self {
        let registry = Arc::new(PendingCalls::new());
        let channel_config = ChannelConfig {
            endpoint: config.endpoint_config(),
            mode: config.connection_mode,
            heartbeat: config.heartbeat.then(|| config.heartbeat_interval()),
            fail_pending_on_disconnect: config.fail_pending_on_disconnect,
        };

        let channels = addresses
            .into_iter()
            .map(|addr| {
                Channel::new(
                    addr,
                    channel_config.clone(),
                    registry.clone(),
                    serialization.clone(),
                )
            })
            .collect::<Vec<_>>();

        let sweeper = spawn_sweeper(Arc::downgrade(&registry), config.sweep_interval());
        tracing::info!(channels = channels.len(), mode = ?config.connection_mode, "client started");

        Self {
            inner: Arc::new(ClientInner {
                channels,
                registry,
                config,
                serialization,
                sessions: Mutex::new(HashMap::new()),
                sweeper,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Provider addresses, one per channel.
    pub fn addresses(&self) -> Vec<Address> {
        self.inner.channels.iter().map(|c| c.addr().clone()).collect()
    }

    /// Number of two-way calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether a call with this request id is still awaiting a response.
    pub fn is_pending(&self, request_id: i64) -> bool {
        self.inner.registry.contains(request_id)
    }

    /// Send an invocation.
    ///
    /// Local validation and encoding happen before anything is written, so
    /// configuration errors never leave a registered call behind.
    pub async fn invoke(&self, invocation: Invocation, options: InvokeOptions) -> Result<Invoked> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        if invocation.method_name.trim().is_empty() {
            return Err(RpcError::Configuration("method name must not be empty".to_string()));
        }

        let (index, route) = match &options.session {
            Some(token) => {
                let index = inner
                    .sessions
                    .lock()
                    .get(token)
                    .copied()
                    .ok_or(RpcError::ConnectionClosed)?;
                (index, Route::Session(token.clone()))
            }
            None => {
                let route = match inner.config.connection_mode {
                    ConnectionMode::Pooled => Route::Shared,
                    ConnectionMode::Ephemeral => Route::Ephemeral,
                };
                (inner.select_channel(), route)
            }
        };
        let channel = &inner.channels[index];

        let timeout = options.timeout.unwrap_or_else(|| inner.timeout_for(&invocation));
        let id = inner.registry.next_id();
        let method = invocation.method_name.clone();
        let request = Request::invocation(id, options.with_return, invocation);
        let bytes = encode_request(&request, inner.serialization.as_ref())?;
        let frame = OutboundFrame::from_encoded(bytes)
            .ok_or_else(|| RpcError::Protocol("encoded request shorter than a header".to_string()))?;

        let lease = channel.lease(&route)?;
        tracing::debug!(request_id = id, method = %method, addr = %channel.addr(), "invoking");

        if !options.with_return {
            let deadline = tokio::time::Instant::now() + timeout;
            if tokio::time::timeout_at(deadline, channel.send(lease.endpoint(), frame))
                .await
                .is_err()
            {
                tracing::warn!(request_id = id, "one-way request not written before its deadline");
            }
            return Ok(Invoked::Sent);
        }

        let pending = inner
            .registry
            .register(id, timeout, Some(lease.endpoint().id()))?;
        match tokio::time::timeout_at(pending.deadline(), channel.send(lease.endpoint(), frame)).await {
            Ok(sent) => sent?,
            // The waiter resolves as a timeout on its own.
            Err(_) => tracing::warn!(request_id = id, "request not written before its deadline"),
        }

        let future = ResponseFuture { pending, lease };
        if options.is_async {
            Ok(Invoked::Pending(future))
        } else {
            Ok(Invoked::Value(future.wait().await?))
        }
    }

    /// Synchronous call: wait for the result.
    pub async fn call(&self, invocation: Invocation) -> Result<Value> {
        match self.invoke(invocation, InvokeOptions::default()).await? {
            Invoked::Value(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    /// Asynchronous call: return a handle without waiting.
    pub async fn call_async(&self, invocation: Invocation) -> Result<ResponseFuture> {
        match self.invoke(invocation, InvokeOptions::asynchronous()).await? {
            Invoked::Pending(future) => Ok(future),
            _ => Err(RpcError::Protocol("asynchronous call produced no handle".to_string())),
        }
    }

    /// One-way call: write the request and return.
    pub async fn send_oneway(&self, invocation: Invocation) -> Result<()> {
        self.invoke(invocation, InvokeOptions::oneway()).await.map(|_| ())
    }

    /// Open a session pinned to one connection of one randomly chosen channel.
    pub fn session(&self) -> Result<Session> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let token = SessionToken::new();
        let index = self.inner.select_channel();
        self.inner.sessions.lock().insert(token.clone(), index);
        tracing::debug!(session = %token, addr = %self.inner.channels[index].addr(), "session opened");
        Ok(Session {
            client: self.clone(),
            token,
            closed: false,
        })
    }

    /// Close the connection bound to `token`. Returns false for unknown tokens.
    pub fn close_session(&self, token: &SessionToken) -> bool {
        let index = self.inner.sessions.lock().remove(token);
        match index {
            Some(index) => {
                self.inner.channels[index].close_session(token);
                tracing::debug!(session = %token, "session closed");
                true
            }
            None => false,
        }
    }

    /// A proxy for calling methods of `service` by name.
    pub fn proxy(&self, service: impl Into<String>, resolver: Arc<dyn MethodResolver>) -> ServiceProxy {
        ServiceProxy::new(self.clone(), service.into(), resolver)
    }

    /// Close every connection, stop background tasks and fail pending calls.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A scoped session: calls made through it share one connection.
///
/// Closing (or dropping) the session closes that connection.
pub struct Session {
    client: Client,
    token: SessionToken,
    closed: bool,
}

impl Session {
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub async fn invoke(&self, invocation: Invocation, options: InvokeOptions) -> Result<Invoked> {
        self.client
            .invoke(invocation, options.session(self.token.clone()))
            .await
    }

    pub async fn call(&self, invocation: Invocation) -> Result<Value> {
        match self.invoke(invocation, InvokeOptions::default()).await? {
            Invoked::Value(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    /// End the session.
    pub fn close(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.client.close_session(&self.token)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

/// Random index in `0..len`.
fn random_index(len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    (rand_u64() % len as u64) as usize
}

/// Simple random u64 using system time, process ID and a call counter.
fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);

    let pid = std::process::id() as u64;
    let mut x = nanos.wrapping_mul(0x517cc1b727220a95) ^ pid ^ seq.wrapping_mul(0x9e3779b97f4a7c15);
    // xorshift finalizer so low bits depend on every input bit
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_random_index_in_range() {
        for len in 1..8 {
            for _ in 0..100 {
                assert!(random_index(len) < len);
            }
        }
        assert_eq!(random_index(0), 0);
    }

    #[test]
    fn test_random_index_spreads() {
        let mut seen = [false; 4];
        for _ in 0..400 {
            seen[random_index(4)] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_builder_requires_address() {
        let err = ClientBuilder::new().build().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder()
            .address(Address::new("127.0.0.1", 1))
            .timeout(Duration::from_millis(1500))
            .heartbeat(true)
            .heartbeat_interval(Duration::from_secs(3))
            .version("2.0.0")
            .owner("billing")
            .customer("checkout")
            .connection_mode(ConnectionMode::Ephemeral)
            .fail_pending_on_disconnect(true);

        assert_eq!(builder.addresses.len(), 1);
        assert_eq!(builder.config.timeout_ms, 1500);
        assert!(builder.config.heartbeat);
        assert_eq!(builder.config.heartbeat_interval_ms, 3000);
        assert_eq!(builder.config.version, "2.0.0");
        assert_eq!(builder.config.owner, "billing");
        assert_eq!(builder.config.customer, "checkout");
        assert_eq!(builder.config.connection_mode, ConnectionMode::Ephemeral);
        assert!(builder.config.fail_pending_on_disconnect);
    }

    #[test]
    fn test_builder_rejects_zero_heartbeat_interval() {
        let err = Client::builder()
            .address(Address::new("127.0.0.1", 1))
            .heartbeat(true)
            .heartbeat_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_builder_rejects_zero_connect_timeout() {
        let config = ClientConfig {
            connect_timeout_ms: 0,
            ..ClientConfig::default()
        };
        let err = Client::builder()
            .address(Address::new("127.0.0.1", 1))
            .config(config)
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_invoke_options() {
        let options = InvokeOptions::default();
        assert!(options.with_return);
        assert!(!options.is_async);

        assert!(!InvokeOptions::oneway().with_return);
        assert!(InvokeOptions::asynchronous().is_async);
        let options = InvokeOptions::default().timeout(Duration::from_secs(1));
        assert_eq!(options.timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_empty_method_name_rejected() {
        let client = Client::builder()
            .address(Address::new("127.0.0.1", 9))
            .build()
            .unwrap();
        let invocation = Invocation::new("", "", vec![]).with_attachment("path", "svc");
        let err = client.call(invocation).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_path_rejected_before_io() {
        let client = Client::builder()
            .address(Address::new("127.0.0.1", 9))
            .build()
            .unwrap();
        let invocation = Invocation::new("greet", "Ljava/lang/String;", vec![json!("bob")]);
        let err = client.call(invocation).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_from_attachment() {
        let client = Client::builder()
            .address(Address::new("127.0.0.1", 9))
            .build()
            .unwrap();
        let invocation = Invocation::new("m", "", vec![]).with_attachment("timeout", "250");
        assert_eq!(client.inner.timeout_for(&invocation), Duration::from_millis(250));

        let invocation = Invocation::new("m", "", vec![]).with_attachment("timeout", "soon");
        assert_eq!(client.inner.timeout_for(&invocation), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let client = Client::builder()
            .address(Address::new("127.0.0.1", 9))
            .build()
            .unwrap();
        client.shutdown();
        assert!(client.is_shutdown());
        assert!(matches!(client.session(), Err(RpcError::ConnectionClosed)));

        let invocation = Invocation::new("m", "", vec![]).with_attachment("path", "svc");
        assert!(matches!(client.call(invocation).await, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let client = Client::builder()
            .address(Address::new("127.0.0.1", 9))
            .build()
            .unwrap();
        let session = client.session().unwrap();
        let token = session.token().clone();
        assert!(client.inner.sessions.lock().contains_key(&token));

        assert!(session.close());
        assert!(!client.inner.sessions.lock().contains_key(&token));
        assert!(!client.close_session(&token));

        let invocation = Invocation::new("m", "", vec![]).with_attachment("path", "svc");
        let closed = client
            .invoke(invocation, InvokeOptions::default().session(token))
            .await;
        assert!(matches!(closed, Err(RpcError::ConnectionClosed)));
    }
}
