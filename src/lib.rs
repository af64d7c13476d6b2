//! # dubbo-client
//!
//! Async client for the Dubbo binary RPC protocol.
//!
//! Calls travel as length-prefixed frames over persistent TCP connections,
//! one channel per provider address. Responses are matched to callers by
//! request id, so any number of calls can be in flight on one connection.
//!
//! ## Architecture
//!
//! - **Protocol**: 16-byte header, serialized payload objects, frame reassembly
//! - **Transport**: endpoints that connect, reconnect and read in the background
//! - **Channel**: inbound dispatch, heartbeats, pooled/session/ephemeral connections
//! - **Client**: sync, async and one-way invocation with per-call timeouts
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dubbo_client::{Address, Client, MethodTable, ParamType, ServiceDescriptor};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> dubbo_client::Result<()> {
//!     let client = Client::builder()
//!         .address(Address::new("127.0.0.1", 20880))
//!         .heartbeat(true)
//!         .build()?;
//!
//!     let methods = MethodTable::new().with_service(
//!         ServiceDescriptor::new("com.example.Greeter").method("greet", vec![ParamType::String]),
//!     );
//!     let greeter = client.proxy("com.example.Greeter", Arc::new(methods));
//!
//!     let greeting: String = greeter.invoke_as("greet", vec![json!("bob")]).await?;
//!     println!("{}", greeting);
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod pending;
pub mod protocol;
pub mod service;
pub mod transport;

mod client;
mod proxy;
mod writer;

pub use channel::SessionToken;
pub use client::{Client, ClientBuilder, InvokeOptions, Invoked, ResponseFuture, Session};
pub use config::{ClientConfig, ConnectionMode, ReferenceConfig};
pub use discovery::{Discovery, StaticDiscovery};
pub use error::{Result, RpcError};
pub use protocol::{Attachments, Invocation, Status};
pub use proxy::ServiceProxy;
pub use service::{MethodDescriptor, MethodResolver, MethodTable, ParamType, ServiceDescriptor};
pub use transport::Address;
pub use writer::OutboundFrame;
