//! Transport module - TCP endpoints and provider addresses.
//!
//! An [`Endpoint`] owns one persistent connection to one provider address.
//! It connects in the background, reconnects after failures, and hands every
//! complete inbound frame to a [`FrameHandler`].

mod endpoint;

pub use endpoint::{BoxFuture, Endpoint, EndpointConfig, EndpointState, FrameHandler};

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RpcError};

/// A provider's `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Extract the address from a registry provider entry such as
    /// `dubbo%3A%2F%2F10.0.0.5%3A20880%2Fcom.example.Greeter%3Fversion%3D1.0.0`.
    ///
    /// ```
    /// use dubbo_client::transport::Address;
    ///
    /// let addr = Address::from_provider_url("dubbo://10.0.0.5:20880/com.example.Greeter?v=1").unwrap();
    /// assert_eq!(addr, Address::new("10.0.0.5", 20880));
    /// ```
    pub fn from_provider_url(url: &str) -> Result<Self> {
        let decoded = percent_decode(url);
        let rest = decoded
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| RpcError::Configuration(format!("provider url without scheme: {}", url)))?;
        let authority = rest
            .split(['/', '?'])
            .next()
            .unwrap_or_default();
        authority.parse()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RpcError::Configuration(format!("address without port: {}", s)))?;
        if host.is_empty() {
            return Err(RpcError::Configuration(format!("address without host: {}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| RpcError::Configuration(format!("invalid port in address: {}", s)))?;
        Ok(Self::new(host, port))
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
