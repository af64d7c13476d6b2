//! Service discovery.
//!
//! A [`Discovery`] turns an interface name into the provider addresses that
//! serve it. Registry-backed implementations typically list provider URLs
//! and run each through [`Address::from_provider_url`].

use std::collections::HashMap;

use crate::error::{Result, RpcError};
use crate::transport::{Address, BoxFuture};

/// Resolves an interface name to provider addresses.
pub trait Discovery: Send + Sync {
    fn discover<'a>(&'a self, interface: &'a str) -> BoxFuture<'a, Result<Vec<Address>>>;
}

/// Fixed interface-to-address table.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    providers: HashMap<String, Vec<Address>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address for `interface`.
    pub fn provider(mut self, interface: impl Into<String>, addr: Address) -> Self {
        self.providers.entry(interface.into()).or_default().push(addr);
        self
    }

    /// Register every parseable provider URL for `interface`; others are skipped.
    pub fn provider_urls<'a>(
        mut self,
        interface: impl Into<String>,
        urls: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let entry = self.providers.entry(interface.into()).or_default();
        for url in urls {
            match Address::from_provider_url(url) {
                Ok(addr) => entry.push(addr),
                Err(e) => tracing::warn!(url, error = %e, "skipping provider url"),
            }
        }
        self
    }
}

impl Discovery for StaticDiscovery {
    fn discover<'a>(&'a self, interface: &'a str) -> BoxFuture<'a, Result<Vec<Address>>> {
        Box::pin(async move {
            match self.providers.get(interface) {
                Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
                _ => Err(RpcError::Configuration(format!(
                    "no providers for interface {}",
                    interface
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery() {
        let discovery = StaticDiscovery::new()
            .provider("com.example.Greeter", Address::new("10.0.0.1", 20880))
            .provider_urls(
                "com.example.Greeter",
                [
                    "dubbo%3A%2F%2F10.0.0.2%3A20880%2Fcom.example.Greeter%3Fside%3Dprovider",
                    "not a url",
                ],
            );

        let addrs = discovery.discover("com.example.Greeter").await.unwrap();
        assert_eq!(
            addrs,
            vec![Address::new("10.0.0.1", 20880), Address::new("10.0.0.2", 20880)]
        );
    }

    #[tokio::test]
    async fn test_unknown_interface() {
        let discovery = StaticDiscovery::new();
        let err = discovery.discover("com.example.Missing").await.unwrap_err();
        assert!(err.is_configuration());
    }
}
