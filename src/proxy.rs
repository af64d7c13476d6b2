//! Named-method proxy for one remote service.
//!
//! A [`ServiceProxy`] turns `proxy.invoke("greet", args)` into a full
//! [`Invocation`]: it picks the overload through a [`MethodResolver`],
//! fills in the parameter descriptor, and attaches the service's
//! attachments.
//!
//! Attachments are layered, later entries winning:
//! 1. `owner` and `customer` from the client config
//! 2. the client-wide attachments
//! 3. `path` and `interface` (the service name)
//! 4. `version` and `timeout`, from the service reference or the client defaults
//! 5. the service reference's own attachments
//! 6. anything added with [`ServiceProxy::with_attachment`]
//! 7. per-method attachments, for calls to that method

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::channel::SessionToken;
use crate::client::{Client, InvokeOptions, Invoked, Session};
use crate::config::{
    CUSTOMER_KEY, INTERFACE_KEY, OWNER_KEY, PATH_KEY, TIMEOUT_KEY, VERSION_KEY,
};
use crate::error::Result;
use crate::protocol::{Attachments, Invocation};
use crate::service::MethodResolver;

/// Calls methods of one service by name.
#[derive(Clone)]
pub struct ServiceProxy {
    client: Client,
    service: String,
    resolver: Arc<dyn MethodResolver>,
    attachments: Attachments,
    method_attachments: HashMap<String, Attachments>,
    session: Option<SessionToken>,
}

impl ServiceProxy {
    pub(crate) fn new(client: Client, service: String, resolver: Arc<dyn MethodResolver>) -> Self {
        let config = client.config();
        let reference = config.reference(&service);

        let mut attachments = Attachments::new();
        attachments.insert(OWNER_KEY.to_string(), config.owner.clone());
        attachments.insert(CUSTOMER_KEY.to_string(), config.customer.clone());
        attachments.extend(config.attachments.clone());
        attachments.insert(PATH_KEY.to_string(), service.clone());
        attachments.insert(INTERFACE_KEY.to_string(), service.clone());

        let version = reference
            .and_then(|r| r.version.clone())
            .unwrap_or_else(|| config.version.clone());
        let timeout_ms = reference
            .and_then(|r| r.timeout_ms)
            .unwrap_or(config.timeout_ms);
        attachments.insert(VERSION_KEY.to_string(), version);
        attachments.insert(TIMEOUT_KEY.to_string(), timeout_ms.to_string());

        let mut method_attachments = HashMap::new();
        if let Some(reference) = reference {
            attachments.extend(reference.attachments.clone());
            method_attachments = reference.methods.clone();
        }

        Self {
            client,
            service,
            resolver,
            attachments,
            method_attachments,
            session: None,
        }
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Attachments sent with every call through this proxy.
    #[inline]
    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// Attachment sent only with calls to `method`.
    pub fn with_method_attachment(
        mut self,
        method: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.method_attachments
            .entry(method.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let ms = timeout.as_millis().to_string();
        self.with_attachment(TIMEOUT_KEY, ms)
    }

    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.with_attachment(VERSION_KEY, version)
    }

    /// Route every call through `session`'s connection.
    pub fn in_session(mut self, session: &Session) -> Self {
        self.session = Some(session.token().clone());
        self
    }

    /// Build the invocation a call to `method` with `args` would send.
    pub fn invocation(&self, method: &str, args: Vec<Value>) -> Result<Invocation> {
        let descriptor = self.resolver.resolve(&self.service, method, &args)?;

        let mut invocation = Invocation::new(method, descriptor.descriptor(), args);
        invocation.attachments = self.attachments.clone();
        if let Some(extra) = self.method_attachments.get(method) {
            invocation.attachments.extend(extra.clone());
        }
        Ok(invocation)
    }

    /// Synchronous call.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match self.invoke_with(method, args, InvokeOptions::default()).await? {
            Invoked::Value(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    /// Synchronous call with the result deserialized into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        Ok(serde_json::from_value(self.invoke(method, args).await?)?)
    }

    pub async fn invoke_with(
        &self,
        method: &str,
        args: Vec<Value>,
        mut options: InvokeOptions,
    ) -> Result<Invoked> {
        let invocation = self.invocation(method, args)?;
        if options.session.is_none() {
            options.session = self.session.clone();
        }
        self.client.invoke(invocation, options).await
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.service)
            .field("attachments", &self.attachments)
            .field("session", &self.session)
            .finish()
    }
}
