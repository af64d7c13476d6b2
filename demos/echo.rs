//! Echo - synchronous, asynchronous and one-way calls.
//!
//! This example demonstrates:
//! - Building a client with the builder pattern
//! - Calling a method through a [`ServiceProxy`](dubbo_client::ServiceProxy)
//! - Firing an async call and collecting it later
//! - Sending a one-way notification
//!
//! Point it at any provider exposing `com.example.EchoService`:
//!
//! ```text
//! DUBBO_PROVIDER=127.0.0.1:20880 RUST_LOG=debug cargo run --example echo
//! ```

use std::sync::Arc;
use std::time::Duration;

use dubbo_client::{
    Address, Client, InvokeOptions, Invoked, MethodTable, ParamType, ServiceDescriptor,
};
use serde_json::json;

const SERVICE: &str = "com.example.EchoService";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let provider: Address = std::env::var("DUBBO_PROVIDER")
        .unwrap_or_else(|_| "127.0.0.1:20880".to_string())
        .parse()?;

    let client = Client::builder()
        .address(provider)
        .timeout(Duration::from_secs(3))
        .heartbeat(true)
        .build()?;

    let methods = MethodTable::new().with_service(
        ServiceDescriptor::new(SERVICE)
            .method("echo", vec![ParamType::String])
            .method("notify", vec![ParamType::String]),
    );
    let echo = client.proxy(SERVICE, Arc::new(methods));

    // Synchronous
    let reply: String = echo.invoke_as("echo", vec![json!("hello")]).await?;
    println!("echo: {}", reply);

    // Asynchronous
    let invoked = echo
        .invoke_with("echo", vec![json!("later")], InvokeOptions::asynchronous())
        .await?;
    if let Invoked::Pending(future) = invoked {
        println!("request {} in flight", future.request_id());
        println!("async echo: {}", future.wait().await?);
    }

    // One-way
    echo.invoke_with("notify", vec![json!("bye")], InvokeOptions::oneway())
        .await?;

    client.shutdown();
    Ok(())
}
