//! Session - several calls pinned to one connection.
//!
//! Providers that keep per-connection state (cursors, transactions) need
//! related calls to arrive on the same socket. A session owns a dedicated
//! connection until it is closed or dropped.
//!
//! ```text
//! DUBBO_PROVIDER=127.0.0.1:20880 cargo run --example session
//! ```

use std::sync::Arc;

use dubbo_client::{Address, Client, MethodTable, ParamType, ServiceDescriptor};
use serde_json::json;

const SERVICE: &str = "com.example.CursorService";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let provider: Address = std::env::var("DUBBO_PROVIDER")
        .unwrap_or_else(|_| "127.0.0.1:20880".to_string())
        .parse()?;
    let client = Client::builder().address(provider).build()?;

    let methods = MethodTable::new().with_service(
        ServiceDescriptor::new(SERVICE)
            .method("open", vec![ParamType::String])
            .method("next", vec![])
            .method("close", vec![]),
    );

    let session = client.session()?;
    println!("session {}", session.token());
    let cursor = client
        .proxy(SERVICE, Arc::new(methods))
        .in_session(&session);

    cursor.invoke("open", vec![json!("orders")]).await?;
    loop {
        let row = cursor.invoke("next", vec![]).await?;
        if row.is_null() {
            break;
        }
        println!("{}", row);
    }
    cursor.invoke("close", vec![]).await?;

    session.close();
    Ok(())
}
