//! Minimal binary demonstrating `sockframe` usage: a WebSocket echo server.
//!
//! Text and binary messages are echoed back to the sender. With `--cert`
//! and `--key` the listener speaks TLS.

mod cli;

use clap::Parser;
use sockframe::{Event, TlsIdentity, WsServer, WsServerConfig};

#[tokio::main]
async fn main() -> Result<(), sockframe::ServerError> {
    // Structured logging for the demo; applications embedding the library
    // should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let mut config = WsServerConfig::new(cli.host, cli.port);
    if let (Some(cert_path), Some(key_path)) = (cli.cert, cli.key) {
        config = config.with_tls(TlsIdentity {
            cert_path,
            key_path,
        });
    }

    let server = WsServer::bind(config).await?;
    println!("listening on {}", server.local_addr());

    server.on(Event::Text, |conn, payload| async move {
        if let Err(err) = conn.send_text(payload).await {
            log::warn!("echo failed: error={err}");
        }
    });
    server.on(Event::Binary, |conn, payload| async move {
        if let Err(err) = conn.send_binary(payload).await {
            log::warn!("echo failed: error={err}");
        }
    });

    server.run().await;
    Ok(())
}
