//! Command-line arguments for the demo echo server.

use clap::Parser;

/// WebSocket echo server.
#[derive(Debug, Parser)]
#[command(name = "sockframe", version, about)]
pub struct Cli {
    /// Interface to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 9001)]
    pub port: u16,

    /// PEM certificate chain enabling TLS (requires --key).
    #[arg(long, requires = "key")]
    pub cert: Option<std::path::PathBuf>,

    /// PEM private key enabling TLS (requires --cert).
    #[arg(long, requires = "cert")]
    pub key: Option<std::path::PathBuf>,
}
