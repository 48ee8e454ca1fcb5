use clap::Parser;

/// Televisit signaling relay.
#[derive(Debug, Parser)]
#[command(name = "televisit-relay", about = "Real-time session signaling relay")]
pub struct Cli {
    /// Override the listen port (defaults to TELEVISIT_RELAY_PORT or 8080).
    #[arg(long)]
    pub port: Option<u16>,
}
