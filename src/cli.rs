use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "matrix-stream-proxy")]
#[command(about = "WebSocket and EventSource bridge for a Matrix homeserver")]
pub struct Cli {
    /// TCP port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Base URL of the upstream homeserver
    #[arg(long)]
    pub upstream: Option<String>,

    /// Long-poll timeout forwarded to /sync, in milliseconds
    #[arg(long)]
    pub sync_timeout_ms: Option<u64>,
}

impl Cli {
    /// Flags override the environment-derived configuration.
    pub fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(upstream) = self.upstream {
            config.upstream_url = upstream;
        }
        if let Some(timeout) = self.sync_timeout_ms {
            config.sync_timeout_ms = timeout;
        }
    }
}
