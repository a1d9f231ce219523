use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub upstream_url: String,
    pub sync_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("MATRIX_PROXY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8009),
            upstream_url: env::var("MATRIX_UPSTREAM_URL")
                .unwrap_or_else(|_| "http://localhost:8008/".to_string()),
            sync_timeout_ms: env::var("SYNC_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30_000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8009,
            upstream_url: "http://localhost:8008/".to_string(),
            sync_timeout_ms: 30_000,
        }
    }
}
