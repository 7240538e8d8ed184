use std::time::Duration;

/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Origins allowed to open cross-origin gateway connections.
    pub allowed_origins: Vec<String>,
    /// How often the server pings each gateway connection.
    pub heartbeat_interval: Duration,
    /// How long a connection may go without a Pong before it is closed.
    pub heartbeat_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable has a default, so a bare environment yields a working
    /// local configuration.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5001),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["http://localhost:5173".to_string()]),
            heartbeat_interval: Duration::from_secs(secs_var("HEARTBEAT_INTERVAL_SECS", 25)),
            heartbeat_timeout: Duration::from_secs(secs_var("HEARTBEAT_TIMEOUT_SECS", 60)),
        }
    }
}

fn secs_var(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
