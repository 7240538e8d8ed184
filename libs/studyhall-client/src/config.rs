use std::time::Duration;

use crate::backoff::ReconnectPolicy;

/// Connection settings for a [`GatewayClient`](crate::GatewayClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway endpoint, e.g. `ws://localhost:5001/gateway`.
    pub gateway_url: String,
    /// Bound on each individual connection attempt.
    pub connect_timeout: Duration,
    /// Automatic retry policy for failed attempts and dropped connections.
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}
