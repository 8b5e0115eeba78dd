//! Client configuration: all from environment variables.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Real-time endpoint. `http(s)://` is accepted and rewritten to `ws(s)://`.
    pub socket_url: String,
    /// Base URL of the REST API.
    pub api_url: String,
    /// How long to wait for the server's answer to the auth frame.
    pub handshake_timeout: Duration,
    /// Per-request timeout for REST calls.
    pub request_timeout: Duration,
    /// Reconnect backoff: first delay and ceiling.
    pub reconnect: ReconnectPolicy,
    /// Log level filter (used by binaries installing a subscriber).
    pub log_level: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// delay = min(base × 2^attempt, max) + random(0, delay × 0.5)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let grown = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped_ms = grown.min(max_ms);
        let jitter_ms = (rand::random::<f64>() * capped_ms as f64 * 0.5) as u64;
        Duration::from_millis(capped_ms + jitter_ms)
    }
}

impl ClientConfig {
    pub fn new(socket_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            api_url: api_url.into(),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            log_level: "pos_client=info".into(),
        }
    }

    pub fn from_env() -> Self {
        let defaults = ReconnectPolicy::default();
        Self {
            socket_url: env::var("POS_SOCKET_URL").unwrap_or_else(|_| "http://localhost:3000".into()),
            api_url: env::var("POS_API_URL").unwrap_or_else(|_| "http://localhost:3000".into()),
            handshake_timeout: Duration::from_secs(env_parse("POS_HANDSHAKE_TIMEOUT_SECS").unwrap_or(10)),
            request_timeout: Duration::from_secs(env_parse("POS_REQUEST_TIMEOUT_SECS").unwrap_or(10)),
            reconnect: ReconnectPolicy {
                base: env_parse("POS_RECONNECT_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base),
                max: env_parse("POS_RECONNECT_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max),
            },
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "pos_client=info".into()),
        }
    }
}

fn env_parse(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
