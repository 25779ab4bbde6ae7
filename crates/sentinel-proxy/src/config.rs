use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::{DEFAULT_RECV_BUFFER, DEFAULT_SAFE_THRESHOLD};

use crate::telemetry::SessionTelemetryCollector;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:4433";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder-style proxy configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub safe_threshold: usize,
    pub recv_buffer: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// `None` accepts without limit; `Some(n)` holds the accept loop once `n`
    /// sessions are in flight.
    pub max_concurrent_sessions: Option<usize>,
    pub telemetry: Option<Arc<dyn SessionTelemetryCollector>>,
}

impl ProxyConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_safe_threshold(mut self, threshold: usize) -> Self {
        self.safe_threshold = threshold;
        self
    }

    /// Capacity of the single client-hello read. Clamped to at least one byte.
    pub fn with_recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity.max(1);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_sessions(mut self, limit: usize) -> Self {
        self.max_concurrent_sessions = Some(limit.max(1));
        self
    }

    pub fn with_telemetry(mut self, collector: Arc<dyn SessionTelemetryCollector>) -> Self {
        self.telemetry = Some(collector);
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 4433)),
            safe_threshold: DEFAULT_SAFE_THRESHOLD,
            recv_buffer: DEFAULT_RECV_BUFFER,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_concurrent_sessions: None,
            telemetry: None,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen", &self.listen)
            .field("safe_threshold", &self.safe_threshold)
            .field("recv_buffer", &self.recv_buffer)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_concurrent_sessions", &self.max_concurrent_sessions)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen, DEFAULT_LISTEN.parse().unwrap());
        assert_eq!(config.safe_threshold, 1400);
        assert_eq!(config.recv_buffer, 4096);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert!(config.max_concurrent_sessions.is_none());
    }

    #[test]
    fn limits_are_clamped() {
        let config = ProxyConfig::default()
            .with_recv_buffer(0)
            .with_max_concurrent_sessions(0);
        assert_eq!(config.recv_buffer, 1);
        assert_eq!(config.max_concurrent_sessions, Some(1));
    }
}
