//! Reactor configuration.

use crate::error::Error;
use std::time::Duration;

/// Tunable knobs for an [`IoReactor`](crate::IoReactor).
///
/// Socket options (`tcp_nodelay` and below) are applied by a session's
/// worker when the channel is registered; failures to apply an option are
/// logged and do not fail the session.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of worker threads. Defaults to the available parallelism.
    pub io_thread_count: usize,
    /// Upper bound on one select call; the polling period of every loop.
    pub select_interval: Duration,
    /// How long an orderly shutdown waits for each worker before forcing it.
    pub shutdown_grace_period: Duration,
    /// Soft per-session idle timeout. Zero means sessions never time out.
    pub so_timeout: Duration,
    pub tcp_nodelay: bool,
    pub so_keepalive: bool,
    /// `None` leaves SO_LINGER untouched.
    pub so_linger: Option<Duration>,
    /// Send buffer size; zero leaves the OS default.
    pub snd_buf_size: usize,
    /// Receive buffer size; zero leaves the OS default.
    pub rcv_buf_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            io_thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            select_interval: Duration::from_secs(1),
            shutdown_grace_period: Duration::from_millis(500),
            so_timeout: Duration::ZERO,
            tcp_nodelay: false,
            so_keepalive: false,
            so_linger: None,
            snd_buf_size: 0,
            rcv_buf_size: 0,
        }
    }
}

impl ReactorConfig {
    pub fn new() -> ReactorConfig {
        ReactorConfig::default()
    }

    pub fn with_io_thread_count(mut self, count: usize) -> ReactorConfig {
        self.io_thread_count = count;
        self
    }

    pub fn with_select_interval(mut self, interval: Duration) -> ReactorConfig {
        self.select_interval = interval;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> ReactorConfig {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_so_timeout(mut self, timeout: Duration) -> ReactorConfig {
        self.so_timeout = timeout;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> ReactorConfig {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn with_so_keepalive(mut self, keepalive: bool) -> ReactorConfig {
        self.so_keepalive = keepalive;
        self
    }

    pub fn with_so_linger(mut self, linger: Option<Duration>) -> ReactorConfig {
        self.so_linger = linger;
        self
    }

    pub fn with_snd_buf_size(mut self, size: usize) -> ReactorConfig {
        self.snd_buf_size = size;
        self
    }

    pub fn with_rcv_buf_size(mut self, size: usize) -> ReactorConfig {
        self.rcv_buf_size = size;
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.io_thread_count == 0 {
            return Err(Error::Config("io_thread_count must be at least 1".into()));
        }
        if self.select_interval.is_zero() {
            return Err(Error::Config("select_interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ReactorConfig::default();
        assert!(config.io_thread_count >= 1);
        assert!(config.validate().is_ok());
        assert_eq!(config.so_timeout, Duration::ZERO);
        assert!(config.so_linger.is_none());
    }

    #[test]
    fn rejects_zero_workers_and_zero_interval() {
        assert!(ReactorConfig::new()
            .with_io_thread_count(0)
            .validate()
            .is_err());
        assert!(ReactorConfig::new()
            .with_select_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn setters_chain() {
        let config = ReactorConfig::new()
            .with_io_thread_count(3)
            .with_so_timeout(Duration::from_millis(250))
            .with_tcp_nodelay(true);
        assert_eq!(config.io_thread_count, 3);
        assert_eq!(config.so_timeout, Duration::from_millis(250));
        assert!(config.tcp_nodelay);
    }
}
