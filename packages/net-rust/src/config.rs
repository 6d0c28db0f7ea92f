//! Configuration types for pools, listeners and the demo server.

use std::net::{AddrParseError, IpAddr, SocketAddr};

use sockflow_core::FramingConfig;

/// How a [`ContextPool`](crate::pool::ContextPool) grows when an acquire finds
/// it empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Add this many contexts.
    Fixed(usize),
    /// Add this percentage of the initial pool size, rounded to nearest.
    Percent(u32),
}

impl GrowthPolicy {
    /// Number of contexts to add for a pool created with `initial_size`.
    /// Never less than 1.
    #[must_use]
    pub fn increment(self, initial_size: usize) -> usize {
        let raw = match self {
            Self::Fixed(count) => count,
            Self::Percent(percent) => initial_size
                .saturating_mul(percent as usize)
                .saturating_add(50)
                / 100,
        };
        raw.max(1)
    }
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        Self::Percent(10)
    }
}

/// Operation context pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Contexts created up front.
    pub initial_size: usize,
    /// Growth when the idle queue is empty.
    pub growth: GrowthPolicy,
    /// Transfer buffer size of a fresh context. Matches the framer chunk size
    /// so receive windows fit without reallocating.
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 100,
            growth: GrowthPolicy::default(),
            buffer_size: sockflow_core::framing::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Listening socket settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Pending connection queue length passed to `listen(2)`.
    pub backlog: u32,
}

impl ListenerConfig {
    /// Parses `host:port` into a socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address literal.
    pub fn bind_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            backlog: 100,
        }
    }
}

/// Top-level network configuration for a server process.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub listener: ListenerConfig,
    pub pool: PoolConfig,
    pub framing: FramingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.listener.port, 0);
        assert_eq!(config.listener.backlog, 100);
        assert_eq!(config.pool.initial_size, 100);
        assert_eq!(config.pool.growth, GrowthPolicy::Percent(10));
        assert_eq!(config.pool.buffer_size, 512);
        assert_eq!(config.framing.chunk_size, 512);
    }

    #[test]
    fn percent_growth_rounds_to_nearest() {
        assert_eq!(GrowthPolicy::Percent(10).increment(100), 10);
        assert_eq!(GrowthPolicy::Percent(10).increment(15), 2);
        assert_eq!(GrowthPolicy::Percent(10).increment(14), 1);
    }

    #[test]
    fn growth_is_at_least_one() {
        assert_eq!(GrowthPolicy::Percent(10).increment(0), 1);
        assert_eq!(GrowthPolicy::Percent(0).increment(100), 1);
        assert_eq!(GrowthPolicy::Fixed(0).increment(100), 1);
        assert_eq!(GrowthPolicy::Fixed(7).increment(100), 7);
    }

    #[test]
    fn bind_addr_parses_ip_literals() {
        let config = ListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 44485,
            backlog: 16,
        };
        assert_eq!(
            config.bind_addr().unwrap(),
            "127.0.0.1:44485".parse().unwrap()
        );

        let bad = ListenerConfig {
            host: "localhost".to_string(),
            ..ListenerConfig::default()
        };
        assert!(bad.bind_addr().is_err());
    }
}
