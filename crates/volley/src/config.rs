//! Runtime configuration with environment overrides.
//!
//! - `VOLLEY_POOL_MIN_THREADS`, `VOLLEY_POOL_MAX_THREADS`, `VOLLEY_POOL_MAX_IDLE_MS`
//! - `VOLLEY_MULTI_POLL_MS`
//! - `VOLLEY_TIMEOUT_SECS`

use std::time::Duration;

use crate::version::default_user_agent;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn default_max_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Sizing and idle policy for a [`ThreadPool`](crate::ThreadPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Threads kept alive even without work.
    pub min_threads: usize,
    /// Upper bound the pool may grow to under backlog.
    pub max_threads: usize,
    /// How long a surplus worker waits for work before retiring.
    pub max_idle: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(
            env_parse("VOLLEY_POOL_MIN_THREADS").unwrap_or(1),
            env_parse("VOLLEY_POOL_MAX_THREADS").unwrap_or_else(default_max_threads),
        )
        .with_max_idle(Duration::from_millis(
            env_parse("VOLLEY_POOL_MAX_IDLE_MS").unwrap_or(60_000),
        ))
    }
}

impl PoolConfig {
    /// `max` is raised to at least 1 and at least `min`.
    pub fn new(min: usize, max: usize) -> Self {
        Self {
            min_threads: min,
            max_threads: max.max(min).max(1),
            max_idle: Duration::from_secs(60),
        }
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// Settings for a [`MultiDriver`](crate::MultiDriver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiConfig {
    /// Upper bound on a single readiness wait inside the perform loop.
    pub poll_timeout: Duration,
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(env_parse("VOLLEY_MULTI_POLL_MS").unwrap_or(250)),
        }
    }
}

/// Settings for the default HTTP transport.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: env_parse::<u64>("VOLLEY_TIMEOUT_SECS").map(Duration::from_secs),
            user_agent: default_user_agent(),
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_threads, 1);
        assert!(config.max_threads >= 1);
        assert_eq!(config.max_idle, Duration::from_secs(60));
    }

    #[test]
    fn pool_config_max_never_below_min() {
        let config = PoolConfig::new(4, 2);
        assert_eq!(config.min_threads, 4);
        assert_eq!(config.max_threads, 4);

        let config = PoolConfig::new(0, 0);
        assert_eq!(config.max_threads, 1);
    }

    #[test]
    fn multi_config_defaults() {
        assert_eq!(
            MultiConfig::default().poll_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::default()
            .with_timeout(Duration::from_secs(3))
            .with_user_agent("fetcher/1.0");
        assert_eq!(config.timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.user_agent, "fetcher/1.0");
    }
}
