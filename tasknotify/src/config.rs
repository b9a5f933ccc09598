//! Runtime configuration.
//!
//! Every knob has a compiled-in default and an environment-variable
//! override, so deployments tune the library without recompiling:
//!
//! | variable                       | default     | meaning                          |
//! |--------------------------------|-------------|----------------------------------|
//! | `TASKNOTIFY_POLLING_PERIOD_US` | 100         | polling callback period (µs)     |
//! | `TASKNOTIFY_QUEUE_POLLERS`     | 1           | queue-draining duty instances    |
//! | `TASKNOTIFY_POOL_CAPACITY`     | 64000       | waiting-range pool slots         |
//! | `TASKNOTIFY_HANDOFF_CAPACITY`  | 65472       | per-segment hand-off queue slots |
//! | `TASKNOTIFY_MAX_QUEUE_GROUPS`  | 64          | queue-group table size           |

use std::time::Duration;

/// Default polling period for both duties.
pub const DEFAULT_POLLING_PERIOD: Duration = Duration::from_micros(100);

/// Default number of queue-completion duty instances.
pub const DEFAULT_QUEUE_POLLERS: usize = 1;

/// Default waiting-range pool capacity.
pub const DEFAULT_POOL_CAPACITY: usize = 64_000;

/// Default per-segment hand-off queue capacity (64 Ki minus slack so the
/// ring never admits more handles than the pool can have outstanding).
pub const DEFAULT_HANDOFF_CAPACITY: usize = 64 * 1024 - 64;

/// Default queue-group table size.
pub const DEFAULT_MAX_QUEUE_GROUPS: usize = 64;

/// Number of completed requests drained from a hardware queue per batch.
pub const QUEUE_DRAIN_BATCH: usize = 64;

/// Number of hand-off entries moved to the pending set per drain round.
pub const HANDOFF_DRAIN_BATCH: usize = 64;

/// Configuration for an environment. Construct with [`Config::default`] or
/// [`Config::from_env`], then adjust with the builder-style setters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Period between polling callback invocations.
    pub polling_period: Duration,
    /// Number of queue-completion duty instances; hardware queues are split
    /// into that many contiguous shards.
    pub queue_pollers: usize,
    /// Capacity of the waiting-range pool.
    pub pool_capacity: usize,
    /// Capacity of each segment's hand-off queue.
    pub handoff_capacity: usize,
    /// Capacity of the queue-group table.
    pub max_queue_groups: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            polling_period: DEFAULT_POLLING_PERIOD,
            queue_pollers: DEFAULT_QUEUE_POLLERS,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
            max_queue_groups: DEFAULT_MAX_QUEUE_GROUPS,
        }
    }
}

impl Config {
    /// Build a configuration from the defaults plus any `TASKNOTIFY_*`
    /// environment overrides. Unparsable values fall back to the default
    /// for that key.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(us) = read_env("TASKNOTIFY_POLLING_PERIOD_US") {
            config.polling_period = Duration::from_micros(us);
        }
        if let Some(n) = read_env("TASKNOTIFY_QUEUE_POLLERS") {
            config.queue_pollers = (n as usize).max(1);
        }
        if let Some(n) = read_env("TASKNOTIFY_POOL_CAPACITY") {
            config.pool_capacity = (n as usize).max(1);
        }
        if let Some(n) = read_env("TASKNOTIFY_HANDOFF_CAPACITY") {
            config.handoff_capacity = (n as usize).max(1);
        }
        if let Some(n) = read_env("TASKNOTIFY_MAX_QUEUE_GROUPS") {
            config.max_queue_groups = (n as usize).max(1);
        }
        config
    }

    /// Set the polling period.
    pub fn polling_period(mut self, period: Duration) -> Self {
        self.polling_period = period;
        self
    }

    /// Set the number of queue-completion duty instances.
    pub fn queue_pollers(mut self, count: usize) -> Self {
        self.queue_pollers = count.max(1);
        self
    }

    /// Set the waiting-range pool capacity.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity.max(1);
        self
    }

    /// Set the per-segment hand-off queue capacity.
    pub fn handoff_capacity(mut self, capacity: usize) -> Self {
        self.handoff_capacity = capacity.max(1);
        self
    }

    /// Set the queue-group table capacity.
    pub fn max_queue_groups(mut self, capacity: usize) -> Self {
        self.max_queue_groups = capacity.max(1);
        self
    }
}

fn read_env(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.polling_period, Duration::from_micros(100));
        assert_eq!(config.queue_pollers, 1);
        assert_eq!(config.pool_capacity, 64_000);
        assert_eq!(config.handoff_capacity, 64 * 1024 - 64);
    }

    #[test]
    fn test_builder_setters_clamp() {
        let config = Config::default().queue_pollers(0).pool_capacity(0);
        assert_eq!(config.queue_pollers, 1);
        assert_eq!(config.pool_capacity, 1);
    }

    #[test]
    fn test_env_override() {
        // Process-global env; pick a key unused by other tests.
        unsafe { std::env::set_var("TASKNOTIFY_POLLING_PERIOD_US", "250") };
        let config = Config::from_env();
        assert_eq!(config.polling_period, Duration::from_micros(250));
        unsafe { std::env::remove_var("TASKNOTIFY_POLLING_PERIOD_US") };
    }

    #[test]
    fn test_env_garbage_falls_back() {
        unsafe { std::env::set_var("TASKNOTIFY_QUEUE_POLLERS", "not-a-number") };
        let config = Config::from_env();
        assert_eq!(config.queue_pollers, DEFAULT_QUEUE_POLLERS);
        unsafe { std::env::remove_var("TASKNOTIFY_QUEUE_POLLERS") };
    }
}
