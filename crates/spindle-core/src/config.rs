//! Engine configuration.
//!
//! Plain serde structs with defaults, so embedders can deserialize a partial
//! document and get sensible values for everything they leave out.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Priority;

/// Size of one worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent workers draining the queue.
    pub workers: usize,

    /// Maximum number of tasks waiting in the queue (running tasks excluded).
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            workers,
            queue_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub high: PoolConfig,
    pub normal: PoolConfig,
    pub background: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            high: PoolConfig::new(2, 32),
            normal: PoolConfig::new(3, 64),
            background: PoolConfig::new(1, 128),
        }
    }
}

impl PoolsConfig {
    pub fn get(&self, priority: Priority) -> PoolConfig {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Background => self.background,
        }
    }

    pub fn set(&mut self, priority: Priority, pool: PoolConfig) {
        match priority {
            Priority::High => self.high = pool,
            Priority::Normal => self.normal = pool,
            Priority::Background => self.background = pool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pools: PoolsConfig,

    /// Scheduler evaluation period.
    pub scheduler_tick_ms: u64,

    /// Minimum interval between store saves caused by progress reports.
    pub progress_persist_interval_ms: u64,

    /// Used by `Engine::shutdown_default`.
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pools: PoolsConfig::default(),
            scheduler_tick_ms: 5_000,
            progress_persist_interval_ms: 1_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }

    pub fn progress_persist_interval(&self) -> Duration {
        Duration::from_millis(self.progress_persist_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let c = EngineConfig::default();
        assert_eq!(c.pools.high, PoolConfig::new(2, 32));
        assert_eq!(c.pools.normal.workers, 3);
        assert_eq!(c.pools.background.workers, 1);
        assert_eq!(c.scheduler_tick(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"
        {
          "pools": { "background": { "workers": 4, "queue_capacity": 8 } },
          "scheduler_tick_ms": 250
        }"#;
        let c: EngineConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(c.pools.get(Priority::Background), PoolConfig::new(4, 8));
        assert_eq!(c.pools.get(Priority::High), PoolConfig::new(2, 32));
        assert_eq!(c.scheduler_tick_ms, 250);
        assert_eq!(c.shutdown_timeout_ms, 10_000);
    }
}
