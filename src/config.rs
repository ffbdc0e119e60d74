// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration structs consumed by the core.
//!
//! These are plain data: nothing here parses a file, an environment
//! variable, or a CLI argument. Reading configuration into these structs
//! is the supervisor's job; the core only ever receives an already-built
//! [`WorkerConfig`] and replaces it wholesale on reload.

use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration handed to a worker at startup and on reload.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hard ceiling on live connections held by the connection pool.
    pub max_connections: usize,
    /// Nominal connections-per-worker used to derive pool idle bounds.
    pub worker_connections: usize,
    /// How long a connection may sit with no activity before the reaper
    /// considers it expired.
    pub connection_timeout: Duration,
    /// How long an idle (keep-alive) connection may sit in the pool
    /// before the reaper closes it.
    pub keepalive_timeout: Duration,
    /// Size hint for buffer pre-allocation; not enforced by the core
    /// itself, passed through to connection buffer construction.
    pub memory_pool_size: usize,
    /// Event batch ceiling passed to [`crate::event_loop::EventLoop::create`].
    pub event_loop_max_events: usize,
    /// Per-IP concurrent connection ceiling enforced by the limiter.
    pub connection_limit_per_ip: usize,
    /// Rolling window, in seconds, used by the limiter's rate check.
    pub connection_limit_window: u64,
    /// Thread count for the blocking-work thread pool.
    pub thread_pool_size: usize,
    /// Bound on the thread pool's task queue.
    pub thread_pool_queue_size: usize,
}

impl WorkerConfig {
    /// Checks the invariants a hot reload must not violate. Called before
    /// a `SIGHUP`-triggered reload is applied; the previous configuration
    /// stays in effect if this rejects the new one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.thread_pool_size == 0 {
            return Err(ConfigError::ZeroThreadPoolSize);
        }
        if self.connection_limit_window == 0 {
            return Err(ConfigError::ZeroRateWindow);
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            worker_connections: 1024,
            connection_timeout: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(75),
            memory_pool_size: 16 * 1024,
            event_loop_max_events: 1024,
            connection_limit_per_ip: 64,
            connection_limit_window: 1,
            thread_pool_size: 4,
            thread_pool_queue_size: 256,
        }
    }
}

/// Configuration for [`crate::pool::ConnectionPool`], derived from a
/// [`WorkerConfig`] rather than configured directly — see spec §6.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections (active + idle).
    pub max_connections: usize,
    /// Minimum idle connections to retain before closing on return.
    pub min_idle: usize,
    /// Maximum idle connections retained for reuse.
    pub max_idle: usize,
    /// How long an idle connection may live before the reaper closes it.
    pub idle_timeout: Duration,
    /// Interval between reaper sweeps.
    pub pool_cleanup_interval: Duration,
    /// Whether connections are returned to an idle set for reuse at all.
    pub enable_connection_reuse: bool,
    /// Size hint passed through to each connection's buffer construction.
    pub memory_pool_size: usize,
}

impl PoolConfig {
    /// Derives pool bounds from a [`WorkerConfig`], per spec §6:
    /// `min_idle = worker_connections / 10`, `max_idle = worker_connections / 2`,
    /// `idle_timeout = 2 * keepalive_timeout`.
    pub fn from_worker(cfg: &WorkerConfig) -> Self {
        Self {
            max_connections: cfg.max_connections,
            min_idle: cfg.worker_connections / 10,
            max_idle: cfg.worker_connections / 2,
            idle_timeout: cfg.keepalive_timeout * 2,
            pool_cleanup_interval: Duration::from_secs(10),
            enable_connection_reuse: true,
            memory_pool_size: cfg.memory_pool_size,
        }
    }
}

/// Configuration for [`crate::limiter::Limiter`].
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Per-IP concurrent connection ceiling.
    pub max_connections_per_ip: usize,
    /// Sustained requests/second ceiling per IP (tumbling window).
    pub max_requests_per_second: u32,
    /// Burst ceiling: requests arriving within one second of each other.
    pub max_requests_burst: u32,
    /// Width, in seconds, of the tumbling rate window.
    pub window: u64,
    /// How long a zero-count record may sit idle before the reaper
    /// deletes it.
    pub cleanup_interval: Duration,
}

impl LimiterConfig {
    /// Derives limiter bounds from a [`WorkerConfig`].
    pub fn from_worker(cfg: &WorkerConfig) -> Self {
        Self {
            max_connections_per_ip: cfg.connection_limit_per_ip,
            max_requests_per_second: 50,
            max_requests_burst: 100,
            window: cfg.connection_limit_window,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 64,
            max_requests_per_second: 50,
            max_requests_burst: 100,
            window: 1,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.max_connections = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroConnections));
    }

    #[test]
    fn zero_thread_pool_size_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.thread_pool_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroThreadPoolSize));
    }

    #[test]
    fn zero_rate_window_is_rejected() {
        let mut cfg = WorkerConfig::default();
        cfg.connection_limit_window = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroRateWindow));
    }
}
