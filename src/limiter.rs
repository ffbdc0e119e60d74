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

//! Per-client-IP connection-count and request-rate enforcement.
//!
//! Two chained hash tables, each sharded into ~1024 buckets with their own
//! mutex so lookups for unrelated IPs never contend. Allocation failure on
//! insert degrades to `allow` rather than denying service — availability
//! over strictness, per the worker's error-handling design.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::warn;

use crate::config::LimiterConfig;
use crate::error::LimiterError;

const BUCKET_COUNT: usize = 1024;

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request or connection may proceed.
    Allow,
    /// Request or connection must be rejected (429/503 at the HTTP layer).
    Deny,
}

impl Decision {
    /// `true` for [`Decision::Allow`].
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Tracking entry for a single IP's concurrent-connection count.
#[derive(Debug, Clone, Copy)]
pub struct IpConnectionRecord {
    /// Current number of active connections from this IP.
    pub count: usize,
    /// Last time this record was touched (connect or release).
    pub last_access: Instant,
}

/// Rolling-window tracker for a single IP's request rate.
#[derive(Debug, Clone, Copy)]
pub struct IpRateRecord {
    /// Requests observed in the current window.
    pub request_count: u32,
    /// Requests observed within one second of the previous request.
    pub burst_count: u32,
    /// Start of the current tumbling window.
    pub window_start: Instant,
    /// Timestamp of the most recent request.
    pub last_request: Instant,
}

/// Snapshot returned by [`Limiter::connection_stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    /// Active connections currently attributed to the IP.
    pub count: usize,
}

#[derive(Default)]
struct Counters {
    denied_connections: AtomicU64,
    denied_rate: AtomicU64,
    degraded_allocations: AtomicU64,
}

type ConnBucket = Mutex<HashMap<String, IpConnectionRecord>>;
type RateBucket = Mutex<HashMap<String, IpRateRecord>>;

/// The per-IP policy engine. See module docs.
pub struct Limiter {
    conn_buckets: Vec<ConnBucket>,
    rate_buckets: Vec<RateBucket>,
    config: Mutex<LimiterConfig>,
    counters: Counters,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter").finish_non_exhaustive()
    }
}

fn bucket_index(ip: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    (hasher.finish() as usize) % BUCKET_COUNT
}

impl Limiter {
    /// Builds a limiter with `config`'s starting limits.
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            conn_buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            rate_buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            config: Mutex::new(config),
            counters: Counters::default(),
        }
    }

    fn lock_config(&self) -> Result<std::sync::MutexGuard<'_, LimiterConfig>, LimiterError> {
        self.config.lock().map_err(|_| LimiterError::LockFailure)
    }

    fn config_snapshot(&self) -> Result<LimiterConfig, LimiterError> {
        Ok(self.lock_config()?.clone())
    }

    /// Hot-reconfigures every limit wholesale; in-flight checks continue
    /// against whichever snapshot they already copied.
    pub fn configure(&self, config: LimiterConfig) -> Result<(), LimiterError> {
        *self.lock_config()? = config;
        Ok(())
    }

    /// Updates just the connection ceiling and reaper interval, leaving
    /// rate-limit parameters untouched.
    pub fn update_from_config(&self, max_connections_per_ip: usize, cleanup_interval: Duration) -> Result<(), LimiterError> {
        let mut cfg = self.lock_config()?;
        cfg.max_connections_per_ip = max_connections_per_ip;
        cfg.cleanup_interval = cleanup_interval;
        Ok(())
    }

    /// Admits or denies a new connection from `ip`, incrementing its
    /// tracked count iff doing so keeps it at or below the configured
    /// ceiling.
    pub fn check_connection_limit(&self, ip: &str) -> Result<Decision, LimiterError> {
        let max = self.config_snapshot()?.max_connections_per_ip;
        let now = Instant::now();
        let bucket = &self.conn_buckets[bucket_index(ip)];
        let mut map = bucket.lock().map_err(|_| LimiterError::LockFailure)?;

        if let Some(rec) = map.get_mut(ip) {
            return Ok(if rec.count + 1 > max {
                self.counters.denied_connections.fetch_add(1, Ordering::Relaxed);
                Decision::Deny
            } else {
                rec.count += 1;
                rec.last_access = now;
                Decision::Allow
            });
        }

        if max == 0 {
            self.counters.denied_connections.fetch_add(1, Ordering::Relaxed);
            return Ok(Decision::Deny);
        }
        if map.try_reserve(1).is_err() {
            self.counters.degraded_allocations.fetch_add(1, Ordering::Relaxed);
            warn!("limiter: failed to track new IP {ip}, degrading to allow");
            return Ok(Decision::Allow);
        }
        map.insert(ip.to_string(), IpConnectionRecord { count: 1, last_access: now });
        Ok(Decision::Allow)
    }

    /// Decrements `ip`'s active-connection count. The record itself is
    /// only deleted by the reaper, and only once the count has been zero
    /// for at least `cleanup_interval`.
    pub fn release_connection(&self, ip: &str) -> Result<(), LimiterError> {
        let now = Instant::now();
        let bucket = &self.conn_buckets[bucket_index(ip)];
        let mut map = bucket.lock().map_err(|_| LimiterError::LockFailure)?;
        if let Some(rec) = map.get_mut(ip) {
            rec.count = rec.count.saturating_sub(1);
            rec.last_access = now;
        }
        Ok(())
    }

    /// Applies the tumbling-window rate check for `ip`: if the window has
    /// elapsed, counters reset before this request is counted; otherwise
    /// it is counted within the current window.
    pub fn check_rate_limit(&self, ip: &str) -> Result<Decision, LimiterError> {
        let cfg = self.config_snapshot()?;
        let now = Instant::now();
        let window = Duration::from_secs(cfg.window.max(1));
        let bucket = &self.rate_buckets[bucket_index(ip)];
        let mut map = bucket.lock().map_err(|_| LimiterError::LockFailure)?;

        if !map.contains_key(ip) {
            if map.try_reserve(1).is_err() {
                self.counters.degraded_allocations.fetch_add(1, Ordering::Relaxed);
                warn!("limiter: failed to track rate for IP {ip}, degrading to allow");
                return Ok(Decision::Allow);
            }
            map.insert(
                ip.to_string(),
                IpRateRecord {
                    request_count: 0,
                    burst_count: 0,
                    window_start: now,
                    last_request: now,
                },
            );
        }
        let rec = map.get_mut(ip).expect("just inserted or already present");

        if now.duration_since(rec.window_start) >= window {
            rec.window_start = now;
            rec.request_count = 0;
            rec.burst_count = 0;
        }

        if now.duration_since(rec.last_request) <= Duration::from_secs(1) {
            rec.burst_count += 1;
        } else {
            rec.burst_count = 1;
        }
        rec.last_request = now;
        rec.request_count += 1;

        let max_in_window = cfg.max_requests_per_second.saturating_mul(cfg.window.max(1) as u32);
        Ok(if rec.request_count > max_in_window || rec.burst_count > cfg.max_requests_burst {
            self.counters.denied_rate.fetch_add(1, Ordering::Relaxed);
            Decision::Deny
        } else {
            Decision::Allow
        })
    }

    /// Snapshots the current connection-count record for `ip`, if any.
    pub fn connection_stats(&self, ip: &str) -> Result<Option<ConnectionStats>, LimiterError> {
        let bucket = &self.conn_buckets[bucket_index(ip)];
        let map = bucket.lock().map_err(|_| LimiterError::LockFailure)?;
        Ok(map.get(ip).map(|rec| ConnectionStats { count: rec.count }))
    }

    /// Unconditionally purges every tracked IP from both tables.
    pub fn cleanup_all_limits(&self) -> Result<(), LimiterError> {
        for bucket in &self.conn_buckets {
            bucket.lock().map_err(|_| LimiterError::LockFailure)?.clear();
        }
        for bucket in &self.rate_buckets {
            bucket.lock().map_err(|_| LimiterError::LockFailure)?.clear();
        }
        Ok(())
    }

    /// Sweeps both tables for expired records: zero-count connection
    /// records idle past `cleanup_interval`, and rate records with no
    /// request in that long. Returns `(connection_records_reaped,
    /// rate_records_reaped)`.
    pub fn reap_expired(&self) -> Result<(usize, usize), LimiterError> {
        let cleanup_interval = self.config_snapshot()?.cleanup_interval;
        let now = Instant::now();
        let mut conn_reaped = 0;
        let mut rate_reaped = 0;

        for bucket in &self.conn_buckets {
            let mut map = bucket.lock().map_err(|_| LimiterError::LockFailure)?;
            let before = map.len();
            map.retain(|_, rec| {
                !(rec.count == 0 && now.duration_since(rec.last_access) > cleanup_interval)
            });
            conn_reaped += before - map.len();
        }

        for bucket in &self.rate_buckets {
            let mut map = bucket.lock().map_err(|_| LimiterError::LockFailure)?;
            let before = map.len();
            map.retain(|_, rec| now.duration_since(rec.last_request) <= cleanup_interval);
            rate_reaped += before - map.len();
        }

        Ok((conn_reaped, rate_reaped))
    }

    /// Count of connection attempts denied by [`Limiter::check_connection_limit`].
    pub fn denied_connections(&self) -> u64 {
        self.counters.denied_connections.load(Ordering::Relaxed)
    }

    /// Count of requests denied by [`Limiter::check_rate_limit`].
    pub fn denied_requests(&self) -> u64 {
        self.counters.denied_rate.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LimiterConfig {
        LimiterConfig {
            max_connections_per_ip: 2,
            max_requests_per_second: 5,
            max_requests_burst: 100,
            window: 1,
            cleanup_interval: Duration::from_millis(200),
        }
    }

    #[test]
    fn connection_limit_allows_up_to_max_then_denies() {
        let limiter = Limiter::new(cfg());
        assert_eq!(limiter.check_connection_limit("1.2.3.4").unwrap(), Decision::Allow);
        assert_eq!(limiter.check_connection_limit("1.2.3.4").unwrap(), Decision::Allow);
        assert_eq!(limiter.check_connection_limit("1.2.3.4").unwrap(), Decision::Deny);
        assert_eq!(limiter.denied_connections(), 1);
    }

    #[test]
    fn release_then_check_allows_again() {
        let limiter = Limiter::new(cfg());
        limiter.check_connection_limit("1.2.3.4").unwrap();
        limiter.check_connection_limit("1.2.3.4").unwrap();
        assert_eq!(limiter.check_connection_limit("1.2.3.4").unwrap(), Decision::Deny);

        limiter.release_connection("1.2.3.4").unwrap();
        assert_eq!(limiter.check_connection_limit("1.2.3.4").unwrap(), Decision::Allow);
    }

    #[test]
    fn rate_limit_allows_at_threshold_denies_above() {
        let mut c = cfg();
        c.max_requests_per_second = 5;
        c.window = 1;
        let limiter = Limiter::new(c);

        for _ in 0..5 {
            assert_eq!(limiter.check_rate_limit("9.9.9.9").unwrap(), Decision::Allow);
        }
        assert_eq!(limiter.check_rate_limit("9.9.9.9").unwrap(), Decision::Deny);
    }

    #[test]
    fn rate_limit_resets_on_new_window() {
        let mut c = cfg();
        c.max_requests_per_second = 1;
        c.window = 1;
        let limiter = Limiter::new(c);

        assert_eq!(limiter.check_rate_limit("5.5.5.5").unwrap(), Decision::Allow);
        assert_eq!(limiter.check_rate_limit("5.5.5.5").unwrap(), Decision::Deny);

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(limiter.check_rate_limit("5.5.5.5").unwrap(), Decision::Allow);
    }

    #[test]
    fn reaper_removes_zero_count_idle_records() {
        let limiter = Limiter::new(cfg());
        limiter.check_connection_limit("7.7.7.7").unwrap();
        limiter.release_connection("7.7.7.7").unwrap();

        std::thread::sleep(Duration::from_millis(250));
        let (conn_reaped, _) = limiter.reap_expired().unwrap();
        assert_eq!(conn_reaped, 1);
        assert!(limiter.connection_stats("7.7.7.7").unwrap().is_none());
    }

    #[test]
    fn reaper_keeps_active_records() {
        let limiter = Limiter::new(cfg());
        limiter.check_connection_limit("8.8.8.8").unwrap();

        std::thread::sleep(Duration::from_millis(250));
        let (conn_reaped, _) = limiter.reap_expired().unwrap();
        assert_eq!(conn_reaped, 0);
        assert!(limiter.connection_stats("8.8.8.8").unwrap().is_some());
    }

    #[test]
    fn cleanup_all_purges_unconditionally() {
        let limiter = Limiter::new(cfg());
        limiter.check_connection_limit("1.1.1.1").unwrap();
        limiter.check_rate_limit("1.1.1.1").unwrap();

        limiter.cleanup_all_limits().unwrap();
        assert!(limiter.connection_stats("1.1.1.1").unwrap().is_none());
    }
}
