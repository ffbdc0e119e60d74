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

//! Owns every live [`Connection`] in a worker.
//!
//! Connections live in a single [`slab::Slab`] for their whole life; a
//! slab key doubles as the connection's [`crate::event_loop::HandlerId`]
//! and `mio::Token`, so callbacks never carry anything but that integer —
//! they look the connection back up through the pool instead of owning a
//! pointer into it (see the cyclic-ownership design note this resolves).
//! A second, separate structure — the idle stack — holds the keys of
//! connections available for reuse; `get` and `return_connection` move
//! keys between "active" (implicitly: in the slab, not in the idle
//! stack) and idle.
//!
//! Counters are plain atomics. An earlier generation of this pool
//! guarded them with their own mutex; that lock added contention without
//! adding correctness, so it's gone — see `DESIGN.md`.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::event::Source;
use mio::Token;
use slab::Slab;

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::PoolError;
use crate::event_loop::HandlerId;
use crate::net::tcp_stream::TcpStream;

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    active: AtomicU64,
    idle: AtomicU64,
    reused: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    timed_out: AtomicU64,
    total_requests: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    lifetime_sum_ns: AtomicU64,
    lifetime_count: AtomicU64,
}

/// Point-in-time snapshot returned by [`ConnectionPool::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Connections ever handed out by `get` (new or reused).
    pub total_connections: u64,
    /// Currently bound to a live fd.
    pub active_connections: u64,
    /// Currently idle, awaiting reuse.
    pub idle_connections: u64,
    /// Served by popping the idle stack instead of allocating.
    pub reused_connections: u64,
    /// Allocated fresh (never idle before).
    pub created_connections: u64,
    /// Torn down for any reason.
    pub closed_connections: u64,
    /// Torn down specifically by the idle reaper.
    pub timed_out_connections: u64,
    /// Cumulative requests served across every binding.
    pub total_requests: u64,
    /// Cumulative bytes read across every binding.
    pub bytes_read: u64,
    /// Cumulative bytes written across every binding.
    pub bytes_written: u64,
    /// Mean wall-clock lifetime of a binding, start to teardown.
    pub avg_lifetime: Duration,
    /// Mean requests served per binding.
    pub avg_requests_per_conn: f64,
}

impl Counters {
    fn record_binding_end(&self, requests: u64, bytes_read: u64, bytes_written: u64, lifetime: Duration) {
        self.total_requests.fetch_add(requests, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
        self.lifetime_sum_ns
            .fetch_add(lifetime.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.lifetime_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        let lifetime_count = self.lifetime_count.load(Ordering::Relaxed);
        let lifetime_sum = self.lifetime_sum_ns.load(Ordering::Relaxed);
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let closed = self.closed.load(Ordering::Relaxed);

        PoolStats {
            total_connections: self.total.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
            idle_connections: self.idle.load(Ordering::Relaxed),
            reused_connections: self.reused.load(Ordering::Relaxed),
            created_connections: self.created.load(Ordering::Relaxed),
            closed_connections: closed,
            timed_out_connections: self.timed_out.load(Ordering::Relaxed),
            total_requests,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            avg_lifetime: if lifetime_count == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(lifetime_sum / lifetime_count)
            },
            avg_requests_per_conn: if closed == 0 {
                0.0
            } else {
                total_requests as f64 / closed as f64
            },
        }
    }

    fn reset_cumulative(&self) {
        self.reused.store(0, Ordering::Relaxed);
        self.created.store(0, Ordering::Relaxed);
        self.closed.store(0, Ordering::Relaxed);
        self.timed_out.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.lifetime_sum_ns.store(0, Ordering::Relaxed);
        self.lifetime_count.store(0, Ordering::Relaxed);
    }
}

/// Owns every live connection in a worker. See module docs.
pub struct ConnectionPool<S>
where
    S: TcpStream + Read + Write + Source,
{
    storage: Mutex<Slab<Connection<S>>>,
    idle: Mutex<Vec<HandlerId>>,
    config: Mutex<PoolConfig>,
    counters: Counters,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S> std::fmt::Debug for ConnectionPool<S>
where
    S: TcpStream + Read + Write + Source,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<S> ConnectionPool<S>
where
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    /// Allocates pool storage for up to `cfg.max_connections` live
    /// connections and starts the background idle reaper. The reaper
    /// holds only a [`Weak`] reference, so it never keeps the pool alive
    /// past its last external [`std::sync::Arc`].
    pub fn create(cfg: PoolConfig) -> Result<std::sync::Arc<Self>, PoolError> {
        let pool = std::sync::Arc::new(Self {
            storage: Mutex::new(Slab::with_capacity(cfg.max_connections)),
            idle: Mutex::new(Vec::with_capacity(cfg.max_idle)),
            config: Mutex::new(cfg),
            counters: Counters::default(),
            reaper_handle: Mutex::new(None),
        });

        let weak: Weak<Self> = std::sync::Arc::downgrade(&pool);
        let handle = thread::Builder::new()
            .name("reactorcore-pool-reaper".into())
            .spawn(move || reaper_loop(weak))
            .map_err(|_| PoolError::AllocationFailed)?;

        *pool.reaper_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(pool)
    }

    fn lock_storage(&self) -> Result<std::sync::MutexGuard<'_, Slab<Connection<S>>>, PoolError> {
        self.storage.lock().map_err(|_| PoolError::LockFailure)
    }

    fn lock_idle(&self) -> Result<std::sync::MutexGuard<'_, Vec<HandlerId>>, PoolError> {
        self.idle.lock().map_err(|_| PoolError::LockFailure)
    }

    fn lock_config(&self) -> Result<std::sync::MutexGuard<'_, PoolConfig>, PoolError> {
        self.config.lock().map_err(|_| PoolError::LockFailure)
    }

    fn config_snapshot(&self) -> Result<PoolConfig, PoolError> {
        Ok(self.lock_config()?.clone())
    }

    /// Replaces the pool's configuration wholesale. In-flight operations
    /// continue against whatever snapshot they already copied.
    pub fn set_config(&self, cfg: PoolConfig) -> Result<(), PoolError> {
        *self.lock_config()? = cfg;
        Ok(())
    }

    /// Current configuration snapshot.
    pub fn get_config(&self) -> Result<PoolConfig, PoolError> {
        self.config_snapshot()
    }

    /// Hands out a connection for `stream`/`remote_addr`: reuses the most
    /// recently idled connection if reuse is enabled and one is
    /// available, otherwise allocates a new one. Returns
    /// [`PoolError::AtCapacity`] if the pool is full and nothing is idle.
    pub fn get(&self, stream: S, remote_addr: SocketAddr) -> Result<HandlerId, PoolError> {
        let cfg = self.config_snapshot()?;

        if cfg.enable_connection_reuse {
            let popped = {
                let mut idle = self.lock_idle()?;
                idle.pop()
            };
            if let Some(key) = popped {
                let mut storage = self.lock_storage()?;
                if let Some(conn) = storage.get_mut(key) {
                    conn.reuse(stream, Token(key), remote_addr);
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    self.counters.idle.fetch_sub(1, Ordering::Relaxed);
                    self.counters.active.fetch_add(1, Ordering::Relaxed);
                    self.counters.total.fetch_add(1, Ordering::Relaxed);
                    return Ok(key);
                }
                // Popped a key the slab no longer has; fall through and
                // allocate fresh rather than leaking the accepted stream.
            }
        }

        let mut storage = self.lock_storage()?;
        if storage.len() >= cfg.max_connections {
            return Err(PoolError::AtCapacity);
        }

        let entry = storage.vacant_entry();
        let key = entry.key();
        entry.insert(Connection::new(stream, Token(key), remote_addr, cfg.memory_pool_size));

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        Ok(key)
    }

    /// Returns a connection to the idle set for reuse, or closes it if
    /// reuse is disabled or the idle set is full. Lock order: pool
    /// (`storage`) before idle, never the reverse.
    pub fn return_connection(&self, key: HandlerId) -> Result<(), PoolError> {
        let cfg = self.config_snapshot()?;
        let mut storage = self.lock_storage()?;

        if !storage.contains(key) {
            return Ok(());
        }
        if !cfg.enable_connection_reuse {
            drop(storage);
            return self.close(key);
        }

        let mut idle = self.lock_idle()?;
        if idle.len() >= cfg.max_idle {
            drop(idle);
            drop(storage);
            return self.close(key);
        }

        let conn = &mut storage[key];
        let (requests, bytes_read, bytes_written) = {
            let (br, bw) = conn.byte_counts();
            (conn.request_count(), br, bw)
        };
        self.counters
            .record_binding_end(requests, bytes_read, bytes_written, conn.age());
        conn.finish_request(true);
        idle.push(key);

        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        self.counters.idle.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes `key` from both the active slab and the idle stack and
    /// tears down its connection. Idempotent: a `key` present in neither
    /// is a no-op, and calling this twice for the same `key` produces the
    /// same end state without double-decrementing counters.
    pub fn close(&self, key: HandlerId) -> Result<(), PoolError> {
        let mut storage = self.lock_storage()?;
        let mut idle = self.lock_idle()?;

        let was_idle = if let Some(pos) = idle.iter().position(|&k| k == key) {
            idle.remove(pos);
            true
        } else {
            false
        };
        drop(idle);

        if !storage.contains(key) {
            return Ok(());
        }
        let mut conn = storage.remove(key);

        if was_idle {
            self.counters.idle.fetch_sub(1, Ordering::Relaxed);
        } else {
            let (br, bw) = conn.byte_counts();
            self.counters
                .record_binding_end(conn.request_count(), br, bw, conn.age());
            self.counters.active.fetch_sub(1, Ordering::Relaxed);
        }

        conn.close();
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sweeps the idle stack, tail to head, closing every connection
    /// whose [`Connection::idle_duration`] exceeds `idle_timeout`.
    /// Returns the count reaped.
    pub fn cleanup_idle(&self) -> Result<usize, PoolError> {
        let idle_timeout = self.config_snapshot()?.idle_timeout;
        let mut storage = self.lock_storage()?;
        let mut idle = self.lock_idle()?;

        let mut survivors = Vec::with_capacity(idle.len());
        let mut reaped = 0usize;

        while let Some(key) = idle.pop() {
            let expired = storage
                .get(key)
                .and_then(|c| c.idle_duration())
                .map(|d| d > idle_timeout)
                .unwrap_or(false);

            if !expired {
                survivors.push(key);
                continue;
            }

            if storage.contains(key) {
                let mut conn = storage.remove(key);
                let (br, bw) = conn.byte_counts();
                self.counters
                    .record_binding_end(conn.request_count(), br, bw, conn.age());
                conn.close();
                self.counters.idle.fetch_sub(1, Ordering::Relaxed);
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                reaped += 1;
            }
        }

        // `survivors` was built popping tail-to-head; pushing it back in
        // reverse restores the original head-to-tail order.
        while let Some(key) = survivors.pop() {
            idle.push(key);
        }

        Ok(reaped)
    }

    /// Snapshot of every counter in [`PoolStats`].
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Zeroes cumulative counters (created/closed/reused/bytes/requests/
    /// lifetime). Live-state counters (active/idle/total) are untouched —
    /// they must always reflect the pool's actual contents.
    pub fn reset_stats(&self) {
        self.counters.reset_cumulative();
    }

    /// Logs the current stats snapshot at info level.
    pub fn print_stats(&self) {
        let stats = self.stats();
        log::info!(
            "pool stats: total={} active={} idle={} reused={} created={} closed={} timed_out={} \
             requests={} bytes_read={} bytes_written={} avg_lifetime={:?} avg_requests_per_conn={:.2}",
            stats.total_connections,
            stats.active_connections,
            stats.idle_connections,
            stats.reused_connections,
            stats.created_connections,
            stats.closed_connections,
            stats.timed_out_connections,
            stats.total_requests,
            stats.bytes_read,
            stats.bytes_written,
            stats.avg_lifetime,
            stats.avg_requests_per_conn,
        );
    }

    /// Current count of connections registered as active (bound to a live
    /// fd, not sitting idle).
    pub fn active_count(&self) -> u64 {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Runs `f` against the connection at `key`, if still present.
    /// Exists so callers outside this module (the worker's accept/read
    /// callbacks) can drive a connection's FSM without reaching through
    /// the slab lock themselves.
    pub fn with_connection_mut<R>(
        &self,
        key: HandlerId,
        f: impl FnOnce(&mut Connection<S>) -> R,
    ) -> Result<Option<R>, PoolError> {
        let mut storage = self.lock_storage()?;
        Ok(storage.get_mut(key).map(f))
    }

    /// The remote address bound to `key`, if still present.
    pub fn remote_addr(&self, key: HandlerId) -> Result<Option<SocketAddr>, PoolError> {
        let storage = self.lock_storage()?;
        Ok(storage.get(key).map(|c| c.remote_addr()))
    }

    /// Closes every connection, active or idle. Used when graceful
    /// shutdown's 30s drain deadline elapses with connections still
    /// live.
    pub fn force_close_all(&self) -> Result<(), PoolError> {
        let keys: Vec<HandlerId> = {
            let storage = self.lock_storage()?;
            storage.iter().map(|(k, _)| k).collect()
        };
        for key in keys {
            self.close(key)?;
        }
        Ok(())
    }
}

impl<S> Drop for ConnectionPool<S>
where
    S: TcpStream + Read + Write + Source,
{
    fn drop(&mut self) {
        if let Some(handle) = self.reaper_handle.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

fn reaper_loop<S>(weak: Weak<ConnectionPool<S>>)
where
    S: TcpStream + Read + Write + Source + Send + 'static,
{
    let tick = Duration::from_millis(50);
    loop {
        let interval = match weak.upgrade() {
            Some(pool) => {
                if let Err(e) = pool.cleanup_idle() {
                    log::error!("pool reaper: {e}, exiting");
                    return;
                }
                match pool.config_snapshot() {
                    Ok(cfg) => cfg.pool_cleanup_interval,
                    Err(e) => {
                        log::error!("pool reaper: {e}, exiting");
                        return;
                    }
                }
            }
            None => return,
        };

        let mut waited = Duration::ZERO;
        while waited < interval {
            thread::sleep(tick.min(interval - waited));
            waited += tick;
            if weak.upgrade().is_none() {
                return;
            }
        }
    }
}
