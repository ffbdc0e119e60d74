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

//! Error kinds for the worker concurrency core.
//!
//! Each component exposes a small error enum rather than a shared
//! catch-all, mirroring the status-code taxonomy the core is specified
//! against: resource exhaustion, I/O on a managed fd, lock-primitive
//! failure, and configuration rejection are distinct concerns that
//! callers handle differently.

use std::io;

use thiserror::Error;

/// Errors produced by the event loop's registration API.
#[derive(Debug, Error)]
pub enum EventLoopError {
    /// `add` was called for an fd that already has a handler registered.
    #[error("fd already registered with this loop")]
    AlreadyRegistered,
    /// `del`/`mod` was called for an fd with no handler.
    #[error("fd not registered with this loop")]
    NotFound,
    /// The underlying readiness multiplexer returned an error other than
    /// signal interruption.
    #[error("multiplexer error: {0}")]
    Io(#[from] io::Error),
    /// The handler table or poll lock was poisoned by a panicking holder.
    #[error("lock failure in event loop")]
    LockFailure,
}

/// Errors returned by [`crate::thread_pool::ThreadPool::submit`].
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ThreadPoolError {
    /// The pool was constructed with invalid parameters (zero threads).
    #[error("invalid thread pool parameters")]
    Invalid,
    /// The bounded task queue is full.
    #[error("task queue is full")]
    QueueFull,
    /// `shutdown` has already been requested; no further tasks are accepted.
    #[error("thread pool is shutting down")]
    ShutDown,
    /// The queue mutex was poisoned by a panicking holder.
    #[error("lock failure on task queue")]
    LockFailure,
}

/// Errors from [`crate::pool::ConnectionPool`] operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `active_count == max_connections`; back-pressure to the accept loop.
    #[error("connection pool at capacity")]
    AtCapacity,
    /// An internal allocation failed while constructing pool storage.
    #[error("failed to allocate pool storage")]
    AllocationFailed,
    /// The pool, idle, or stats lock was poisoned.
    #[error("lock failure in connection pool")]
    LockFailure,
    /// I/O error while registering/deregistering a connection's fd.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from [`crate::limiter::Limiter`] operations.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// A per-IP bucket or the shared config lock was poisoned.
    #[error("lock failure in limiter")]
    LockFailure,
}

/// A reloaded [`crate::config::WorkerConfig`] failed validation. The
/// previous configuration stays in effect rather than being replaced.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ConfigError {
    /// `max_connections` was zero.
    #[error("max_connections must be greater than zero")]
    ZeroConnections,
    /// `thread_pool_size` was zero.
    #[error("thread_pool_size must be greater than zero")]
    ZeroThreadPoolSize,
    /// `connection_limit_window` was zero.
    #[error("connection_limit_window must be greater than zero")]
    ZeroRateWindow,
}

/// Errors from worker-lifecycle operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The event loop rejected a registration or failed to start.
    #[error(transparent)]
    EventLoop(#[from] EventLoopError),
    /// The connection pool could not be created or failed an operation.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// The thread pool could not be created.
    #[error(transparent)]
    ThreadPool(#[from] ThreadPoolError),
    /// The per-IP limiter failed an operation.
    #[error(transparent)]
    Limiter(#[from] LimiterError),
    /// A hot-reload (`SIGHUP`) was rejected; the previous configuration
    /// stays in effect, per spec.md §7.
    #[error("rejected reloaded configuration: {0}")]
    Reload(#[source] ConfigError),
    /// The listener or shared-config lock was poisoned.
    #[error("lock failure in worker")]
    LockFailure,
    /// Installing a signal handler failed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
    /// Generic I/O failure (binding, accept, etc).
    #[error(transparent)]
    Io(#[from] io::Error),
}
