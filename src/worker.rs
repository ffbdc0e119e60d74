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

//! A worker owns one listening socket, one reactor, one connection pool,
//! and one limiter, and runs them all from a single OS process.
//!
//! Protocol handling — parsing a request and producing a response — is
//! not this crate's concern; it is supplied by the caller through
//! [`RequestHandler`]. This module wires together accept, limiter checks,
//! pool hand-out, and event-loop registration, and drives the signal and
//! shutdown lifecycle around them.
//!
//! Signal handlers here only ever flip an [`AtomicBool`]; everything a
//! signal implies — reloading config, draining connections, exiting —
//! happens on the main loop thread after it observes the flag. A handler
//! that touched the pool or the event loop directly could run in the
//! middle of an arbitrary lock being held and deadlock the process.

use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Interest, Token};

use crate::config::{LimiterConfig, PoolConfig, WorkerConfig};
use crate::connection::Connection;
use crate::error::WorkerError;
use crate::event_loop::EventLoop;
use crate::limiter::Limiter;
use crate::net::tcp_listener::TcpListener;
use crate::net::tcp_stream::TcpStream;
use crate::pool::ConnectionPool;

/// Reserved token for the listening socket. Connection tokens come from
/// slab keys, which stay far below this for any realistic `max_connections`.
const LISTENER_TOKEN: usize = usize::MAX - 1;

/// Maximum accepts drained from the listener per readiness wakeup, so one
/// worker answering a connection storm can't starve its own event loop.
const MAX_ACCEPTS_PER_WAKEUP: usize = 100;

/// How long graceful shutdown waits for active connections to drain
/// before forcing them closed.
const GRACEFUL_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Observable lifecycle state of a worker, exposed for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepting and serving connections normally.
    Running,
    /// Graceful stop in progress: no longer accepting, waiting for active
    /// connections to finish.
    Draining,
    /// Main loop has exited.
    Stopped,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            STATE_DRAINING => WorkerState::Draining,
            STATE_STOPPED => WorkerState::Stopped,
            _ => WorkerState::Running,
        }
    }
}

/// What the handler wants done with a connection after a readable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the connection registered; more data is expected.
    KeepOpen,
    /// This binding is done. The worker deregisters it and returns it to
    /// the pool (which decides reuse vs. close).
    Finished,
}

/// Supplied by the protocol layer outside this crate. Called from the
/// reactor thread when a connection becomes readable.
pub trait RequestHandler<S>: Send + Sync
where
    S: TcpStream + io::Read + io::Write + Source,
{
    /// Invoked after the worker has read `bytes_read` new bytes into
    /// `conn`'s read buffer (`bytes_read == 0` is handled by the worker
    /// as EOF before this is ever called), reachable via
    /// [`Connection::read_buf`] and consumed with
    /// [`Connection::consume_read_buffer`]. Any response bytes should be
    /// queued and flushed via [`Connection::queue_write`] /
    /// [`Connection::flush_write_buffer`] before returning.
    fn on_readable(&self, conn: &mut Connection<S>, bytes_read: usize) -> io::Result<Disposition>;
}

/// Atomic counters and lifecycle state shared between the main loop and
/// anything inspecting a running worker (stats endpoint, tests).
#[derive(Debug)]
pub struct WorkerContext {
    /// Index of this worker among its siblings, for logging.
    pub worker_id: usize,
    state: AtomicU8,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    total_requests: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    denied_by_pool: AtomicU64,
    denied_by_limiter: AtomicU64,
}

impl WorkerContext {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            state: AtomicU8::new(STATE_RUNNING),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            denied_by_pool: AtomicU64::new(0),
            denied_by_limiter: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    /// Connections currently registered with the event loop.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Connections ever handed out by this worker's pool.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Requests completed by this worker's handler.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Cumulative bytes read/written across every connection this worker
    /// has served.
    pub fn byte_counts(&self) -> (u64, u64) {
        (
            self.bytes_read.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }

    /// Accepts rejected by the connection pool (at capacity).
    pub fn denied_by_pool(&self) -> u64 {
        self.denied_by_pool.load(Ordering::Relaxed)
    }

    /// Accepts rejected by the per-IP limiter.
    pub fn denied_by_limiter(&self) -> u64 {
        self.denied_by_limiter.load(Ordering::Relaxed)
    }
}

/// What the main loop should do on a given tick, derived purely from the
/// three signal flags. Kept as a free function so the decision logic is
/// testable without installing real signal handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopAction {
    Continue,
    Reload,
    GracefulStop,
    ImmediateStop,
}

/// Immediate stop pre-empts graceful stop, which pre-empts reload: a
/// worker mid-drain that receives `SIGQUIT` should stop drawing out the
/// shutdown, not start reloading config it's about to discard.
fn next_action(reload: bool, graceful: bool, immediate: bool) -> LoopAction {
    if immediate {
        LoopAction::ImmediateStop
    } else if graceful {
        LoopAction::GracefulStop
    } else if reload {
        LoopAction::Reload
    } else {
        LoopAction::Continue
    }
}

struct SignalFlags {
    reload: Arc<AtomicBool>,
    graceful: Arc<AtomicBool>,
    immediate: Arc<AtomicBool>,
    /// Registered so `signal_hook` installs a handler for `SIGPIPE` that
    /// merely flips a flag, rather than the default action of terminating
    /// the process on a write to a closed socket. The flag itself is
    /// never read.
    _sigpipe: Arc<AtomicBool>,
}

fn install_signal_handlers() -> Result<SignalFlags, WorkerError> {
    let reload = Arc::new(AtomicBool::new(false));
    let graceful = Arc::new(AtomicBool::new(false));
    let immediate = Arc::new(AtomicBool::new(false));
    let sigpipe = Arc::new(AtomicBool::new(false));

    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&reload))
        .map_err(WorkerError::Signal)?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&graceful))
        .map_err(WorkerError::Signal)?;
    signal_hook::flag::register(signal_hook::consts::SIGQUIT, Arc::clone(&immediate))
        .map_err(WorkerError::Signal)?;
    signal_hook::flag::register(signal_hook::consts::SIGPIPE, Arc::clone(&sigpipe))
        .map_err(WorkerError::Signal)?;

    Ok(SignalFlags {
        reload,
        graceful,
        immediate,
        _sigpipe: sigpipe,
    })
}

/// Runs one worker process to completion: binds no sockets itself (the
/// supervisor hands over an already-bound, already-listening `listener`),
/// accepts connections, dispatches readable events to `handler`, and
/// blocks until a graceful or immediate stop signal is observed.
pub fn worker_process_run<L, S, H>(
    worker_id: usize,
    listener: L,
    cfg: WorkerConfig,
    handler: Arc<H>,
) -> Result<(), WorkerError>
where
    L: TcpListener<S> + Source + Send + 'static,
    S: TcpStream + io::Read + io::Write + Source + Send + 'static,
    H: RequestHandler<S> + 'static,
{
    let ctx = Arc::new(WorkerContext::new(worker_id));
    let event_loop = Arc::new(EventLoop::create(cfg.event_loop_max_events)?);
    let pool = ConnectionPool::<S>::create(PoolConfig::from_worker(&cfg))?;
    let limiter = Arc::new(Limiter::new(LimiterConfig::from_worker(&cfg)));
    let cfg_shared = Arc::new(Mutex::new(cfg.clone()));
    let mut thread_pool = crate::thread_pool::ThreadPool::create(cfg.thread_pool_size, cfg.thread_pool_queue_size)?;

    let signals = install_signal_handlers()?;

    let listener = Arc::new(Mutex::new(listener));
    let read_cb = {
        let listener = Arc::clone(&listener);
        let pool = Arc::clone(&pool);
        let limiter = Arc::clone(&limiter);
        let event_loop = Arc::clone(&event_loop);
        let ctx = Arc::clone(&ctx);
        let handler = Arc::clone(&handler);
        Box::new(move |_id: crate::event_loop::HandlerId| -> io::Result<()> {
            accept_connections(&listener, &pool, &limiter, &event_loop, &ctx, &handler)
        }) as crate::event_loop::Callback
    };

    {
        let mut guard = match listener.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("worker {worker_id}: listener mutex poisoned during setup");
                return Err(WorkerError::LockFailure);
            }
        };
        event_loop.add(
            &mut *guard,
            Token(LISTENER_TOKEN),
            Interest::READABLE,
            Some(read_cb),
            None,
            LISTENER_TOKEN,
        )?;
    }

    let reactor = Arc::clone(&event_loop);
    let reactor_handle = thread::Builder::new()
        .name(format!("reactorcore-worker-{worker_id}-reactor"))
        .spawn(move || reactor.start())
        .map_err(WorkerError::Io)?;

    log::info!("worker {worker_id}: started, pid-local reactor running");

    loop {
        match next_action(
            signals.reload.load(Ordering::Relaxed),
            signals.graceful.load(Ordering::Relaxed),
            signals.immediate.load(Ordering::Relaxed),
        ) {
            LoopAction::ImmediateStop => {
                log::warn!("worker {worker_id}: SIGQUIT received, stopping immediately");
                break;
            }
            LoopAction::GracefulStop => {
                log::info!("worker {worker_id}: SIGTERM received, draining connections");
                drain_and_stop(&ctx, &pool, &listener, &event_loop, &signals);
                break;
            }
            LoopAction::Reload => {
                signals.reload.store(false, Ordering::Relaxed);
                log::info!("worker {worker_id}: SIGHUP received, reloading configuration");
                let current = match cfg_shared.lock() {
                    Ok(guard) => guard.clone(),
                    Err(_) => {
                        log::error!("worker {worker_id}: config mutex poisoned, skipping reload");
                        continue;
                    }
                };
                match current.validate() {
                    Ok(()) => {
                        if let Err(e) = pool.set_config(PoolConfig::from_worker(&current)) {
                            log::error!("worker {worker_id}: failed to apply reloaded pool config: {e}");
                        }
                        if let Err(e) = limiter.configure(LimiterConfig::from_worker(&current)) {
                            log::error!("worker {worker_id}: failed to apply reloaded limiter config: {e}");
                        }
                    }
                    Err(e) => {
                        log::warn!("worker {worker_id}: {}", WorkerError::Reload(e));
                    }
                }
            }
            LoopAction::Continue => {}
        }

        thread::sleep(Duration::from_millis(10));
    }

    ctx.state.store(STATE_STOPPED, Ordering::Release);
    event_loop.stop();
    event_loop.wait();
    let _ = reactor_handle.join();
    thread_pool.shutdown(false);

    log::info!(
        "worker {worker_id}: stopped, served {} requests on {} connections",
        ctx.total_requests(),
        ctx.total_connections(),
    );
    Ok(())
}

/// Stops accepting, then waits up to [`GRACEFUL_DRAIN_TIMEOUT`] for
/// active connections to finish on their own before forcing them closed.
fn drain_and_stop<L, S>(
    ctx: &Arc<WorkerContext>,
    pool: &Arc<ConnectionPool<S>>,
    listener: &Arc<Mutex<L>>,
    event_loop: &Arc<EventLoop>,
    signals: &SignalFlags,
) where
    L: TcpListener<S> + Source,
    S: TcpStream + io::Read + io::Write + Source + Send + 'static,
{
    ctx.state.store(STATE_DRAINING, Ordering::Release);
    match listener.lock() {
        Ok(mut guard) => {
            let _ = event_loop.delete(&mut *guard, Token(LISTENER_TOKEN));
        }
        Err(_) => log::error!(
            "worker {}: listener mutex poisoned, skipping listener deregistration",
            ctx.worker_id
        ),
    }

    let deadline = Instant::now() + GRACEFUL_DRAIN_TIMEOUT;
    while ctx.active_connections() > 0 && Instant::now() < deadline {
        // an immediate-stop signal arriving mid-drain should cut the wait short
        if signals.immediate.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    let remaining = ctx.active_connections();
    if remaining > 0 {
        log::warn!(
            "worker {}: drain deadline elapsed with {remaining} connections still active, forcing close",
            ctx.worker_id
        );
        if let Err(e) = pool.force_close_all() {
            log::error!("worker {}: failed to force-close remaining connections: {e}", ctx.worker_id);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_connections<L, S, H>(
    listener: &Arc<Mutex<L>>,
    pool: &Arc<ConnectionPool<S>>,
    limiter: &Arc<Limiter>,
    event_loop: &Arc<EventLoop>,
    ctx: &Arc<WorkerContext>,
    handler: &Arc<H>,
) -> io::Result<()>
where
    L: TcpListener<S> + Source,
    S: TcpStream + io::Read + io::Write + Source + Send + 'static,
    H: RequestHandler<S> + 'static,
{
    let guard = match listener.lock() {
        Ok(guard) => guard,
        Err(_) => {
            log::error!("worker: listener mutex poisoned, dropping accept wakeup");
            return Ok(());
        }
    };

    for _ in 0..MAX_ACCEPTS_PER_WAKEUP {
        let (stream, remote_addr) = match guard.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        };
        let _ = stream.set_nodelay(true);
        let ip = remote_addr.ip().to_string();

        let conn_decision = match limiter.check_connection_limit(&ip) {
            Ok(d) => d,
            Err(e) => {
                log::error!("worker: connection-limit check failed for {ip}: {e}");
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
        };
        if !conn_decision.is_allowed() {
            let _ = stream.shutdown(Shutdown::Both);
            ctx.denied_by_limiter.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let rate_decision = match limiter.check_rate_limit(&ip) {
            Ok(d) => d,
            Err(e) => {
                log::error!("worker: rate-limit check failed for {ip}: {e}");
                release_ip(limiter, &ip);
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
        };
        if !rate_decision.is_allowed() {
            release_ip(limiter, &ip);
            let _ = stream.shutdown(Shutdown::Both);
            ctx.denied_by_limiter.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let key = match pool.get(stream, remote_addr) {
            Ok(key) => key,
            Err(_) => {
                // the stream was consumed by `get` and is dropped here,
                // closing its fd, even on the AtCapacity path
                release_ip(limiter, &ip);
                ctx.denied_by_pool.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let registered = pool.with_connection_mut(key, |conn| {
            conn.register(
                event_loop.as_ref(),
                Interest::READABLE,
                Some(make_read_cb(key, pool, limiter, event_loop, ctx, handler)),
                None,
            )
        });
        match registered {
            Ok(Some(Ok(()))) => {
                ctx.active_connections.fetch_add(1, Ordering::Relaxed);
                ctx.total_connections.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Some(Err(e))) => {
                log::warn!("worker: failed to register connection {key}: {e}");
                if let Err(e) = pool.close(key) {
                    log::error!("worker: failed to close connection {key} after registration failure: {e}");
                }
                release_ip(limiter, &ip);
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("worker: pool lock failure registering connection {key}: {e}");
            }
        }
    }

    Ok(())
}

fn release_ip(limiter: &Arc<Limiter>, ip: &str) {
    if let Err(e) = limiter.release_connection(ip) {
        log::error!("worker: failed to release connection slot for {ip}: {e}");
    }
}

/// What a connection-completing callback should do with the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishMode {
    /// Hand it back to the pool for idle keep-alive reuse.
    Return,
    /// Tear it down; an error occurred.
    Close,
}

fn finish_connection<S>(
    key: crate::event_loop::HandlerId,
    pool: &Arc<ConnectionPool<S>>,
    limiter: &Arc<Limiter>,
    event_loop: &Arc<EventLoop>,
    ctx: &Arc<WorkerContext>,
    ip: Option<&str>,
    mode: FinishMode,
) where
    S: TcpStream + io::Read + io::Write + Source + Send + 'static,
{
    if let Err(e) = pool.with_connection_mut(key, |conn| conn.deregister(event_loop.as_ref())) {
        log::error!("worker: pool lock failure deregistering connection {key}: {e}");
    }
    let result = match mode {
        FinishMode::Return => pool.return_connection(key),
        FinishMode::Close => pool.close(key),
    };
    if let Err(e) = result {
        log::error!("worker: failed to dispose of connection {key}: {e}");
    }
    ctx.active_connections.fetch_sub(1, Ordering::Relaxed);
    if let Some(ip) = ip {
        release_ip(limiter, ip);
    }
}

fn make_read_cb<S, H>(
    key: crate::event_loop::HandlerId,
    pool: &Arc<ConnectionPool<S>>,
    limiter: &Arc<Limiter>,
    event_loop: &Arc<EventLoop>,
    ctx: &Arc<WorkerContext>,
    handler: &Arc<H>,
) -> crate::event_loop::Callback
where
    S: TcpStream + io::Read + io::Write + Source + Send + 'static,
    H: RequestHandler<S> + 'static,
{
    let pool = Arc::clone(pool);
    let limiter = Arc::clone(limiter);
    let event_loop = Arc::clone(event_loop);
    let ctx = Arc::clone(ctx);
    let handler = Arc::clone(handler);

    Box::new(move |_id: crate::event_loop::HandlerId| -> io::Result<()> {
        let ip = match pool.remote_addr(key) {
            Ok(addr) => addr.map(|a| a.ip().to_string()),
            Err(e) => {
                log::error!("worker: pool lock failure reading remote_addr for {key}: {e}");
                None
            }
        };

        let outcome = pool.with_connection_mut(key, |conn| -> io::Result<Disposition> {
            let n = conn.read_into_buffer()?;
            if n == 0 {
                return Ok(Disposition::Finished);
            }
            ctx.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
            let disposition = handler.on_readable(conn, n)?;
            let (_, bw) = conn.byte_counts();
            ctx.bytes_written.store(bw, Ordering::Relaxed);
            if disposition == Disposition::Finished {
                conn.finish_request(true);
                ctx.total_requests.fetch_add(1, Ordering::Relaxed);
            }
            Ok(disposition)
        });

        match outcome {
            Ok(Some(Ok(Disposition::Finished))) => {
                let pending = pool.with_connection_mut(key, |conn| conn.has_pending_write());
                match pending {
                    Ok(Some(true)) => {
                        let upgrade = pool.with_connection_mut(key, |conn| {
                            conn.modify(
                                event_loop.as_ref(),
                                Interest::WRITABLE,
                                None,
                                Some(make_write_cb(key, &pool, &limiter, &event_loop, &ctx, ip.clone())),
                            )
                        });
                        match upgrade {
                            Ok(Some(Ok(()))) => {}
                            Ok(Some(Err(e))) => {
                                log::warn!("worker: failed to upgrade connection {key} to writable: {e}");
                                finish_connection(key, &pool, &limiter, &event_loop, &ctx, ip.as_deref(), FinishMode::Close);
                            }
                            Ok(None) => {}
                            Err(e) => log::error!("worker: pool lock failure upgrading connection {key}: {e}"),
                        }
                    }
                    Ok(Some(false)) | Ok(None) => {
                        finish_connection(key, &pool, &limiter, &event_loop, &ctx, ip.as_deref(), FinishMode::Return);
                    }
                    Err(e) => {
                        log::error!("worker: pool lock failure checking pending write on connection {key}: {e}");
                    }
                }
            }
            Ok(Some(Ok(Disposition::KeepOpen))) => {}
            Ok(Some(Err(e))) => {
                log::warn!("worker: read/handler error on connection {key}: {e}");
                finish_connection(key, &pool, &limiter, &event_loop, &ctx, ip.as_deref(), FinishMode::Close);
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("worker: pool lock failure dispatching connection {key}: {e}");
            }
        }

        Ok(())
    })
}

/// Registered for [`mio::Interest::WRITABLE`] once [`Connection::flush_write_buffer`]
/// reports data still queued after a read callback finished a request.
/// Keeps draining on each writable wakeup until the buffer empties, then
/// disposes of the connection exactly as the read path would have.
fn make_write_cb<S>(
    key: crate::event_loop::HandlerId,
    pool: &Arc<ConnectionPool<S>>,
    limiter: &Arc<Limiter>,
    event_loop: &Arc<EventLoop>,
    ctx: &Arc<WorkerContext>,
    ip: Option<String>,
) -> crate::event_loop::Callback
where
    S: TcpStream + io::Read + io::Write + Source + Send + 'static,
{
    let pool = Arc::clone(pool);
    let limiter = Arc::clone(limiter);
    let event_loop = Arc::clone(event_loop);
    let ctx = Arc::clone(ctx);

    Box::new(move |_id: crate::event_loop::HandlerId| -> io::Result<()> {
        let outcome = pool.with_connection_mut(key, |conn| -> io::Result<bool> {
            conn.flush_write_buffer()?;
            let (_, bw) = conn.byte_counts();
            ctx.bytes_written.store(bw, Ordering::Relaxed);
            Ok(conn.has_pending_write())
        });

        match outcome {
            Ok(Some(Ok(true))) => {
                // still blocked; stay registered for WRITABLE and wait for the next wakeup
            }
            Ok(Some(Ok(false))) => {
                finish_connection(key, &pool, &limiter, &event_loop, &ctx, ip.as_deref(), FinishMode::Return);
            }
            Ok(Some(Err(e))) => {
                log::warn!("worker: write error on connection {key}: {e}");
                finish_connection(key, &pool, &limiter, &event_loop, &ctx, ip.as_deref(), FinishMode::Close);
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("worker: pool lock failure flushing connection {key}: {e}");
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_stop_preempts_graceful_and_reload() {
        assert_eq!(next_action(true, true, true), LoopAction::ImmediateStop);
    }

    #[test]
    fn graceful_stop_preempts_reload() {
        assert_eq!(next_action(true, true, false), LoopAction::GracefulStop);
    }

    #[test]
    fn reload_alone_is_reload() {
        assert_eq!(next_action(true, false, false), LoopAction::Reload);
    }

    #[test]
    fn no_flags_continues() {
        assert_eq!(next_action(false, false, false), LoopAction::Continue);
    }

    #[test]
    fn worker_context_starts_running_with_zeroed_counters() {
        let ctx = WorkerContext::new(0);
        assert_eq!(ctx.state(), WorkerState::Running);
        assert_eq!(ctx.active_connections(), 0);
        assert_eq!(ctx.total_requests(), 0);
        assert_eq!(ctx.byte_counts(), (0, 0));
    }

    #[test]
    fn worker_state_from_u8_round_trips_known_values() {
        assert_eq!(WorkerState::from(STATE_RUNNING), WorkerState::Running);
        assert_eq!(WorkerState::from(STATE_DRAINING), WorkerState::Draining);
        assert_eq!(WorkerState::from(STATE_STOPPED), WorkerState::Stopped);
    }
}
