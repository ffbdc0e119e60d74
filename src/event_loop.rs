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

//! The single-threaded reactor that multiplexes readiness across every
//! registered fd and dispatches read/write callbacks.
//!
//! Registration (`add`/`modify`/`delete`) may be called from any thread;
//! dispatch only ever happens on whichever thread calls [`EventLoop::start`].
//! Callbacks never see the fd itself — per the cyclic-ownership note in the
//! design notes, they receive a caller-chosen [`HandlerId`] and look up
//! whatever it refers to (typically a connection) through their own
//! back-reference, rather than the loop handing out an owning pointer.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::EventLoopError;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Opaque value threaded through to a callback on dispatch. The loop never
/// interprets it; callers use it to find whatever the fd is backing (a
/// pooled connection, the listen socket, ...).
pub type HandlerId = usize;

/// A callback invoked when its fd becomes readable or writable.
pub type Callback = Box<dyn FnMut(HandlerId) -> io::Result<()> + Send>;

struct EventHandler {
    interest: Interest,
    read_cb: Option<Callback>,
    write_cb: Option<Callback>,
    arg: HandlerId,
}

/// Running min/max/average processing-time-per-event, in nanoseconds.
#[derive(Debug, Default)]
pub struct LatencyStats {
    /// Fastest callback dispatch observed.
    pub min_ns: u64,
    /// Slowest callback dispatch observed.
    pub max_ns: u64,
    /// Mean callback dispatch time across all events processed.
    pub avg_ns: u64,
}

/// Point-in-time counters exposed by the event loop.
#[derive(Debug, Default)]
pub struct EventLoopStats {
    /// Cumulative count of dispatched read/write callbacks.
    pub total_events_processed: u64,
    /// Count of events dispatched in the most recently completed wakeup.
    pub batch_events_processed: u64,
    /// Multiplexer errors other than signal interruption.
    pub error_count: u64,
    /// Wakeups where the timeout elapsed with zero events.
    pub timeout_count: u64,
    /// Times a registration call had to wait for the handler-table lock.
    pub lock_contention: u64,
    /// Per-event dispatch latency.
    pub latency: LatencyStats,
}

struct Counters {
    total_events_processed: AtomicU64,
    batch_events_processed: AtomicU64,
    error_count: AtomicU64,
    timeout_count: AtomicU64,
    lock_contention: AtomicU64,
    latency_min_ns: AtomicU64,
    latency_max_ns: AtomicU64,
    latency_sum_ns: AtomicU64,
    latency_count: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            total_events_processed: AtomicU64::new(0),
            batch_events_processed: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            lock_contention: AtomicU64::new(0),
            latency_min_ns: AtomicU64::new(u64::MAX),
            latency_max_ns: AtomicU64::new(0),
            latency_sum_ns: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }
}

impl Counters {
    fn record_latency(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;

        self.latency_min_ns.fetch_min(ns, Ordering::Relaxed);
        self.latency_max_ns.fetch_max(ns, Ordering::Relaxed);
        self.latency_sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EventLoopStats {
        let count = self.latency_count.load(Ordering::Relaxed).max(1);
        let sum = self.latency_sum_ns.load(Ordering::Relaxed);
        let min = self.latency_min_ns.load(Ordering::Relaxed);

        EventLoopStats {
            total_events_processed: self.total_events_processed.load(Ordering::Relaxed),
            batch_events_processed: self.batch_events_processed.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            latency: LatencyStats {
                min_ns: if min == u64::MAX { 0 } else { min },
                max_ns: self.latency_max_ns.load(Ordering::Relaxed),
                avg_ns: sum / count,
            },
        }
    }
}

/// Single-threaded readiness multiplexer. See module docs.
pub struct EventLoop {
    poll: Mutex<Poll>,
    waker: Waker,
    handlers: Mutex<HashMap<Token, EventHandler>>,
    stop_flag: AtomicBool,
    stopped_cond: Condvar,
    stopped_mutex: Mutex<bool>,
    batch_size: AtomicUsize,
    timeout_ms: AtomicU64,
    counters: Counters,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("batch_size", &self.batch_size.load(Ordering::Relaxed))
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl EventLoop {
    /// Creates a reactor with an event-batch ceiling of `max_events`.
    pub fn create(max_events: usize) -> Result<Self, EventLoopError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            poll: Mutex::new(poll),
            waker,
            handlers: Mutex::new(HashMap::new()),
            stop_flag: AtomicBool::new(false),
            stopped_cond: Condvar::new(),
            stopped_mutex: Mutex::new(false),
            batch_size: AtomicUsize::new(max_events.max(1)),
            timeout_ms: AtomicU64::new(0), // 0 == block indefinitely
            counters: Counters::default(),
        })
    }

    /// Caps events processed per wakeup.
    pub fn set_batch_size(&self, n: usize) {
        self.batch_size.store(n.max(1), Ordering::Relaxed);
    }

    /// Sets the multiplexer's blocking wait budget. `0` blocks indefinitely.
    pub fn set_timeout(&self, ms: u64) {
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    fn lock_handlers(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Token, EventHandler>>, EventLoopError> {
        match self.handlers.try_lock() {
            Ok(guard) => Ok(guard),
            Err(std::sync::TryLockError::WouldBlock) => {
                self.counters.lock_contention.fetch_add(1, Ordering::Relaxed);
                self.handlers.lock().map_err(|_| EventLoopError::LockFailure)
            }
            Err(std::sync::TryLockError::Poisoned(_)) => Err(EventLoopError::LockFailure),
        }
    }

    fn lock_poll(&self) -> Result<std::sync::MutexGuard<'_, Poll>, EventLoopError> {
        self.poll.lock().map_err(|_| EventLoopError::LockFailure)
    }

    /// Registers a new handler for `source`, keyed by `token`. Fails with
    /// [`EventLoopError::AlreadyRegistered`] if `token` is already known.
    pub fn add<S: Source>(
        &self,
        source: &mut S,
        token: Token,
        mask: Interest,
        read_cb: Option<Callback>,
        write_cb: Option<Callback>,
        arg: HandlerId,
    ) -> Result<(), EventLoopError> {
        let mut handlers = self.lock_handlers()?;
        if handlers.contains_key(&token) {
            return Err(EventLoopError::AlreadyRegistered);
        }

        self.lock_poll()?.registry().register(source, token, mask)?;

        handlers.insert(
            token,
            EventHandler {
                interest: mask,
                read_cb,
                write_cb,
                arg,
            },
        );
        Ok(())
    }

    /// Atomically replaces the interest mask and callbacks for `token`.
    pub fn modify<S: Source>(
        &self,
        source: &mut S,
        token: Token,
        mask: Interest,
        read_cb: Option<Callback>,
        write_cb: Option<Callback>,
        arg: HandlerId,
    ) -> Result<(), EventLoopError> {
        let mut handlers = self.lock_handlers()?;
        if !handlers.contains_key(&token) {
            return Err(EventLoopError::NotFound);
        }

        self.lock_poll()?.registry().reregister(source, token, mask)?;

        handlers.insert(
            token,
            EventHandler {
                interest: mask,
                read_cb,
                write_cb,
                arg,
            },
        );
        Ok(())
    }

    /// Deregisters `token`. Idempotent: deleting an unknown token returns
    /// [`EventLoopError::NotFound`] rather than panicking.
    pub fn delete<S: Source>(&self, source: &mut S, token: Token) -> Result<(), EventLoopError> {
        let mut handlers = self.lock_handlers()?;
        if handlers.remove(&token).is_none() {
            return Err(EventLoopError::NotFound);
        }

        self.lock_poll()?.registry().deregister(source)?;
        Ok(())
    }

    /// Whether [`EventLoop::stop`] has been observed.
    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Requests the loop to stop and wakes the multiplexer so `start`
    /// observes the flag promptly even if it is currently blocked.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Blocks the calling thread until [`EventLoop::stop`] has taken
    /// effect and `start` has returned on its own thread.
    pub fn wait(&self) {
        let mut stopped = match self.stopped_mutex.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("event loop stopped-mutex poisoned, giving up on wait");
                return;
            }
        };
        while !*stopped {
            stopped = match self.stopped_cond.wait(stopped) {
                Ok(guard) => guard,
                Err(_) => {
                    log::error!("event loop stopped-condvar poisoned, giving up on wait");
                    return;
                }
            };
        }
    }

    /// Returns a snapshot of the loop's counters.
    pub fn stats(&self) -> EventLoopStats {
        self.counters.snapshot()
    }

    /// Runs the reactor until [`EventLoop::stop`] is observed. A multiplexer
    /// error other than interruption bumps `error_count` and continues; an
    /// `EINTR`-equivalent wakeup counts as zero events and loops again.
    pub fn start(&self) {
        let batch_size = self.batch_size.load(Ordering::Relaxed);
        let mut events = Events::with_capacity(batch_size);

        while !self.is_stopped() {
            let timeout_ms = self.timeout_ms.load(Ordering::Relaxed);
            let timeout = if timeout_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(timeout_ms))
            };

            let mut poll = match self.poll.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log::error!("event loop poll mutex poisoned, stopping reactor");
                    return;
                }
            };
            let poll_result = poll.poll(&mut events, timeout);
            drop(poll);

            match poll_result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.counters.error_count.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            if events.is_empty() {
                self.counters.timeout_count.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut batch_count = 0u64;
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }

                let start = Instant::now();
                self.dispatch(token, event.is_readable(), event.is_writable());
                self.counters.record_latency(start.elapsed());
                batch_count += 1;
            }

            self.counters
                .total_events_processed
                .fetch_add(batch_count, Ordering::Relaxed);
            self.counters
                .batch_events_processed
                .store(batch_count, Ordering::Relaxed);
        }

        match self.stopped_mutex.lock() {
            Ok(mut stopped) => *stopped = true,
            Err(_) => log::error!("event loop stopped-mutex poisoned, skipping final notify"),
        }
        self.stopped_cond.notify_all();
    }

    /// Dispatches the read and/or write callback for `token`. Callback
    /// errors never unwind out of the loop; they are the caller's concern
    /// (typically: close the connection). At most one callback of each
    /// kind runs per event, so a single fd is never re-entered within one
    /// wakeup.
    fn dispatch(&self, token: Token, readable: bool, writable: bool) {
        let mut handlers = match self.lock_handlers() {
            Ok(guard) => guard,
            Err(_) => {
                log::error!("event loop handler table poisoned, dropping dispatch for {token:?}");
                return;
            }
        };
        let Some(handler) = handlers.get_mut(&token) else {
            return;
        };

        let arg = handler.arg;
        if readable && handler.interest.is_readable() {
            if let Some(cb) = handler.read_cb.as_mut() {
                let _ = cb(arg);
            }
        }
        if writable && handler.interest.is_writable() {
            if let Some(cb) = handler.write_cb.as_mut() {
                let _ = cb(arg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    fn bound_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn add_del_add_restores_interest_mask() {
        let loop_ = EventLoop::create(16).unwrap();
        let mut listener = bound_listener();
        let token = Token(1);

        loop_
            .add(&mut listener, token, Interest::READABLE, None, None, 1)
            .unwrap();
        loop_.delete(&mut listener, token).unwrap();
        loop_
            .add(&mut listener, token, Interest::READABLE, None, None, 1)
            .unwrap();
    }

    #[test]
    fn add_twice_fails_already_registered() {
        let loop_ = EventLoop::create(16).unwrap();
        let mut listener = bound_listener();
        let token = Token(1);

        loop_
            .add(&mut listener, token, Interest::READABLE, None, None, 1)
            .unwrap();
        let err = loop_
            .add(&mut listener, token, Interest::READABLE, None, None, 1)
            .unwrap_err();
        assert!(matches!(err, EventLoopError::AlreadyRegistered));
    }

    #[test]
    fn modify_upgrades_interest_mask() {
        let loop_ = EventLoop::create(16).unwrap();
        let mut listener = bound_listener();
        let token = Token(1);

        loop_
            .add(&mut listener, token, Interest::READABLE, None, None, 1)
            .unwrap();
        loop_
            .modify(&mut listener, token, Interest::READABLE | Interest::WRITABLE, None, None, 1)
            .unwrap();
    }

    #[test]
    fn modify_unknown_token_is_not_found() {
        let loop_ = EventLoop::create(16).unwrap();
        let mut listener = bound_listener();
        let err = loop_
            .modify(&mut listener, Token(42), Interest::WRITABLE, None, None, 1)
            .unwrap_err();
        assert!(matches!(err, EventLoopError::NotFound));
    }

    #[test]
    fn delete_unknown_token_is_not_found() {
        let loop_ = EventLoop::create(16).unwrap();
        let mut listener = bound_listener();
        let err = loop_.delete(&mut listener, Token(99)).unwrap_err();
        assert!(matches!(err, EventLoopError::NotFound));
    }

    #[test]
    fn stop_unblocks_start_and_wait() {
        let loop_ = Arc::new(EventLoop::create(16).unwrap());
        let hits = Arc::new(StdAtomicUsize::new(0));

        let loop_clone = loop_.clone();
        let hits_clone = hits.clone();
        let handle = std::thread::spawn(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            loop_clone.start();
        });

        // give the loop thread a moment to enter `poll`
        std::thread::sleep(Duration::from_millis(20));
        loop_.stop();
        loop_.wait();
        handle.join().unwrap();

        assert!(loop_.is_stopped());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
