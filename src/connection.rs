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

//! The per-connection state machine owned exclusively by
//! [`crate::pool::ConnectionPool`].
//!
//! A `Connection` never points back to its pool. Event-loop callbacks are
//! handed the connection's [`crate::event_loop::HandlerId`] (its slab index)
//! and look it up through the pool on each dispatch, per the cyclic-ownership
//! note in the design notes — this is what lets the pool close a connection
//! while a pool lock is held without re-entering through the connection.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::Token;

use crate::buffer::Buffer;
use crate::net::tcp_stream::TcpStream;

/// Where a connection sits in its read/write/keep-alive lifecycle.
///
/// `idle → active → reading → writing → closing → closed`, or, on
/// keep-alive, `writing → idle` when the connection is returned to the
/// pool instead of torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sitting in the pool's idle array, not bound to live request work.
    Idle,
    /// Bound to a fd and registered with the event loop, awaiting the
    /// first read event.
    Active,
    /// Currently inside a read callback.
    Reading,
    /// Currently inside a write callback.
    Writing,
    /// Shutdown initiated; draining before removal.
    Closing,
    /// Torn down. Never present in either pool array.
    Closed,
}

/// A single accepted connection: its transport, buffers, and bookkeeping.
///
/// Generic over the transport so tests can substitute a fake stream; the
/// worker instantiates this over `mio::net::TcpStream`.
pub struct Connection<S>
where
    S: TcpStream + Read + Write + Source,
{
    stream: S,
    token: Token,
    remote_addr: SocketAddr,
    state: ConnectionState,
    created_at: Instant,
    last_activity: Instant,
    /// Set when the connection enters [`ConnectionState::Idle`]; cleared on
    /// reuse. This is the field the source never stored — see module docs
    /// on [`crate::pool`] for why `cleanup_idle` needs it.
    idle_since: Option<Instant>,
    request_count: u64,
    bytes_read: u64,
    bytes_written: u64,
    read_buf: Buffer,
    write_buf: Buffer,
    memory_pool_size: usize,
}

impl<S> std::fmt::Debug for Connection<S>
where
    S: TcpStream + Read + Write + Source,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("request_count", &self.request_count)
            .finish_non_exhaustive()
    }
}

impl<S> Connection<S>
where
    S: TcpStream + Read + Write + Source,
{
    /// Builds a freshly accepted connection bound directly to `token`,
    /// starting in [`ConnectionState::Active`] — it was never idle.
    pub fn new(stream: S, token: Token, remote_addr: SocketAddr, memory_pool_size: usize) -> Self {
        let now = Instant::now();
        Self {
            stream,
            token,
            remote_addr,
            state: ConnectionState::Active,
            created_at: now,
            last_activity: now,
            idle_since: None,
            request_count: 0,
            bytes_read: 0,
            bytes_written: 0,
            read_buf: Buffer::new(memory_pool_size),
            write_buf: Buffer::new(memory_pool_size),
            memory_pool_size,
        }
    }

    /// Rebinds an idle, pooled connection to a newly accepted `stream`,
    /// `token`, and `remote_addr`, discarding whatever the previous
    /// occupant left in the buffers. Only valid from
    /// [`ConnectionState::Idle`].
    pub fn reuse(&mut self, stream: S, token: Token, remote_addr: SocketAddr) {
        debug_assert_eq!(self.state, ConnectionState::Idle);
        self.stream = stream;
        self.token = token;
        self.remote_addr = remote_addr;
        self.state = ConnectionState::Active;
        self.created_at = Instant::now();
        self.last_activity = self.created_at;
        self.idle_since = None;
        self.request_count = 0;
        self.bytes_read = 0;
        self.bytes_written = 0;
        // Explicit reset: the previous occupant's bytes must not leak into
        // the next request. Replacing rather than clearing also drops any
        // capacity grown far beyond `memory_pool_size`.
        self.read_buf = Buffer::new(self.memory_pool_size);
        self.write_buf = Buffer::new(self.memory_pool_size);
    }

    /// The event-loop token / pool slab key this connection is currently
    /// registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The peer address of the current binding.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current FSM state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// `true` once the connection has reached [`ConnectionState::Closed`].
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// How long this connection has sat in the idle array, if it is
    /// currently idle.
    pub fn idle_duration(&self) -> Option<Duration> {
        self.idle_since.map(|since| since.elapsed())
    }

    /// Wall-clock age since this binding was created or last reused.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last read or write activity.
    pub fn idle_time_since_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Total requests served across the lifetime of this binding.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Cumulative bytes read/written across this binding.
    pub fn byte_counts(&self) -> (u64, u64) {
        (self.bytes_read, self.bytes_written)
    }

    /// Enters [`ConnectionState::Reading`] and reads from the transport
    /// into the connection's read buffer, tracking bytes read.
    pub fn read_into_buffer(&mut self) -> std::io::Result<usize> {
        self.state = ConnectionState::Reading;
        self.last_activity = Instant::now();

        if self.read_buf.remaining_mut() < 4096 {
            self.read_buf.reserve(4096);
        }
        let n = self.stream.read(&mut self.read_buf)?;
        self.read_buf.mark_written(n);
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// The bytes currently sitting in the read buffer, most recent
    /// [`Connection::read_into_buffer`] call included. The caller consumes
    /// them with [`Connection::consume_read_buffer`] once it knows how
    /// much it actually used.
    pub fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    /// Advances the read buffer past `amount` consumed bytes, compacting
    /// it once fully drained.
    pub fn consume_read_buffer(&mut self, amount: usize) {
        self.read_buf.mark_read(amount);
    }

    /// Queues `data` in the connection's write buffer, to be drained by
    /// [`Connection::flush_write_buffer`]. Non-blocking writers may queue
    /// more than a single `write(2)` call can accept.
    pub fn queue_write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_buf.write_all(data)
    }

    /// Enters [`ConnectionState::Writing`] and drains as much of the
    /// queued write buffer to the transport as it will accept in one
    /// call, tracking bytes written. Returns the number of bytes flushed;
    /// `0` with data still queued means the socket would block.
    pub fn flush_write_buffer(&mut self) -> std::io::Result<usize> {
        self.state = ConnectionState::Writing;
        self.last_activity = Instant::now();

        if self.write_buf.remaining() == 0 {
            return Ok(0);
        }
        let data: &[u8] = &self.write_buf;
        match self.stream.write(data) {
            Ok(n) => {
                self.write_buf.mark_read(n);
                self.bytes_written += n as u64;
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// `true` if [`Connection::queue_write`]'d data is still waiting to be
    /// flushed. Callers use this to decide whether to escalate interest to
    /// [`mio::Interest::WRITABLE`] after a non-blocking write stalls.
    pub fn has_pending_write(&self) -> bool {
        self.write_buf.remaining() > 0
    }

    /// Marks one request complete and, for keep-alive, returns the
    /// connection to [`ConnectionState::Idle`] (stamping `idle_since`)
    /// rather than closing it. The pool is responsible for actually
    /// moving the connection between arrays; this only updates the FSM.
    pub fn finish_request(&mut self, keep_alive: bool) {
        self.request_count += 1;
        if keep_alive {
            self.state = ConnectionState::Idle;
            self.idle_since = Some(Instant::now());
        } else {
            self.state = ConnectionState::Closing;
        }
    }

    /// Enters [`ConnectionState::Closing`], ahead of the pool tearing the
    /// connection down.
    pub fn begin_closing(&mut self) {
        self.state = ConnectionState::Closing;
    }

    /// Enters [`ConnectionState::Closed`] and shuts down the transport.
    /// Idempotent: calling it on an already-closed connection is a no-op.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.state = ConnectionState::Closed;
    }

    /// Registers this connection's transport with `event_loop` for
    /// read-readiness (and optionally write-readiness).
    pub fn register(
        &mut self,
        event_loop: &crate::event_loop::EventLoop,
        mask: mio::Interest,
        read_cb: Option<crate::event_loop::Callback>,
        write_cb: Option<crate::event_loop::Callback>,
    ) -> Result<(), crate::error::EventLoopError> {
        let handler_id = self.token.0;
        event_loop.add(&mut self.stream, self.token, mask, read_cb, write_cb, handler_id)
    }

    /// Deregisters this connection's transport from `event_loop`.
    pub fn deregister(
        &mut self,
        event_loop: &crate::event_loop::EventLoop,
    ) -> Result<(), crate::error::EventLoopError> {
        event_loop.delete(&mut self.stream, self.token)
    }

    /// Changes this connection's registered interest mask and/or
    /// callbacks without deregistering. Used to escalate to
    /// [`mio::Interest::WRITABLE`] once a queued write stalls on
    /// `WouldBlock`, and to drop back to read-only once it drains.
    pub fn modify(
        &mut self,
        event_loop: &crate::event_loop::EventLoop,
        mask: mio::Interest,
        read_cb: Option<crate::event_loop::Callback>,
        write_cb: Option<crate::event_loop::Callback>,
    ) -> Result<(), crate::error::EventLoopError> {
        let handler_id = self.token.0;
        event_loop.modify(&mut self.stream, self.token, mask, read_cb, write_cb, handler_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Read as _, Write as _};
    use std::net::Shutdown;

    #[derive(Debug, Default)]
    struct FakeStream {
        inbound: Vec<u8>,
        outbound: Vec<u8>,
        read_pos: usize,
        block_writes: bool,
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let remaining = &self.inbound[self.read_pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_writes {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl TcpStream for FakeStream {
        fn connect(_addr: SocketAddr) -> io::Result<Self> {
            Ok(Self::default())
        }
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
        fn shutdown(&self, _how: Shutdown) -> io::Result<()> {
            Ok(())
        }
        fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
            Ok(())
        }
        fn nodelay(&self) -> io::Result<bool> {
            Ok(true)
        }
        fn set_ttl(&self, _ttl: u32) -> io::Result<()> {
            Ok(())
        }
        fn ttl(&self) -> io::Result<u32> {
            Ok(64)
        }
        fn take_error(&self) -> io::Result<Option<io::Error>> {
            Ok(None)
        }
        fn peek(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Source for FakeStream {
        fn register(
            &mut self,
            _registry: &mio::Registry,
            _token: Token,
            _interests: mio::Interest,
        ) -> io::Result<()> {
            Ok(())
        }
        fn reregister(
            &mut self,
            _registry: &mio::Registry,
            _token: Token,
            _interests: mio::Interest,
        ) -> io::Result<()> {
            Ok(())
        }
        fn deregister(&mut self, _registry: &mio::Registry) -> io::Result<()> {
            Ok(())
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn new_connection_starts_active_never_idle() {
        let conn = Connection::new(FakeStream::default(), Token(1), addr(), 64);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.idle_duration().is_none());
    }

    #[test]
    fn finish_request_keep_alive_goes_idle_and_stamps_idle_since() {
        let mut conn = Connection::new(FakeStream::default(), Token(1), addr(), 64);
        conn.finish_request(true);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.idle_duration().is_some());
    }

    #[test]
    fn finish_request_no_keep_alive_goes_closing() {
        let mut conn = Connection::new(FakeStream::default(), Token(1), addr(), 64);
        conn.finish_request(false);
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn close_is_idempotent() {
        let mut conn = Connection::new(FakeStream::default(), Token(1), addr(), 64);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
    }

    #[test]
    fn reuse_resets_buffers_and_counters() {
        let mut conn = Connection::new(FakeStream::default(), Token(1), addr(), 64);
        conn.read_into_buffer().unwrap();
        conn.request_count = 3;
        conn.finish_request(true);

        let new_addr: SocketAddr = "10.0.0.5:4321".parse().unwrap();
        conn.reuse(FakeStream::default(), Token(2), new_addr);

        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.remote_addr(), new_addr);
        assert_eq!(conn.request_count(), 0);
        assert_eq!(conn.byte_counts(), (0, 0));
        assert!(conn.idle_duration().is_none());
    }

    #[test]
    fn read_and_write_track_byte_counts() {
        let mut stream = FakeStream::default();
        stream.inbound = b"hello".to_vec();
        let mut conn = Connection::new(stream, Token(1), addr(), 64);

        let n = conn.read_into_buffer().unwrap();
        assert_eq!(n, 5);
        assert_eq!(conn.state(), ConnectionState::Reading);

        conn.queue_write(b"world").unwrap();
        let written = conn.flush_write_buffer().unwrap();
        assert_eq!(written, 5);
        assert_eq!(conn.byte_counts(), (5, 5));
    }

    #[test]
    fn flush_on_would_block_reports_zero_and_keeps_data_queued() {
        let mut stream = FakeStream::default();
        stream.block_writes = true;
        let mut conn = Connection::new(stream, Token(1), addr(), 64);

        conn.queue_write(b"world").unwrap();
        let written = conn.flush_write_buffer().unwrap();
        assert_eq!(written, 0);
        assert!(conn.has_pending_write());
        assert_eq!(conn.byte_counts(), (0, 0));
    }
}
