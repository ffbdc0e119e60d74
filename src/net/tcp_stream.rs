//! Abstraction over an accepted TCP stream, implemented for both
//! `mio::net::TcpStream` (non-blocking, registered with the reactor) and
//! `std::net::TcpStream` (used by tests that don't need non-blocking I/O).

use std::io::{Error, Result};
use std::net::{Shutdown, SocketAddr};

/// A connected stream abstracted over its concrete transport type.
pub trait TcpStream {
    /// Opens a new connection to `addr`.
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// The remote address of this connection.
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// The local address of this connection.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Shuts down the read, write, or both halves of the connection.
    fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Enables or disables Nagle's algorithm.
    fn set_nodelay(&self, nodelay: bool) -> Result<()>;

    /// Whether Nagle's algorithm is currently disabled.
    fn nodelay(&self) -> Result<bool>;

    /// Sets the IP time-to-live for this connection.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// The IP time-to-live currently set.
    fn ttl(&self) -> Result<u32>;

    /// Takes and clears any pending socket error.
    fn take_error(&self) -> Result<Option<Error>>;

    /// Reads from the socket without consuming the data.
    fn peek(&self, buf: &mut [u8]) -> Result<usize>;
}

impl TcpStream for mio::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}

impl TcpStream for std::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized,
    {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}
