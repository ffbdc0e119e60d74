//! Shared socket-pair helper for integration tests. `mio::net::TcpStream`
//! doesn't implement `Clone`, so each test that needs a connected pair
//! opens a fresh loopback listener rather than reusing one.

use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};

use mio::net::TcpStream as MioTcpStream;

pub fn accepted_pair() -> (MioTcpStream, SocketAddr) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = StdTcpStream::connect(addr).unwrap();
    let (server, remote) = listener.accept().unwrap();
    drop(client);
    server.set_nonblocking(true).unwrap();
    (MioTcpStream::from_std(server), remote)
}
