//! S2: connections returned to the pool are handed back out
//! most-recently-returned-first.

mod common;

use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use reactorcore::config::PoolConfig;
use reactorcore::pool::ConnectionPool;

fn cfg() -> PoolConfig {
    PoolConfig {
        max_connections: 10,
        min_idle: 0,
        max_idle: 4,
        idle_timeout: Duration::from_secs(60),
        pool_cleanup_interval: Duration::from_secs(3600),
        enable_connection_reuse: true,
        memory_pool_size: 4096,
    }
}

#[test]
fn keepalive_reuse_is_lifo_over_real_sockets() {
    let pool = ConnectionPool::<MioTcpStream>::create(cfg()).unwrap();

    let (sa, aa) = common::accepted_pair();
    let (sb, ab) = common::accepted_pair();
    let (sc, ac) = common::accepted_pair();
    let a = pool.get(sa, aa).unwrap();
    let b = pool.get(sb, ab).unwrap();
    let c = pool.get(sc, ac).unwrap();

    pool.return_connection(a).unwrap();
    pool.return_connection(b).unwrap();
    pool.return_connection(c).unwrap();

    let (s, addr) = common::accepted_pair();
    let reused = pool.get(s, addr).unwrap();
    assert_eq!(reused, c);
    assert_eq!(pool.stats().reused_connections, 1);
}
