//! S1: a pool at `max_connections` rejects one more accept, then frees a
//! slot once a connection closes.

mod common;

use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use reactorcore::config::PoolConfig;
use reactorcore::error::PoolError;
use reactorcore::pool::ConnectionPool;

fn cfg(max_connections: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        min_idle: 0,
        max_idle: 0,
        idle_timeout: Duration::from_secs(60),
        pool_cleanup_interval: Duration::from_secs(3600),
        enable_connection_reuse: true,
        memory_pool_size: 4096,
    }
}

#[test]
fn accept_close_cycle_at_capacity_over_real_sockets() {
    let pool = ConnectionPool::<MioTcpStream>::create(cfg(2)).unwrap();

    let (s1, a1) = common::accepted_pair();
    let (s2, a2) = common::accepted_pair();
    let key1 = pool.get(s1, a1).unwrap();
    let _key2 = pool.get(s2, a2).unwrap();

    let (s3, a3) = common::accepted_pair();
    let err = pool.get(s3, a3).unwrap_err();
    assert!(matches!(err, PoolError::AtCapacity));

    pool.close(key1).unwrap();
    let (s4, a4) = common::accepted_pair();
    assert!(pool.get(s4, a4).is_ok(), "closing a connection frees a slot for the next accept");
}
