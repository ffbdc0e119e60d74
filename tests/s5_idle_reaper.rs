//! S5: the background reaper closes idle connections once they exceed
//! `idle_timeout`, leaving active ones untouched.

mod common;

use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use reactorcore::config::PoolConfig;
use reactorcore::pool::ConnectionPool;

fn cfg() -> PoolConfig {
    PoolConfig {
        max_connections: 10,
        min_idle: 0,
        max_idle: 10,
        idle_timeout: Duration::from_millis(50),
        pool_cleanup_interval: Duration::from_millis(100),
        enable_connection_reuse: true,
        memory_pool_size: 4096,
    }
}

#[test]
fn reaper_sweeps_expired_idle_connections_in_background() {
    let pool = ConnectionPool::<MioTcpStream>::create(cfg()).unwrap();

    let (s_idle, a_idle) = common::accepted_pair();
    let (s_active, a_active) = common::accepted_pair();
    let idle_key = pool.get(s_idle, a_idle).unwrap();
    let _active_key = pool.get(s_active, a_active).unwrap();
    pool.return_connection(idle_key).unwrap();

    // give the background reaper thread a couple of sweep cycles to observe and reap it
    std::thread::sleep(Duration::from_millis(700));

    let stats = pool.stats();
    assert_eq!(stats.idle_connections, 0, "expired idle connection should have been reaped");
    assert_eq!(stats.active_connections, 1, "the still-active connection is untouched");
}
