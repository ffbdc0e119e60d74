use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mio::net::TcpStream as MioTcpStream;
use reactorcore::config::PoolConfig;
use reactorcore::pool::ConnectionPool;

fn cfg(max_connections: usize, max_idle: usize) -> PoolConfig {
    PoolConfig {
        max_connections,
        min_idle: 0,
        max_idle,
        idle_timeout: Duration::from_secs(3600),
        pool_cleanup_interval: Duration::from_secs(3600),
        enable_connection_reuse: true,
        memory_pool_size: 4096,
    }
}

/// Opens a real, connected socket pair and returns the accepted server
/// half (the one the pool takes ownership of) wrapped for non-blocking
/// registration.
fn accepted_pair() -> (MioTcpStream, SocketAddr) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = StdTcpStream::connect(addr).unwrap();
    let (server, remote) = listener.accept().unwrap();
    drop(client);
    server.set_nonblocking(true).unwrap();
    (MioTcpStream::from_std(server), remote)
}

fn bench_get_and_return(c: &mut Criterion) {
    for size in [16usize, 64, 256] {
        c.bench_with_input(BenchmarkId::new("get_then_return", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let pool = ConnectionPool::<MioTcpStream>::create(cfg(size, size)).unwrap();
                    let pairs: Vec<_> = (0..size).map(|_| accepted_pair()).collect();
                    (pool, pairs)
                },
                |(pool, pairs)| {
                    let mut keys = Vec::with_capacity(size);
                    for (stream, addr) in pairs {
                        keys.push(pool.get(black_box(stream), addr).unwrap());
                    }
                    for key in keys {
                        pool.return_connection(key).unwrap();
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
}

fn bench_reuse_lifo(c: &mut Criterion) {
    c.bench_function("reuse_lifo_single_slot", |b| {
        let pool = ConnectionPool::<MioTcpStream>::create(cfg(1, 1)).unwrap();

        b.iter_batched(
            accepted_pair,
            |(stream, addr)| {
                let key = pool.get(stream, addr).unwrap();
                pool.return_connection(key).unwrap();
                black_box(key);
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_cleanup_idle(c: &mut Criterion) {
    c.bench_function("cleanup_idle_empty_sweep", |b| {
        let pool = ConnectionPool::<MioTcpStream>::create(cfg(64, 64)).unwrap();
        b.iter(|| {
            black_box(pool.cleanup_idle().unwrap());
        });
    });
}

criterion_group!(benches, bench_get_and_return, bench_reuse_lifo, bench_cleanup_idle);
criterion_main!(benches);
