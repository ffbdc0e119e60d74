use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fake::faker::internet::en::IPv4;
use fake::Fake;
use reactorcore::config::LimiterConfig;
use reactorcore::limiter::Limiter;

fn cfg() -> LimiterConfig {
    LimiterConfig {
        max_connections_per_ip: 1_000_000,
        max_requests_per_second: 1_000_000,
        max_requests_burst: 1_000_000,
        window: 1,
        cleanup_interval: Duration::from_secs(3600),
    }
}

fn bench_connection_limit_same_ip(c: &mut Criterion) {
    c.bench_function("check_connection_limit_same_ip", |b| {
        let limiter = Limiter::new(cfg());
        b.iter(|| {
            black_box(limiter.check_connection_limit("203.0.113.7").unwrap());
        });
    });
}

fn bench_connection_limit_distinct_ips(c: &mut Criterion) {
    for n in [64usize, 1024, 16384] {
        c.bench_with_input(BenchmarkId::new("check_connection_limit_distinct_ips", n), &n, |b, &n| {
            let limiter = Limiter::new(cfg());
            let ips: Vec<String> = (0..n).map(|_| IPv4().fake()).collect();
            b.iter(|| {
                for ip in &ips {
                    black_box(limiter.check_connection_limit(ip).unwrap());
                }
            });
        });
    }
}

fn bench_rate_limit_same_ip(c: &mut Criterion) {
    c.bench_function("check_rate_limit_same_ip", |b| {
        let limiter = Limiter::new(cfg());
        b.iter(|| {
            black_box(limiter.check_rate_limit("203.0.113.7").unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_connection_limit_same_ip,
    bench_connection_limit_distinct_ips,
    bench_rate_limit_same_ip
);
criterion_main!(benches);
