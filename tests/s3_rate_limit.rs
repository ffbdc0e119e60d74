//! S3: the rate limiter's tumbling window resets after it elapses,
//! allowing a previously-denied IP through again.

use std::time::Duration;

use reactorcore::config::LimiterConfig;
use reactorcore::limiter::Limiter;

#[test]
fn rate_limit_window_resets() {
    let limiter = Limiter::new(LimiterConfig {
        max_connections_per_ip: 100,
        max_requests_per_second: 2,
        max_requests_burst: 100,
        window: 1,
        cleanup_interval: Duration::from_secs(60),
    });

    let ip = "198.51.100.9";
    assert!(limiter.check_rate_limit(ip).unwrap().is_allowed());
    assert!(limiter.check_rate_limit(ip).unwrap().is_allowed());
    assert!(!limiter.check_rate_limit(ip).unwrap().is_allowed(), "third request in the same window exceeds the per-second ceiling");

    std::thread::sleep(Duration::from_millis(1100));
    assert!(limiter.check_rate_limit(ip).unwrap().is_allowed(), "a new window resets the count");
}
