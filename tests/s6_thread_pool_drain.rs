//! S6: shutting down the thread pool still runs every task that was
//! queued before the shutdown was requested.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reactorcore::thread_pool::ThreadPool;

#[test]
fn thread_pool_shutdown_drains_all_queued_tasks() {
    let mut pool = ThreadPool::create(4, 200).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let counter = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }

    pool.shutdown(false);
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}
