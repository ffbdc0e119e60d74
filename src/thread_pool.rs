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

//! A fixed-size pool of worker threads draining a bounded FIFO of tasks,
//! used by the event loop to off-load blocking work (file I/O, upstream
//! calls) without stalling the reactor.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, warn};

use crate::error::ThreadPoolError;

/// A unit of work: an owned closure run to completion by a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    queue_size: usize,
    not_empty: Condvar,
    shutdown: Mutex<bool>,
}

/// Fixed set of N threads draining a bounded FIFO of tasks. See module docs.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.workers.len())
            .field("queue_size", &self.shared.queue_size)
            .finish()
    }
}

impl ThreadPool {
    /// Spawns `thread_count` workers draining a queue bounded at
    /// `queue_size`. Returns [`ThreadPoolError::Invalid`] if `thread_count`
    /// is zero.
    pub fn create(thread_count: usize, queue_size: usize) -> Result<Self, ThreadPoolError> {
        if thread_count == 0 {
            return Err(ThreadPoolError::Invalid);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(queue_size)),
            queue_size,
            not_empty: Condvar::new(),
            shutdown: Mutex::new(false),
        });

        let workers = (0..thread_count)
            .map(|id| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("reactorcore-worker-{id}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn thread pool worker")
            })
            .collect();

        Ok(Self { shared, workers })
    }

    /// Enqueues `task`. FIFO, no priority: if task T1 is submitted before
    /// T2, T1 begins executing before T2 (start-ordering only).
    pub fn submit(&self, task: Task) -> Result<(), ThreadPoolError> {
        let shutdown = self
            .shared
            .shutdown
            .lock()
            .map_err(|_| ThreadPoolError::LockFailure)?;
        if *shutdown {
            return Err(ThreadPoolError::ShutDown);
        }
        drop(shutdown);

        let mut queue = self
            .shared
            .queue
            .lock()
            .map_err(|_| ThreadPoolError::LockFailure)?;
        if queue.len() >= self.shared.queue_size {
            return Err(ThreadPoolError::QueueFull);
        }

        queue.push_back(task);
        drop(queue);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Number of tasks currently queued, awaiting a worker.
    pub fn queue_len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .map(|q| q.len())
            .unwrap_or_default()
    }

    /// Sets the shutdown flag, wakes every waiting worker, and joins them
    /// all. Tasks already dequeued run to completion; anything still
    /// queued is discarded — there is no strict-drain mode. If `force` is
    /// set, a panic in one worker does not stop later workers from being
    /// joined.
    pub fn shutdown(&mut self, force: bool) {
        self.shutdown_in_place(force);
    }

    fn shutdown_in_place(&mut self, force: bool) {
        if let Ok(mut flag) = self.shared.shutdown.lock() {
            *flag = true;
        }
        self.shared.not_empty.notify_all();

        let mut first_panic = None;
        for handle in self.workers.drain(..) {
            if let Err(panic) = handle.join() {
                if force {
                    error!("thread pool worker panicked during shutdown");
                } else if first_panic.is_none() {
                    first_panic = Some(panic);
                }
            }
        }

        if let Some(panic) = first_panic {
            std::panic::resume_unwind(panic);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown_in_place(true);
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let mut queue = match shared.queue.lock() {
            Ok(q) => q,
            Err(_) => {
                error!("thread pool queue lock poisoned, worker exiting");
                return;
            }
        };

        loop {
            if let Some(task) = queue.pop_front() {
                drop(queue);
                task();
                break;
            }

            let shutting_down = shared.shutdown.lock().map(|g| *g).unwrap_or(true);
            if shutting_down {
                return;
            }

            queue = match shared.not_empty.wait(queue) {
                Ok(q) => q,
                Err(_) => {
                    warn!("thread pool condvar wait poisoned, worker exiting");
                    return;
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn create_with_zero_threads_is_invalid() {
        assert!(matches!(
            ThreadPool::create(0, 10),
            Err(ThreadPoolError::Invalid)
        ));
    }

    #[test]
    fn queue_full_then_succeeds_after_drain() {
        let mut pool = ThreadPool::create(1, 1).unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();

        let gate_clone = gate.clone();
        pool.submit(Box::new(move || {
            let _ = gate_clone.lock().unwrap();
        }))
        .unwrap();

        // give the sole worker a chance to dequeue task 1 and block on the gate
        thread::sleep(Duration::from_millis(50));

        pool.submit(Box::new(|| {})).unwrap();
        assert_eq!(
            pool.submit(Box::new(|| {})),
            Err(ThreadPoolError::QueueFull)
        );

        drop(held);
        thread::sleep(Duration::from_millis(50));
        assert!(pool.submit(Box::new(|| {})).is_ok());

        pool.shutdown(true);
    }

    #[test]
    fn enqueue_order_is_fifo_for_start() {
        let mut pool = ThreadPool::create(1, 100).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100u32 {
            let order = order.clone();
            pool.submit(Box::new(move || {
                order.lock().unwrap().push(i);
            }))
            .unwrap();
        }

        pool.shutdown(false);
        let order = order.lock().unwrap();
        let sorted: Vec<u32> = {
            let mut v = order.clone();
            v.sort_unstable();
            v
        };
        assert_eq!(*order, sorted);
    }

    #[test]
    fn shutdown_runs_all_queued_tasks() {
        let mut pool = ThreadPool::create(4, 200).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown(false);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let mut pool = ThreadPool::create(2, 10).unwrap();
        pool.shutdown(false);
        assert_eq!(
            pool.submit(Box::new(|| {})),
            Err(ThreadPoolError::ShutDown)
        );
    }
}
