//! # Background Workers
//!
//! A fixed pool of threads executing flush and reorganization jobs.
//! Jobs are closures pushed onto a condvar-guarded queue; shutdown
//! drains the queue, wakes every worker and joins them, so a dropped
//! database never leaves a reorganization half-scheduled.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let handles = (0..threads.max(1))
            .map(|index| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("merlindb-bg-{index}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("failed to spawn background worker")
            })
            .collect();

        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Queues a job. After shutdown the job runs inline on the caller,
    /// so late schedulers still make progress.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) {
        {
            let mut queue = self.inner.queue.lock();
            if !queue.shutdown {
                queue.jobs.push_back(Box::new(job));
                drop(queue);
                self.inner.available.notify_one();
                return;
            }
        }
        job();
    }

    /// Completes every queued job, then stops and joins the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.inner.available.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("background workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                inner.available.wait(&mut queue);
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_on_background_threads() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        pool.shutdown();
    }

    #[test]
    fn spawn_after_shutdown_runs_inline() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&counter);
        pool.spawn(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
