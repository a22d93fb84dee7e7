//! Bounded concurrency for request dispatch.
//!
//! The multi-threaded reference server (`srv_mt.rs` in the single-threaded predecessor
//! of this crate) ran a fixed number of OS threads pulling requests off a shared channel,
//! so a burst of inbound messages couldn't spawn unbounded work. `tokio::spawn` has no
//! such limit by itself, so [`WorkerPool`] wraps it with a semaphore sized to the same
//! effect: at most `capacity` request-dispatch tasks run at once per pool, extra work
//! queues on the semaphore instead of piling up as unbounded tasks.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinHandle};

pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// `capacity` mirrors the reference server's worker-thread count: the number of
    /// requests this pool will service concurrently.
    pub fn new(capacity: usize) -> Self {
        WorkerPool {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    /// Number of requests that may run concurrently right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` as soon as a slot is free, without blocking the caller.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits.acquire().await.expect("semaphore never closed");
            task.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn caps_concurrent_tasks_at_capacity() {
        let pool = Arc::new(WorkerPool::new(2));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(pool.spawn(async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn all_spawned_tasks_eventually_run() {
        let pool = Arc::new(WorkerPool::new(1));
        let ran = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let ran = ran.clone();
            handles.push(pool.spawn(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }
}
