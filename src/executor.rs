//! Fixed-capacity task submission: a counting semaphore caps in-flight work
//! independent of how fast the queue fills, so a burst of slow handlers
//! cannot grow memory without bound.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl BoundedExecutor {
    pub fn new(parallelism: usize) -> Self {
        BoundedExecutor {
            semaphore: Arc::new(Semaphore::new(parallelism)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Submit a task, blocking until a permit is available. The permit is
    /// released when the task finishes, success or failure.
    pub async fn submit<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed.
            Err(_) => unreachable!("executor semaphore closed"),
        };
        let guard = InFlightGuard::enter(Arc::clone(&self.in_flight));

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            task.await
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the counter even when the task panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
