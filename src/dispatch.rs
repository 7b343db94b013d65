//! Bounded worker pool for the asynchronous entry points.
//!
//! Jobs run on tokio's blocking pool, capped at `workers` threads. A
//! semaphore bounds running plus queued jobs to `workers + queue_depth`;
//! once it is exhausted [`Dispatcher::submit`] fails with
//! [`Error::QueueFull`] instead of queueing more work.
//!
//! Jobs submitted independently may complete in any order. Callers that need
//! ordering must wait on one [`TaskHandle`] before submitting the next job.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::Error;

pub struct Dispatcher {
    runtime: Runtime,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("capacity", &self.capacity)
            .field("available", &self.slots.available_permits())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Result<Self, Error> {
        let workers = config.workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("accel-dispatch")
            .build()?;
        let capacity = workers + config.queue_depth;
        Ok(Self {
            runtime,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Jobs that may be running or waiting at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue `job`. It receives the task's cancellation token so long jobs
    /// can stop early; a job cancelled before it starts never runs.
    pub fn submit<T, F>(&self, job: F) -> Result<TaskHandle<T>, Error>
    where
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| Error::QueueFull)?;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn_blocking(move || {
            let _permit = permit;
            if task_token.is_cancelled() {
                return;
            }
            let _ = tx.send(job(&task_token));
        });
        Ok(TaskHandle { rx, token })
    }
}

/// Result slot of one submitted job.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<T>,
    token: CancellationToken,
}

impl<T> TaskHandle<T> {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Block the calling thread until the job finishes. Must not be called
    /// from inside an async context.
    pub fn wait(self) -> Result<T, Error> {
        self.rx.blocking_recv().map_err(|_| Error::Cancelled)
    }

    /// Async counterpart of [`wait`](Self::wait).
    pub async fn join(self) -> Result<T, Error> {
        self.rx.await.map_err(|_| Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool(workers: usize, queue_depth: usize) -> Dispatcher {
        Dispatcher::new(DispatchConfig {
            workers,
            queue_depth,
        })
        .unwrap()
    }

    #[test]
    fn runs_jobs() {
        let d = pool(2, 4);
        assert_eq!(d.capacity(), 6);
        let handles: Vec<_> = (0..5).map(|i| d.submit(move |_| i * 2).unwrap()).collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn full_queue_rejects() {
        let d = pool(1, 0);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = d
            .submit(move |_| {
                release_rx.recv().ok();
                1
            })
            .unwrap();
        assert!(matches!(d.submit(|_| 2), Err(Error::QueueFull)));
        release_tx.send(()).unwrap();
        assert_eq!(first.wait().unwrap(), 1);
    }

    #[test]
    fn cancelled_before_start_never_runs() {
        let d = pool(1, 1);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = d
            .submit(move |_| {
                started_tx.send(()).ok();
                release_rx.recv().ok();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (ran_tx, ran_rx) = mpsc::channel::<()>();
        let second = d
            .submit(move |_| {
                ran_tx.send(()).ok();
            })
            .unwrap();
        second.cancel();
        release_tx.send(()).unwrap();

        first.wait().unwrap();
        assert!(matches!(second.wait(), Err(Error::Cancelled)));
        assert!(ran_rx.try_recv().is_err());
    }

    #[test]
    fn running_job_sees_cancellation() {
        let d = pool(1, 0);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let handle = d
            .submit(move |token: &CancellationToken| {
                started_tx.send(()).ok();
                let mut spins = 0u32;
                while !token.is_cancelled() && spins < 500 {
                    std::thread::sleep(Duration::from_millis(10));
                    spins += 1;
                }
                token.is_cancelled()
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.cancel();
        assert!(handle.wait().unwrap());
    }
}
