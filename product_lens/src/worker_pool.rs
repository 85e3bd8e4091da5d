// THEORY:
// Decoding, resizing, cropping and JPEG encoding are pure CPU work. Run inline on
// an async worker thread they would stall every other request multiplexed onto
// that thread, so the pipeline hands them to tokio's blocking pool instead.
//
// The blocking pool itself is large (hundreds of threads) and image buffers are
// the dominant memory cost, so `CpuPool` puts a semaphore in front of it: at most
// `size` image jobs run at once, and the rest wait asynchronously for a permit.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::PipelineError;

#[derive(Clone)]
pub struct CpuPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl CpuPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// One slot per logical core.
    pub fn with_available_cores() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `job` on the blocking pool once a slot is free.
    pub async fn run<T, F>(&self, job: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Worker("image worker pool is closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| PipelineError::Worker(format!("image task did not complete: {err}")))?
    }
}

impl Default for CpuPool {
    fn default() -> Self {
        Self::with_available_cores()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn returns_job_result() {
        let pool = CpuPool::new(2);
        let value = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn propagates_job_error() {
        let pool = CpuPool::new(1);
        let err = pool
            .run(|| Err::<(), _>(PipelineError::Decode("bad".into())))
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Decode("bad".into()));
    }

    #[tokio::test]
    async fn panicking_job_becomes_worker_error() {
        let pool = CpuPool::new(1);
        let err = pool.run::<(), _>(|| panic!("decoder exploded")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Worker(_)));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_size() {
        let pool = CpuPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        });
        for result in futures::future::join_all(jobs).await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.size(), 2);
    }
}
