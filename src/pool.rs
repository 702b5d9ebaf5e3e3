use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    sync::Semaphore,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::LifecycleConfig,
    error::{JobError, Result},
};

const WORKER_THREAD_PREFIX: &str = "ml-job-worker-";

/// Cancellable handle to one job's execution slot.
#[derive(Debug)]
pub struct JobHandle {
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Bounded pool running job executors on a dedicated runtime.
///
/// `max_workers` permits cap how many jobs run at once; anything beyond that waits
/// for a permit instead of being rejected. Blocking work (model training) runs on
/// at most `max_workers` blocking threads that retire after `worker_keep_alive`;
/// executors reach them through `tokio::task::spawn_blocking` from inside the pool.
pub struct WorkerPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    slots: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(config: &LifecycleConfig) -> Result<Self> {
        if config.max_workers == 0 || config.min_workers > config.max_workers {
            return Err(JobError::Validation(format!(
                "worker pool bounds are invalid: min={} max={}",
                config.min_workers, config.max_workers
            )));
        }

        let thread_id = Arc::new(AtomicUsize::new(0));
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.min_workers.max(1))
            .max_blocking_threads(config.max_workers)
            .thread_keep_alive(config.worker_keep_alive)
            .thread_name_fn(move || {
                let id = thread_id.fetch_add(1, Ordering::SeqCst) + 1;
                format!("{WORKER_THREAD_PREFIX}{id}")
            })
            .enable_all()
            .build()?;

        debug!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            keep_alive_ms = config.worker_keep_alive.as_millis() as u64,
            "Worker pool started"
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            slots: Arc::new(Semaphore::new(config.max_workers)),
            max_workers: config.max_workers,
        })
    }

    pub fn spawn<F>(&self, job_id: &str, task: F) -> JobHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let job_id = job_id.to_string();
        let task = self.handle.spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                warn!(job_id = %job_id, "Worker pool closed before job could start");
                return;
            };
            task.await;
        });
        JobHandle { task }
    }

    pub fn active_jobs(&self) -> usize {
        self.max_workers - self.slots.available_permits()
    }

    pub fn shutdown(&self) {
        self.slots.close();
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            info!("Worker pool shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn config(max_workers: usize) -> LifecycleConfig {
        LifecycleConfig {
            min_workers: 1,
            max_workers,
            ..LifecycleConfig::default()
        }
    }

    #[test]
    fn rejects_inverted_bounds() {
        let bad = LifecycleConfig {
            min_workers: 4,
            max_workers: 2,
            ..LifecycleConfig::default()
        };
        assert!(matches!(WorkerPool::new(&bad), Err(JobError::Validation(_))));
    }

    #[tokio::test]
    async fn excess_jobs_wait_for_a_slot() {
        let pool = WorkerPool::new(&config(1)).expect("pool");
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (second_tx, mut second_rx) = oneshot::channel::<()>();

        let first = pool.spawn("first", async move {
            let _ = release_rx.await;
        });
        let second = pool.spawn("second", async move {
            let _ = second_tx.send(());
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second_rx.try_recv().is_err(), "second job ran before a slot freed up");
        assert_eq!(pool.active_jobs(), 1);

        release_tx.send(()).expect("release first");
        tokio::time::timeout(Duration::from_secs(2), second_rx)
            .await
            .expect("second job started")
            .expect("second job signalled");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first.is_finished());
        assert!(second.is_finished());
    }

    #[tokio::test]
    async fn abort_stops_a_running_job() {
        let pool = WorkerPool::new(&config(2)).expect("pool");
        let handle = pool.spawn("stuck", async {
            tokio::time::sleep(Duration::from_secs(600)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}
