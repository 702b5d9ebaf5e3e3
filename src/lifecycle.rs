use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    algorithm::AlgorithmRegistry,
    artifact_store::ArtifactStore,
    backend::QueryBackend,
    config::LifecycleConfig,
    error::{JobError, Result},
    executor::Executor,
    metastore::Metastore,
    models::{Job, JobStatus},
    planner::QueryPlanner,
    pool::WorkerPool,
    queue::{spawn_purger, spawn_submitter, JobQueue},
    recovery,
    registry::{JobContext, JobRegistry},
    runner::QueryRunner,
};

/// Counts from one purge sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub persisted: usize,
    pub evicted: usize,
    pub expired: usize,
    pub errors: usize,
}

struct Inner {
    config: LifecycleConfig,
    registry: Arc<JobRegistry>,
    metastore: Arc<dyn Metastore>,
    backend: Arc<dyn QueryBackend>,
    executor: Arc<Executor>,
    pool: Arc<WorkerPool>,
    queue_tx: JobQueue,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<JobContext>>>>,
    shutdown: broadcast::Sender<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Entry point of the orchestration core: owns the registry, the queue, the
/// worker pool and the two background loops. Call [`JobLifecycle::stop`] to
/// release the background loops and the pool.
#[derive(Clone)]
pub struct JobLifecycle {
    inner: Arc<Inner>,
}

impl JobLifecycle {
    pub fn new(
        config: LifecycleConfig,
        metastore: Arc<dyn Metastore>,
        backend: Arc<dyn QueryBackend>,
        planner: Arc<dyn QueryPlanner>,
        algorithms: AlgorithmRegistry,
        artifacts: ArtifactStore,
    ) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(&config)?);
        let registry = Arc::new(JobRegistry::new(Arc::clone(&metastore)));
        let runner = QueryRunner::new(Arc::clone(&backend), config.poll_interval);
        let executor = Arc::new(Executor::new(
            Arc::clone(&registry),
            Arc::clone(&metastore),
            runner,
            planner,
            algorithms,
            artifacts,
        ));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                metastore,
                backend,
                executor,
                pool,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                shutdown,
                loops: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn metastore(&self) -> &Arc<dyn Metastore> {
        &self.inner.metastore
    }

    /// Loads unfinished jobs from the metastore and queues them. Returns how many were queued.
    pub async fn init(&self) -> usize {
        recovery::recover(
            &self.inner.registry,
            self.inner.metastore.as_ref(),
            &self.inner.queue_tx,
        )
        .await
    }

    pub async fn start(&self) -> Result<()> {
        let Some(queue_rx) = self.inner.queue_rx.lock().await.take() else {
            return Err(JobError::Validation("job lifecycle already started".to_string()));
        };

        let submitter = spawn_submitter(
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.executor),
            queue_rx,
            self.inner.shutdown.subscribe(),
        );
        let purger = spawn_purger(
            self.clone(),
            self.inner.config.purge_interval,
            self.inner.shutdown.subscribe(),
        );
        self.inner.loops.lock().await.extend([submitter, purger]);

        info!(
            min_workers = self.inner.config.min_workers,
            max_workers = self.inner.config.max_workers,
            "Job lifecycle started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.inner.shutdown.send(());
        let loops = std::mem::take(&mut *self.inner.loops.lock().await);
        for task in loops {
            if let Err(err) = task.await {
                warn!("Background loop ended abnormally: {err}");
            }
        }
        self.inner.pool.shutdown();
        info!("Job lifecycle stopped");
    }

    /// Registers a job and queues it for execution.
    pub async fn submit(&self, job: Job) -> Result<Arc<JobContext>> {
        job.validate()?;
        let ctx = self.inner.registry.add(job).await?;
        if self.inner.queue_tx.send(Arc::clone(&ctx)).is_err() {
            self.inner.registry.remove(ctx.id()).await;
            return Err(JobError::QueueClosed(format!("job {} was not queued", ctx.id())));
        }
        info!(job_id = %ctx.id(), kind = %ctx.job_type(), session = %ctx.session(), "Job submitted");
        Ok(ctx)
    }

    /// Last known state of a job: the in-memory copy if it is still cached, otherwise the stored one.
    pub async fn job(&self, id: &str) -> Result<Job> {
        match self.inner.registry.snapshot(id).await {
            Ok(job) => Ok(job),
            Err(JobError::NotFound(_)) => self
                .inner
                .metastore
                .get_job(id)
                .await?
                .ok_or_else(|| JobError::NotFound(id.to_string())),
            Err(err) => Err(err),
        }
    }

    pub async fn update_status(&self, id: &str, next: JobStatus) -> Result<bool> {
        self.inner.registry.update_status(id, next).await
    }

    /// Marks the job cancelled and asks the backend to stop its running query.
    /// Returns `false` when the job is unknown or already finished.
    pub async fn cancel(&self, id: &str) -> bool {
        let Ok(ctx) = self.inner.registry.get(id).await else {
            debug!(job_id = %id, "Cancel requested for unknown job");
            return false;
        };

        match self.inner.registry.transition(&ctx, JobStatus::Cancelled).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => warn!(job_id = %id, "Cancelled job but failed persisting it: {err:#}"),
        }

        if let Some(handle) = ctx.current_query().await {
            match self.inner.backend.cancel(ctx.session(), &handle).await {
                Ok(true) => info!(job_id = %id, query_handle = %handle, "Backend query cancelled"),
                Ok(false) => warn!(job_id = %id, query_handle = %handle, "Backend refused to cancel query"),
                Err(err) => warn!(job_id = %id, query_handle = %handle, "Failed cancelling backend query: {err:#}"),
            }
        }
        true
    }

    /// One sweep of the purge loop, evaluated against `now`.
    pub async fn purge_once(&self, now: DateTime<Utc>) -> PurgeReport {
        let mut report = PurgeReport::default();
        for ctx in self.inner.registry.contexts().await {
            let job = ctx.snapshot().await;
            match job.finish_time {
                Some(finished) if job.is_finished() => {
                    if age(now, finished) <= self.inner.config.job_cache_lifetime {
                        continue;
                    }
                    match self.inner.registry.persist(&ctx).await {
                        Ok(()) => {
                            report.persisted += 1;
                            if self.inner.registry.remove(ctx.id()).await.is_some() {
                                report.evicted += 1;
                                debug!(job_id = %ctx.id(), "Evicted finished job from memory");
                            }
                        }
                        Err(err) => {
                            report.errors += 1;
                            warn!(job_id = %ctx.id(), "Failed persisting finished job, keeping it cached: {err:#}");
                        }
                    }
                }
                _ => {
                    if age(now, job.start_time) <= self.inner.config.max_job_lifetime {
                        continue;
                    }
                    match self.expire(&ctx).await {
                        Ok(true) => report.expired += 1,
                        Ok(false) => {}
                        Err(err) => {
                            report.errors += 1;
                            warn!(job_id = %ctx.id(), "Failed persisting expired job: {err:#}");
                        }
                    }
                }
            }
        }
        report
    }

    async fn expire(&self, ctx: &JobContext) -> Result<bool> {
        warn!(
            job_id = %ctx.id(),
            max_lifetime_secs = self.inner.config.max_job_lifetime.as_secs(),
            "Job exceeded its maximum lifetime"
        );
        if ctx.abort_execution().await {
            debug!(job_id = %ctx.id(), "Aborted job execution");
        }
        if let Some(handle) = ctx.current_query().await {
            if let Err(err) = self.inner.backend.cancel(ctx.session(), &handle).await {
                warn!(job_id = %ctx.id(), query_handle = %handle, "Failed cancelling query of expired job: {err:#}");
            }
        }
        self.inner.registry.transition(ctx, JobStatus::Failed).await
    }
}

fn age(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or_default()
}
