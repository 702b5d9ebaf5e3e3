use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    backend::QueryHandle,
    error::{JobError, Result},
    metastore::Metastore,
    models::{Job, JobKind, JobStatus, JobType, SessionHandle},
    pool::JobHandle,
};

/// A registered job plus the handles needed to interrupt it.
#[derive(Debug)]
pub struct JobContext {
    id: String,
    job_type: JobType,
    session: SessionHandle,
    job: Mutex<Job>,
    execution: Mutex<Option<JobHandle>>,
    current_query: Mutex<Option<QueryHandle>>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type(),
            session: job.session.clone(),
            job: Mutex::new(job),
            execution: Mutex::new(None),
            current_query: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub async fn snapshot(&self) -> Job {
        self.job.lock().await.clone()
    }

    pub async fn status(&self) -> JobStatus {
        self.job.lock().await.status
    }

    pub async fn is_finished(&self) -> bool {
        self.job.lock().await.is_finished()
    }

    /// Returns `Cancelled` once something else has moved the job to a terminal status.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.is_finished().await {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    pub async fn current_query(&self) -> Option<QueryHandle> {
        self.current_query.lock().await.clone()
    }

    pub(crate) async fn set_current_query(&self, handle: QueryHandle) {
        *self.current_query.lock().await = Some(handle);
    }

    pub(crate) async fn set_execution(&self, handle: JobHandle) {
        *self.execution.lock().await = Some(handle);
    }

    pub async fn has_execution(&self) -> bool {
        self.execution.lock().await.is_some()
    }

    /// Aborts the execution slot if it is still running. Returns whether an abort was issued.
    pub(crate) async fn abort_execution(&self) -> bool {
        match self.execution.lock().await.as_ref() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }
}

/// Concurrent map of every job this process knows about.
pub struct JobRegistry {
    entries: RwLock<HashMap<String, Arc<JobContext>>>,
    metastore: Arc<dyn Metastore>,
}

impl JobRegistry {
    pub fn new(metastore: Arc<dyn Metastore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            metastore,
        }
    }

    pub async fn add(&self, job: Job) -> Result<Arc<JobContext>> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&job.id) {
            return Err(JobError::DuplicateJob(job.id));
        }
        let ctx = Arc::new(JobContext::new(job));
        entries.insert(ctx.id.clone(), Arc::clone(&ctx));
        Ok(ctx)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<JobContext>> {
        self.entries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub async fn snapshot(&self, id: &str) -> Result<Job> {
        Ok(self.get(id).await?.snapshot().await)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<JobContext>> {
        self.entries.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Point-in-time list of contexts, so sweeps never hold the map lock while working.
    pub async fn contexts(&self) -> Vec<Arc<JobContext>> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn update_status(&self, id: &str, next: JobStatus) -> Result<bool> {
        let ctx = self.get(id).await?;
        self.transition(&ctx, next).await
    }

    /// Moves the job to `next` and persists it while still holding the job lock, so the
    /// stored record always matches the last applied transition. Illegal transitions
    /// return `Ok(false)`; a store failure is returned after the in-memory change sticks.
    pub async fn transition(&self, ctx: &JobContext, next: JobStatus) -> Result<bool> {
        let mut job = ctx.job.lock().await;
        let from = job.status;
        if !job.apply_status(next, Utc::now()) {
            debug!(job_id = %ctx.id, from = %from, to = %next, "Ignoring illegal status transition");
            return Ok(false);
        }
        info!(job_id = %ctx.id, kind = %ctx.job_type, from = %from, to = %next, "Job status changed");
        self.metastore.update_job(&job).await?;
        Ok(true)
    }

    /// Completes the job and records its training artifact under one job lock. Returns
    /// `Ok(false)` without touching the artifact path if the job already went terminal.
    pub async fn complete(&self, ctx: &JobContext, artifact: Option<PathBuf>) -> Result<bool> {
        let to = JobStatus::Completed;
        let mut job = ctx.job.lock().await;
        let from = job.status;
        if !job.apply_status(to, Utc::now()) {
            debug!(job_id = %ctx.id, from = %from, "Job already terminal, not completing");
            return Ok(false);
        }
        if let (Some(path), JobKind::Training(spec)) = (artifact, &mut job.kind) {
            spec.artifact_path = Some(path);
        }
        info!(job_id = %ctx.id, kind = %ctx.job_type, from = %from, to = %to, "Job status changed");
        self.metastore.update_job(&job).await?;
        Ok(true)
    }

    pub async fn persist(&self, ctx: &JobContext) -> Result<()> {
        let job = ctx.job.lock().await;
        self.metastore.update_job(&job).await
    }
}
