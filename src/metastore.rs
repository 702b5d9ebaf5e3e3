use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    error::{JobError, Result},
    models::{DataSet, Job, JobKind, JobStatus, JobType, Model, TrainingSpec},
};

/// Persistent record of jobs and the entities they reference.
#[async_trait]
pub trait Metastore: Send + Sync {
    /// Jobs of one kind that were left submitted or running.
    async fn incomplete_jobs(&self, job_type: JobType) -> Result<Vec<Job>>;

    async fn update_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    async fn get_model(&self, id: &str) -> Result<Model>;

    async fn get_dataset(&self, name: &str) -> Result<DataSet>;

    async fn put_model(&self, model: &Model) -> Result<()>;

    async fn put_dataset(&self, dataset: &DataSet) -> Result<()>;

    /// A model instance is a completed training job.
    async fn get_model_instance(&self, id: &str) -> Result<TrainingSpec> {
        match self.get_job(id).await? {
            Some(Job {
                kind: JobKind::Training(spec),
                status: JobStatus::Completed,
                ..
            }) => Ok(spec),
            Some(job) => Err(JobError::Validation(format!(
                "job {id} is a {} job in status {}, not a completed training",
                job.job_type(),
                job.status
            ))),
            None => Err(JobError::Store(format!("model instance {id} not found"))),
        }
    }
}

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS ml_jobs (
        id TEXT PRIMARY KEY,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL,
        body_json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS ml_jobs_by_type_status ON ml_jobs (job_type, status);
    CREATE TABLE IF NOT EXISTS ml_models (
        id TEXT PRIMARY KEY,
        body_json TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS ml_datasets (
        name TEXT PRIMARY KEY,
        body_json TEXT NOT NULL
    );
";

#[derive(Clone)]
pub struct SqliteMetastore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetastore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed creating metastore directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening metastore {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory metastore")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed creating metastore schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("metastore connection lock poisoned"))?;
            op(&*guard)
        })
        .await
        .map_err(JobError::store)?
        .map_err(JobError::store)
    }
}

#[async_trait]
impl Metastore for SqliteMetastore {
    async fn incomplete_jobs(&self, job_type: JobType) -> Result<Vec<Job>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT body_json FROM ml_jobs WHERE job_type = ?1 AND status IN (?2, ?3) ORDER BY rowid",
            )?;
            let rows = stmt.query_map(
                params![
                    job_type.as_str(),
                    JobStatus::Submitted.as_str(),
                    JobStatus::Running.as_str()
                ],
                |row| row.get::<_, String>(0),
            )?;
            let mut jobs = Vec::new();
            for body in rows {
                let body = body?;
                jobs.push(
                    serde_json::from_str::<Job>(&body)
                        .with_context(|| format!("Corrupt job record: {body}"))?,
                );
            }
            Ok(jobs)
        })
        .await
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let id = job.id.clone();
        let job_type = job.job_type();
        let status = job.status;
        let body = serde_json::to_string(job).map_err(JobError::store)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO ml_jobs (id, job_type, status, body_json) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, body_json = excluded.body_json",
                params![id, job_type.as_str(), status.as_str(), body],
            )
            .with_context(|| format!("Failed writing job {id}"))?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        self.call(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body_json FROM ml_jobs WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|body| {
                serde_json::from_str::<Job>(&body)
                    .with_context(|| format!("Corrupt job record for {id}"))
            })
            .transpose()
        })
        .await
    }

    async fn get_model(&self, id: &str) -> Result<Model> {
        let id = id.to_string();
        self.call(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body_json FROM ml_models WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let body = body.with_context(|| format!("model {id} not found"))?;
            serde_json::from_str::<Model>(&body)
                .with_context(|| format!("Corrupt model record for {id}"))
        })
        .await
    }

    async fn get_dataset(&self, name: &str) -> Result<DataSet> {
        let name = name.to_string();
        self.call(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body_json FROM ml_datasets WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            let body = body.with_context(|| format!("dataset {name} not found"))?;
            serde_json::from_str::<DataSet>(&body)
                .with_context(|| format!("Corrupt dataset record for {name}"))
        })
        .await
    }

    async fn put_model(&self, model: &Model) -> Result<()> {
        let id = model.id.clone();
        let body = serde_json::to_string(model).map_err(JobError::store)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO ml_models (id, body_json) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET body_json = excluded.body_json",
                params![id, body],
            )?;
            Ok(())
        })
        .await
    }

    async fn put_dataset(&self, dataset: &DataSet) -> Result<()> {
        let name = dataset.name.clone();
        let body = serde_json::to_string(dataset).map_err(JobError::store)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO ml_datasets (name, body_json) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET body_json = excluded.body_json",
                params![name, body],
            )?;
            Ok(())
        })
        .await
    }
}
