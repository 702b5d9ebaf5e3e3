//! In-memory collaborators and fixtures shared by unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::{
    algorithm::Algorithm,
    backend::{QueryBackend, QueryHandle, QueryOptions, QueryState, QueryStatus},
    error::{JobError, Result},
    metastore::Metastore,
    models::{
        DataSet, EvaluationSpec, Feature, Job, JobKind, JobStatus, JobType, Model,
        PredictionSpec, SessionHandle, TrainedModel, TrainingSpec,
    },
    planner::{QueryPlan, QueryPlanner, ScoringParams},
};

pub const REGISTER_DDL: &str = "REGISTER scoring function";

pub fn session(public_id: &str) -> SessionHandle {
    SessionHandle {
        public_id: public_id.to_string(),
        secret_id: format!("secret-{public_id}"),
    }
}

pub fn prediction_job(public_id: &str) -> Job {
    prediction_job_for(public_id, "mi-1")
}

pub fn prediction_job_for(public_id: &str, model_instance_id: &str) -> Job {
    Job::new(
        session(public_id),
        JobKind::Prediction(PredictionSpec {
            model_instance_id: model_instance_id.to_string(),
            input_data_set: "events".to_string(),
            output_data_set: "scored_events".to_string(),
        }),
    )
}

pub fn evaluation_job(public_id: &str, model_instance_id: &str) -> Job {
    Job::new(
        session(public_id),
        JobKind::Evaluation(EvaluationSpec {
            model_instance_id: model_instance_id.to_string(),
            input_data_set: "events".to_string(),
        }),
    )
}

pub fn training_job(public_id: &str, model_id: &str, dataset_name: &str) -> Job {
    Job::new(
        session(public_id),
        JobKind::Training(TrainingSpec {
            model_id: model_id.to_string(),
            dataset_name: dataset_name.to_string(),
            artifact_path: None,
        }),
    )
}

/// A finished training of `churn`, usable as a model instance.
pub fn completed_training(public_id: &str) -> Job {
    let mut job = training_job(public_id, "churn", "events");
    job.apply_status(JobStatus::Running, Utc::now());
    job.apply_status(JobStatus::Completed, Utc::now());
    job
}

pub fn churn_model() -> Model {
    Model {
        id: "churn".to_string(),
        algorithm: "naive_bayes".to_string(),
        features: vec![
            Feature {
                name: "age".to_string(),
                data_type: "INT".to_string(),
            },
            Feature {
                name: "income".to_string(),
                data_type: "DOUBLE".to_string(),
            },
        ],
        label: Feature {
            name: "churned".to_string(),
            data_type: "BOOLEAN".to_string(),
        },
    }
}

pub fn events_dataset() -> DataSet {
    DataSet {
        name: "events".to_string(),
        database: Some("analytics".to_string()),
    }
}

#[derive(Default)]
pub struct MemoryMetastore {
    jobs: Mutex<HashMap<String, Job>>,
    models: Mutex<HashMap<String, Model>>,
    datasets: Mutex<HashMap<String, DataSet>>,
    failing_kinds: Mutex<HashSet<JobType>>,
    fail_updates: AtomicBool,
}

impl MemoryMetastore {
    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.lock().expect("jobs lock").get(id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().expect("jobs lock").len()
    }

    pub fn seed_job(&self, job: Job) {
        self.jobs.lock().expect("jobs lock").insert(job.id.clone(), job);
    }

    pub fn seed_model(&self, model: Model) {
        self.models
            .lock()
            .expect("models lock")
            .insert(model.id.clone(), model);
    }

    pub fn seed_dataset(&self, dataset: DataSet) {
        self.datasets
            .lock()
            .expect("datasets lock")
            .insert(dataset.name.clone(), dataset);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_incomplete(&self, kind: JobType) {
        self.failing_kinds.lock().expect("kinds lock").insert(kind);
    }
}

#[async_trait]
impl Metastore for MemoryMetastore {
    async fn incomplete_jobs(&self, job_type: JobType) -> Result<Vec<Job>> {
        if self.failing_kinds.lock().expect("kinds lock").contains(&job_type) {
            return Err(JobError::Store(format!("{job_type} table unavailable")));
        }
        Ok(self
            .jobs
            .lock()
            .expect("jobs lock")
            .values()
            .filter(|job| job.job_type() == job_type && !job.is_finished())
            .cloned()
            .collect())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(JobError::Store("metastore offline".to_string()));
        }
        self.seed_job(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.job(id))
    }

    async fn get_model(&self, id: &str) -> Result<Model> {
        self.models
            .lock()
            .expect("models lock")
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::Store(format!("model {id} not found")))
    }

    async fn get_dataset(&self, name: &str) -> Result<DataSet> {
        self.datasets
            .lock()
            .expect("datasets lock")
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Store(format!("dataset {name} not found")))
    }

    async fn put_model(&self, model: &Model) -> Result<()> {
        self.seed_model(model.clone());
        Ok(())
    }

    async fn put_dataset(&self, dataset: &DataSet) -> Result<()> {
        self.seed_dataset(dataset.clone());
        Ok(())
    }
}

struct ScriptedQuery {
    text: String,
    polls_left: usize,
    status_calls: usize,
    cancelled: bool,
}

/// Query backend whose queries succeed after a configurable number of polls.
#[derive(Default)]
pub struct ScriptedBackend {
    queries: Mutex<HashMap<QueryHandle, ScriptedQuery>>,
    submitted: Mutex<Vec<String>>,
    names: Mutex<Vec<String>>,
    outcomes: Mutex<HashMap<String, QueryState>>,
    cancelled: Mutex<Vec<QueryHandle>>,
    polls_before_finish: AtomicUsize,
    next_handle: AtomicUsize,
}

impl ScriptedBackend {
    /// Every query submitted from now on reports `RUNNING` this many times first.
    pub fn polls_before_finish(&self, polls: usize) {
        self.polls_before_finish.store(polls, Ordering::SeqCst);
    }

    /// Terminal state reported for queries with exactly this text.
    pub fn finish_with(&self, query: &str, state: QueryState) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .insert(query.to_string(), state);
    }

    pub fn submitted_queries(&self) -> Vec<String> {
        self.submitted.lock().expect("submitted lock").clone()
    }

    /// Query names in submission order.
    pub fn submitted_names(&self) -> Vec<String> {
        self.names.lock().expect("names lock").clone()
    }

    pub fn count_submitted(&self, query: &str) -> usize {
        self.submitted
            .lock()
            .expect("submitted lock")
            .iter()
            .filter(|text| text.as_str() == query)
            .count()
    }

    pub fn status_calls(&self, handle: &QueryHandle) -> usize {
        self.queries
            .lock()
            .expect("queries lock")
            .get(handle)
            .map_or(0, |query| query.status_calls)
    }

    pub fn cancelled_handles(&self) -> Vec<QueryHandle> {
        self.cancelled.lock().expect("cancelled lock").clone()
    }
}

#[async_trait]
impl QueryBackend for ScriptedBackend {
    async fn submit(
        &self,
        _session: &SessionHandle,
        query: &str,
        options: &QueryOptions,
    ) -> Result<QueryHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = QueryHandle(format!("query-{id}"));
        self.submitted
            .lock()
            .expect("submitted lock")
            .push(query.to_string());
        self.names
            .lock()
            .expect("names lock")
            .push(options.name.clone());
        self.queries.lock().expect("queries lock").insert(
            handle.clone(),
            ScriptedQuery {
                text: query.to_string(),
                polls_left: self.polls_before_finish.load(Ordering::SeqCst),
                status_calls: 0,
                cancelled: false,
            },
        );
        Ok(handle)
    }

    async fn status(&self, _session: &SessionHandle, handle: &QueryHandle) -> Result<QueryStatus> {
        let mut queries = self.queries.lock().expect("queries lock");
        let query = queries
            .get_mut(handle)
            .ok_or_else(|| JobError::Backend(format!("unknown handle {handle}")))?;
        query.status_calls += 1;

        let state = if query.cancelled {
            QueryState::Canceled
        } else if query.polls_left > 0 {
            query.polls_left -= 1;
            QueryState::Running
        } else {
            self.outcomes
                .lock()
                .expect("outcomes lock")
                .get(&query.text)
                .copied()
                .unwrap_or(QueryState::Successful)
        };
        let error_message = (!state.is_successful() && state.is_finished())
            .then(|| format!("scripted {state}"));
        Ok(QueryStatus {
            state,
            error_message,
        })
    }

    async fn cancel(&self, _session: &SessionHandle, handle: &QueryHandle) -> Result<bool> {
        let mut queries = self.queries.lock().expect("queries lock");
        let Some(query) = queries.get_mut(handle) else {
            return Ok(false);
        };
        query.cancelled = true;
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .push(handle.clone());
        Ok(true)
    }
}

/// Planner emitting short marker statements instead of HiveQL.
#[derive(Default)]
pub struct StaticPlanner {
    output_exists: bool,
}

impl StaticPlanner {
    /// Reports every output table as already present.
    pub fn with_existing_output() -> Self {
        Self {
            output_exists: true,
        }
    }
}

impl QueryPlanner for StaticPlanner {
    fn plan(&self, params: &ScoringParams) -> Result<QueryPlan> {
        let mut main_query = format!(
            "SCORE {}.{} INTO {}",
            params.database, params.input_table, params.output_table
        );
        if let Some(label) = &params.label {
            main_query.push_str(&format!(" WITH {}", label.name));
        }
        Ok(QueryPlan {
            main_query,
            create_output_query: format!("CREATE {}", params.output_table),
            output_exists: self.output_exists,
        })
    }

    fn scoring_function_ddl(&self) -> String {
        REGISTER_DDL.to_string()
    }
}

pub struct EchoAlgorithm {
    name: String,
    delay: Duration,
}

impl EchoAlgorithm {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Blocks the training thread for `delay` before returning.
    pub fn slow(name: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(name)
        }
    }
}

impl Algorithm for EchoAlgorithm {
    fn name(&self) -> &str {
        &self.name
    }

    fn train(&self, model: &Model, dataset: &DataSet) -> Result<TrainedModel> {
        std::thread::sleep(self.delay);
        Ok(TrainedModel {
            algorithm: self.name.clone(),
            model_id: model.id.clone(),
            payload: json!({
                "dataset": dataset.name,
                "features": model.features.len(),
            }),
        })
    }
}
