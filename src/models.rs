use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{JobError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Nothing leaves a terminal state, and only a submitted job may start running.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Submitted, Self::Running) => true,
            (Self::Submitted | Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "submitted" => Ok(Self::Submitted),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobError::Store(format!("unknown job status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Training,
    Evaluation,
    Prediction,
}

impl JobType {
    pub const ALL: [JobType; 3] = [Self::Evaluation, Self::Training, Self::Prediction];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Evaluation => "evaluation",
            Self::Prediction => "prediction",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials pair identifying a session on the query service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub public_id: String,
    pub secret_id: String,
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.public_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSpec {
    pub model_id: String,
    pub dataset_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationSpec {
    pub model_instance_id: String,
    pub input_data_set: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionSpec {
    pub model_instance_id: String,
    pub input_data_set: String,
    pub output_data_set: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobKind {
    Training(TrainingSpec),
    Evaluation(EvaluationSpec),
    Prediction(PredictionSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub session: SessionHandle,
    pub kind: JobKind,
}

impl Job {
    pub fn new(session: SessionHandle, kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Submitted,
            start_time: Utc::now(),
            finish_time: None,
            session,
            kind,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self.kind {
            JobKind::Training(_) => JobType::Training,
            JobKind::Evaluation(_) => JobType::Evaluation,
            JobKind::Prediction(_) => JobType::Prediction,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn validate(&self) -> Result<()> {
        let mut required = vec![
            ("id", self.id.as_str()),
            ("session.publicId", self.session.public_id.as_str()),
        ];
        match &self.kind {
            JobKind::Training(spec) => {
                required.push(("modelId", spec.model_id.as_str()));
                required.push(("datasetName", spec.dataset_name.as_str()));
            }
            JobKind::Evaluation(spec) => {
                required.push(("modelInstanceId", spec.model_instance_id.as_str()));
                required.push(("inputDataSet", spec.input_data_set.as_str()));
            }
            JobKind::Prediction(spec) => {
                required.push(("modelInstanceId", spec.model_instance_id.as_str()));
                required.push(("inputDataSet", spec.input_data_set.as_str()));
                required.push(("outputDataSet", spec.output_data_set.as_str()));
            }
        }

        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(JobError::Validation(format!(
                "{} job is missing `{field}`",
                self.job_type()
            )));
        }
        Ok(())
    }

    /// Applies a legal transition, stamping `finish_time` when it lands on a terminal status.
    pub(crate) fn apply_status(&mut self, next: JobStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.finish_time = next.is_terminal().then_some(now);
        true
    }

    pub fn to_response(&self) -> JobResponse {
        let until = self.finish_time.unwrap_or_else(Utc::now);
        JobResponse {
            elapsed_ms: (until - self.start_time).num_milliseconds().max(0) as u64,
            job: self.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub algorithm: String,
    pub features: Vec<Feature>,
    pub label: Feature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSet {
    pub name: String,
    #[serde(default)]
    pub database: Option<String>,
}

impl DataSet {
    pub fn database_or_default(&self) -> &str {
        self.database.as_deref().unwrap_or("default")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainedModel {
    pub algorithm: String,
    pub model_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTrainingRequest {
    pub session: SessionHandle,
    pub model_id: String,
    pub dataset_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEvaluationRequest {
    pub session: SessionHandle,
    pub model_instance_id: String,
    pub input_data_set: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePredictionRequest {
    pub session: SessionHandle,
    pub model_instance_id: String,
    pub input_data_set: String,
    pub output_data_set: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: String,
    pub cancelled: bool,
}
