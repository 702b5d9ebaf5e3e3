use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{
    auth::verify_bearer,
    error::JobError,
    models::{
        CancelResponse, CreateEvaluationRequest, CreatePredictionRequest, CreateTrainingRequest,
        DataSet, EvaluationSpec, Job, JobKind, Model, PredictionSpec, TrainingSpec,
    },
    AppState,
};

/// JSON error body shared by every handler: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_FAILED",
            message: message.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match &err {
            JobError::Validation(_) => StatusCode::BAD_REQUEST,
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::DuplicateJob(_) | JobError::Cancelled => StatusCode::CONFLICT,
            JobError::Store(_) | JobError::Pool(_) | JobError::QueueClosed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            JobError::Backend(_) | JobError::BackendQuery { .. } => StatusCode::BAD_GATEWAY,
            JobError::Artifact(_) | JobError::Training(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(code = err.code(), "Request failed: {err}");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message
                }
            })),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/models", post(register_model))
        .route("/v1/datasets", post(register_dataset))
        .route("/v1/trainings", post(create_training))
        .route("/v1/evaluations", post(create_evaluation))
        .route("/v1/predictions", post(create_prediction))
        .route("/v1/jobs/{job_id}", get(get_job).delete(cancel_job))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn register_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(model): Json<Model>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    if model.id.trim().is_empty() || model.algorithm.trim().is_empty() {
        return Err(ApiError::invalid("Model must have an id and an algorithm."));
    }
    if model.features.is_empty() {
        return Err(ApiError::invalid("Model must declare at least one feature."));
    }

    state.lifecycle.metastore().put_model(&model).await?;
    Ok((StatusCode::CREATED, Json(model)).into_response())
}

pub async fn register_dataset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(dataset): Json<DataSet>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    if dataset.name.trim().is_empty() {
        return Err(ApiError::invalid("Dataset must have a name."));
    }

    state.lifecycle.metastore().put_dataset(&dataset).await?;
    Ok((StatusCode::CREATED, Json(dataset)).into_response())
}

pub async fn create_training(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTrainingRequest>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let job = Job::new(
        payload.session,
        JobKind::Training(TrainingSpec {
            model_id: payload.model_id,
            dataset_name: payload.dataset_name,
            artifact_path: None,
        }),
    );
    accept(&state, job).await
}

pub async fn create_evaluation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateEvaluationRequest>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let job = Job::new(
        payload.session,
        JobKind::Evaluation(EvaluationSpec {
            model_instance_id: payload.model_instance_id,
            input_data_set: payload.input_data_set,
        }),
    );
    accept(&state, job).await
}

pub async fn create_prediction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePredictionRequest>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let job = Job::new(
        payload.session,
        JobKind::Prediction(PredictionSpec {
            model_instance_id: payload.model_instance_id,
            input_data_set: payload.input_data_set,
            output_data_set: payload.output_data_set,
        }),
    );
    accept(&state, job).await
}

/// Stores the new job so it survives a restart, then hands it to the lifecycle.
async fn accept(state: &AppState, job: Job) -> Result<Response, ApiError> {
    job.validate()?;
    state.lifecycle.metastore().update_job(&job).await?;
    let ctx = state.lifecycle.submit(job).await?;
    let job = ctx.snapshot().await;
    Ok((StatusCode::ACCEPTED, Json(job.to_response())).into_response())
}

pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    let job = state.lifecycle.job(&job_id).await?;
    Ok((StatusCode::OK, Json(job.to_response())).into_response())
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    verify_bearer(&headers, &state.config.api_key)?;

    // 404 only when the id was never seen; a finished job answers `cancelled: false`.
    state.lifecycle.job(&job_id).await?;
    let cancelled = state.lifecycle.cancel(&job_id).await;
    Ok((StatusCode::OK, Json(CancelResponse { job_id, cancelled })).into_response())
}
