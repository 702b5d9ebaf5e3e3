use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, error, info, warn};

use crate::{
    algorithm::AlgorithmRegistry,
    artifact_store::ArtifactStore,
    error::{JobError, Result},
    metastore::Metastore,
    models::{JobKind, JobStatus, JobType},
    planner::{QueryPlanner, ScoringParams, RESULT_COLUMN},
    registry::{JobContext, JobRegistry},
    runner::QueryRunner,
    scoring::ScoringFunctions,
};

/// Output table an evaluation writes its scored rows into.
pub fn evaluation_table(job_id: &str) -> String {
    format!("ml_eval_{}", job_id.replace('-', "_"))
}

/// Runs one job of any kind to a terminal status.
pub struct Executor {
    registry: Arc<JobRegistry>,
    metastore: Arc<dyn Metastore>,
    runner: QueryRunner,
    planner: Arc<dyn QueryPlanner>,
    scoring: ScoringFunctions,
    algorithms: AlgorithmRegistry,
    artifacts: ArtifactStore,
}

impl Executor {
    pub fn new(
        registry: Arc<JobRegistry>,
        metastore: Arc<dyn Metastore>,
        runner: QueryRunner,
        planner: Arc<dyn QueryPlanner>,
        algorithms: AlgorithmRegistry,
        artifacts: ArtifactStore,
    ) -> Self {
        let scoring = ScoringFunctions::new(Arc::clone(&planner), runner.clone());
        Self {
            registry,
            metastore,
            runner,
            planner,
            scoring,
            algorithms,
            artifacts,
        }
    }

    pub async fn execute(&self, ctx: Arc<JobContext>) {
        let status = ctx.status().await;
        if status != JobStatus::Submitted {
            info!(job_id = %ctx.id(), status = %status, "Skipping job that is no longer submitted");
            return;
        }

        match self.registry.transition(&ctx, JobStatus::Running).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %ctx.id(), "Job left submitted before it could start");
                return;
            }
            Err(err) => warn!(job_id = %ctx.id(), "Failed persisting running status: {err:#}"),
        }

        let result = match ctx.job_type() {
            JobType::Training => self.train(&ctx).await.map(Some),
            JobType::Evaluation => self.evaluate(&ctx).await.map(|()| None),
            JobType::Prediction => self.predict(&ctx).await.map(|()| None),
        };
        self.finish(&ctx, result).await;
    }

    /// Applies the terminal status for `result`. `Ok(Some(path))` is a training artifact that is
    /// recorded together with the completion, or deleted if the job went terminal first.
    async fn finish(&self, ctx: &JobContext, result: Result<Option<PathBuf>>) {
        let applied = match result {
            Ok(artifact) => {
                let applied = self.registry.complete(ctx, artifact.clone()).await;
                if let (Ok(false), Some(path)) = (&applied, artifact) {
                    self.discard_artifact(ctx, &path).await;
                }
                applied
            }
            Err(JobError::Cancelled) => {
                info!(job_id = %ctx.id(), "Job stopped at a checkpoint after cancellation");
                return;
            }
            Err(err) => {
                error!(job_id = %ctx.id(), code = err.code(), "Job {} failed: {err}", ctx.id());
                self.registry.transition(ctx, JobStatus::Failed).await
            }
        };

        match applied {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %ctx.id(), "Job already reached a terminal status"),
            Err(err) => warn!(job_id = %ctx.id(), "Failed persisting final status: {err:#}"),
        }
    }

    async fn discard_artifact(&self, ctx: &JobContext, path: &Path) {
        match self.artifacts.delete(path).await {
            Ok(()) => info!(job_id = %ctx.id(), artifact = %path.display(), "Deleted artifact of cancelled training"),
            Err(err) => warn!(job_id = %ctx.id(), "Failed deleting artifact of cancelled training: {err:#}"),
        }
    }

    async fn train(&self, ctx: &JobContext) -> Result<PathBuf> {
        let job = ctx.snapshot().await;
        let JobKind::Training(spec) = &job.kind else {
            return Err(JobError::Validation(format!("job {} is not a training", job.id)));
        };

        let model = self.metastore.get_model(&spec.model_id).await?;
        let dataset = self.metastore.get_dataset(&spec.dataset_name).await?;
        let algorithm = self.algorithms.get(&model.algorithm)?;
        ctx.checkpoint().await?;

        info!(
            job_id = %job.id,
            model_id = %model.id,
            algorithm = %model.algorithm,
            dataset = %dataset.name,
            "Training started"
        );
        let trained = tokio::task::spawn_blocking(move || algorithm.train(&model, &dataset))
            .await
            .map_err(|err| JobError::Training(err.to_string()))??;

        let path = self
            .artifacts
            .save(&job.id, &trained)
            .await
            .map_err(|err| JobError::Artifact(format!("{err:#}")))?;

        if ctx.checkpoint().await.is_err() {
            self.discard_artifact(ctx, &path).await;
            return Err(JobError::Cancelled);
        }

        info!(job_id = %job.id, artifact = %path.display(), "Model artifact written");
        Ok(path)
    }

    async fn evaluate(&self, ctx: &JobContext) -> Result<()> {
        let job = ctx.snapshot().await;
        let JobKind::Evaluation(spec) = &job.kind else {
            return Err(JobError::Validation(format!("job {} is not an evaluation", job.id)));
        };

        let instance = self
            .metastore
            .get_model_instance(&spec.model_instance_id)
            .await?;
        let model = self.metastore.get_model(&instance.model_id).await?;
        let dataset = self.metastore.get_dataset(&spec.input_data_set).await?;
        ctx.checkpoint().await?;

        let params = ScoringParams {
            job_id: job.id.clone(),
            database: dataset.database_or_default().to_string(),
            input_table: dataset.name.clone(),
            output_table: evaluation_table(&job.id),
            output_column: RESULT_COLUMN.to_string(),
            features: model.features.clone(),
            label: Some(model.label.clone()),
            algorithm: model.algorithm.clone(),
            model_id: model.id.clone(),
            model_instance_id: spec.model_instance_id.clone(),
        };
        self.score(ctx, &params, "ml_eval").await
    }

    async fn predict(&self, ctx: &JobContext) -> Result<()> {
        let job = ctx.snapshot().await;
        let JobKind::Prediction(spec) = &job.kind else {
            return Err(JobError::Validation(format!("job {} is not a prediction", job.id)));
        };

        let instance = self
            .metastore
            .get_model_instance(&spec.model_instance_id)
            .await?;
        let model = self.metastore.get_model(&instance.model_id).await?;
        let dataset = self.metastore.get_dataset(&spec.input_data_set).await?;
        ctx.checkpoint().await?;

        let params = ScoringParams {
            job_id: job.id.clone(),
            database: dataset.database_or_default().to_string(),
            input_table: dataset.name.clone(),
            output_table: spec.output_data_set.clone(),
            output_column: RESULT_COLUMN.to_string(),
            features: model.features.clone(),
            label: None,
            algorithm: model.algorithm.clone(),
            model_id: model.id.clone(),
            model_instance_id: spec.model_instance_id.clone(),
        };
        self.score(ctx, &params, "ml_predict").await
    }

    /// Shared tail of evaluation and prediction: create the output table if needed,
    /// make sure the scoring function exists for the session, then run the scoring query.
    async fn score(&self, ctx: &JobContext, params: &ScoringParams, prefix: &str) -> Result<()> {
        let plan = self.planner.plan(params)?;

        if !plan.output_exists {
            let name = format!("{prefix}_create_output_{}", ctx.id());
            self.runner.run(ctx, &plan.create_output_query, &name).await?;
            ctx.checkpoint().await?;
        }

        self.scoring.ensure_registered(ctx).await?;
        ctx.checkpoint().await?;

        let name = format!("{prefix}_{}", ctx.id());
        self.runner.run(ctx, &plan.main_query, &name).await?;
        info!(job_id = %ctx.id(), output = %params.output_table, "Scoring query finished");
        Ok(())
    }
}
