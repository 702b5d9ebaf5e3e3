use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use crate::{
    error::Result,
    models::SessionHandle,
    planner::QueryPlanner,
    registry::JobContext,
    runner::QueryRunner,
};

/// Registers the scoring function at most once per session.
///
/// Concurrent callers for the same session share one registration attempt. A failed
/// attempt leaves the session unregistered so the next job retries it.
pub struct ScoringFunctions {
    planner: Arc<dyn QueryPlanner>,
    runner: QueryRunner,
    sessions: Mutex<HashMap<SessionHandle, Arc<OnceCell<()>>>>,
}

impl ScoringFunctions {
    pub fn new(planner: Arc<dyn QueryPlanner>, runner: QueryRunner) -> Self {
        Self {
            planner,
            runner,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ensure_registered(&self, ctx: &JobContext) -> Result<()> {
        let cell = {
            let mut sessions = self.sessions.lock().await;
            Arc::clone(sessions.entry(ctx.session().clone()).or_default())
        };

        cell.get_or_try_init(|| async {
            let ddl = self.planner.scoring_function_ddl();
            let name = format!("ml_register_udf_{}", ctx.session().public_id);
            self.runner.run(ctx, &ddl, &name).await?;
            info!(job_id = %ctx.id(), session = %ctx.session(), "Scoring function registered");
            Ok::<_, crate::error::JobError>(())
        })
        .await?;
        Ok(())
    }

    pub async fn is_registered(&self, session: &SessionHandle) -> bool {
        self.sessions
            .lock()
            .await
            .get(session)
            .is_some_and(|cell| cell.initialized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::QueryState,
        testing::{prediction_job, ScriptedBackend, StaticPlanner, REGISTER_DDL},
    };
    use std::time::Duration;

    fn scoring(backend: Arc<ScriptedBackend>) -> Arc<ScoringFunctions> {
        let runner = QueryRunner::new(backend, Duration::from_millis(5));
        Arc::new(ScoringFunctions::new(Arc::new(StaticPlanner::default()), runner))
    }

    #[tokio::test]
    async fn concurrent_jobs_register_once() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.polls_before_finish(3);
        let scoring = scoring(backend.clone());

        let first = Arc::new(JobContext::new(prediction_job("pub-1")));
        let second = Arc::new(JobContext::new(prediction_job("pub-1")));
        let (a, b) = tokio::join!(
            scoring.ensure_registered(&first),
            scoring.ensure_registered(&second)
        );
        a.expect("first");
        b.expect("second");

        assert_eq!(backend.count_submitted(REGISTER_DDL), 1);
        assert!(scoring.is_registered(first.session()).await);
    }

    #[tokio::test]
    async fn registration_query_is_named_after_the_session() {
        let backend = Arc::new(ScriptedBackend::default());
        let scoring = scoring(backend.clone());

        scoring
            .ensure_registered(&JobContext::new(prediction_job("pub-7")))
            .await
            .expect("register");

        assert_eq!(backend.submitted_names(), vec!["ml_register_udf_pub-7".to_string()]);
    }

    #[tokio::test]
    async fn sessions_register_independently() {
        let backend = Arc::new(ScriptedBackend::default());
        let scoring = scoring(backend.clone());

        scoring
            .ensure_registered(&JobContext::new(prediction_job("pub-1")))
            .await
            .expect("pub-1");
        scoring
            .ensure_registered(&JobContext::new(prediction_job("pub-2")))
            .await
            .expect("pub-2");

        assert_eq!(backend.count_submitted(REGISTER_DDL), 2);
    }

    #[tokio::test]
    async fn failed_registration_is_retried() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.finish_with(REGISTER_DDL, QueryState::Failed);
        let scoring = scoring(backend.clone());
        let ctx = JobContext::new(prediction_job("pub-1"));

        assert!(scoring.ensure_registered(&ctx).await.is_err());
        assert!(!scoring.is_registered(ctx.session()).await);

        backend.finish_with(REGISTER_DDL, QueryState::Successful);
        scoring.ensure_registered(&ctx).await.expect("retry");
        assert_eq!(backend.count_submitted(REGISTER_DDL), 2);
    }
}
