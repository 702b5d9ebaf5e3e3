use std::{sync::Arc, time::Duration};

use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    backend::{QueryBackend, QueryHandle, QueryOptions},
    error::{JobError, Result},
    registry::JobContext,
};

/// Submits one query for a job and blocks until the backend reports a terminal state.
#[derive(Clone)]
pub struct QueryRunner {
    backend: Arc<dyn QueryBackend>,
    poll_interval: Duration,
}

impl QueryRunner {
    pub fn new(backend: Arc<dyn QueryBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
        }
    }

    pub async fn run(&self, ctx: &JobContext, query: &str, name: &str) -> Result<QueryHandle> {
        let session = ctx.session();
        let handle = self
            .backend
            .submit(session, query, &QueryOptions::named(name))
            .await?;
        ctx.set_current_query(handle.clone()).await;
        info!(job_id = %ctx.id(), query_handle = %handle, query_name = name, "Submitted backend query");

        loop {
            let status = self.backend.status(session, &handle).await?;
            if status.state.is_finished() {
                if status.state.is_successful() {
                    debug!(job_id = %ctx.id(), query_handle = %handle, "Backend query succeeded");
                    return Ok(handle);
                }
                let message = status
                    .error_message
                    .unwrap_or_else(|| "no error message".to_string());
                warn!(
                    job_id = %ctx.id(),
                    query_handle = %handle,
                    status = %status.state,
                    error = %message,
                    "Backend query did not succeed"
                );
                return Err(JobError::BackendQuery {
                    handle: handle.to_string(),
                    status: status.state.to_string(),
                    message,
                });
            }

            time::sleep(self.poll_interval).await;
            if let Err(err) = ctx.checkpoint().await {
                self.cancel_quietly(ctx, &handle).await;
                return Err(err);
            }
        }
    }

    /// The job went terminal while its query was in flight; stop the query if the backend lets us.
    async fn cancel_quietly(&self, ctx: &JobContext, handle: &QueryHandle) {
        match self.backend.cancel(ctx.session(), handle).await {
            Ok(true) => debug!(job_id = %ctx.id(), query_handle = %handle, "Cancelled abandoned query"),
            Ok(false) => debug!(job_id = %ctx.id(), query_handle = %handle, "Backend declined to cancel query"),
            Err(err) => warn!(job_id = %ctx.id(), query_handle = %handle, "Failed cancelling query: {err:#}"),
        }
    }
}
