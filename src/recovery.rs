use chrono::Utc;
use tracing::{debug, error, info};

use crate::{
    error::{JobError, Result},
    metastore::Metastore,
    models::{JobStatus, JobType},
    queue::JobQueue,
    registry::JobRegistry,
};

/// Re-registers and re-queues every job a previous process left unfinished.
/// A failing kind is logged and skipped. Returns how many jobs were queued.
pub(crate) async fn recover(
    registry: &JobRegistry,
    metastore: &dyn Metastore,
    queue: &JobQueue,
) -> usize {
    let mut recovered = 0;
    for kind in JobType::ALL {
        match recover_kind(registry, metastore, queue, kind).await {
            Ok(count) => {
                if count > 0 {
                    info!(kind = %kind, jobs = count, "Recovered incomplete jobs");
                }
                recovered += count;
            }
            Err(err) => error!(kind = %kind, code = err.code(), "Failed recovering {kind} jobs: {err}"),
        }
    }
    recovered
}

async fn recover_kind(
    registry: &JobRegistry,
    metastore: &dyn Metastore,
    queue: &JobQueue,
    kind: JobType,
) -> Result<usize> {
    let jobs = metastore.incomplete_jobs(kind).await?;
    let mut queued = 0;
    for mut job in jobs {
        // Whatever was running died with the previous process.
        job.status = JobStatus::Submitted;
        job.finish_time = None;
        job.start_time = Utc::now();

        let ctx = match registry.add(job).await {
            Ok(ctx) => ctx,
            Err(JobError::DuplicateJob(id)) => {
                debug!(job_id = %id, "Skipping recovered job that is already registered");
                continue;
            }
            Err(err) => return Err(err),
        };
        queue.send(ctx).map_err(|err| {
            JobError::QueueClosed(format!("recovered job {} was not queued", err.0.id()))
        })?;
        queued += 1;
    }
    Ok(queued)
}
