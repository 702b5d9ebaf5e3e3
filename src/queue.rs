use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    executor::Executor,
    lifecycle::JobLifecycle,
    models::JobStatus,
    pool::WorkerPool,
    registry::JobContext,
};

pub type JobQueue = mpsc::UnboundedSender<Arc<JobContext>>;

/// Pops submitted jobs in FIFO order and hands each one to the worker pool.
pub(crate) fn spawn_submitter(
    pool: Arc<WorkerPool>,
    executor: Arc<Executor>,
    mut queue_rx: mpsc::UnboundedReceiver<Arc<JobContext>>,
    mut stop_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let ctx = tokio::select! {
                biased;
                _ = stop_rx.recv() => break,
                next = queue_rx.recv() => match next {
                    Some(ctx) => ctx,
                    None => break,
                },
            };
            dispatch(&pool, &executor, ctx).await;
        }
        info!("Submitter loop stopped");
    })
}

async fn dispatch(pool: &WorkerPool, executor: &Arc<Executor>, ctx: Arc<JobContext>) {
    let status = ctx.status().await;
    if status != JobStatus::Submitted {
        info!(job_id = %ctx.id(), status = %status, "Dropping queued job that is no longer submitted");
        return;
    }

    let executor = Arc::clone(executor);
    let task_ctx = Arc::clone(&ctx);
    let handle = pool.spawn(ctx.id(), async move {
        executor.execute(task_ctx).await;
    });
    ctx.set_execution(handle).await;
    debug!(job_id = %ctx.id(), kind = %ctx.job_type(), "Job dispatched to worker pool");
}

/// Periodically persists and evicts finished jobs and fails jobs that overran their lifetime.
pub(crate) fn spawn_purger(
    lifecycle: JobLifecycle,
    every: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => break,
                _ = interval.tick() => {}
            }
            let report = lifecycle.purge_once(Utc::now()).await;
            if report.errors > 0 {
                warn!(
                    persisted = report.persisted,
                    evicted = report.evicted,
                    expired = report.expired,
                    errors = report.errors,
                    "Purge sweep finished with errors"
                );
            } else if report.evicted > 0 || report.expired > 0 {
                info!(
                    persisted = report.persisted,
                    evicted = report.evicted,
                    expired = report.expired,
                    "Purge sweep finished"
                );
            }
        }
        info!("Purge loop stopped");
    })
}
