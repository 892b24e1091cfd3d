/// Worker pool
///
/// `concurrency` worker tasks claim jobs from every language queue this
/// worker knows about, plus one reaper task that returns jobs with expired
/// visibility deadlines to their pending lists. Flipping the shutdown
/// channel stops claiming; jobs already claimed run to completion.
use crate::executor::{execute_job, JobContext, JobOutcome};
use arbiter_common::redis as queue;
use arbiter_common::types::Language;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

const REDIS_BACKOFF: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    conn: ConnectionManager,
    ctx: JobContext,
    languages: Vec<Language>,
}

impl WorkerPool {
    pub fn new(conn: ConnectionManager, ctx: JobContext, languages: Vec<Language>) -> Self {
        Self {
            conn,
            ctx,
            languages,
        }
    }

    /// Run until `shutdown` flips to true and every in-flight job is done
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        for worker_id in 0..self.ctx.settings.concurrency {
            tasks.spawn(worker_loop(
                worker_id,
                self.conn.clone(),
                self.ctx.clone(),
                self.languages.clone(),
                shutdown.clone(),
            ));
        }
        tasks.spawn(reaper_loop(
            self.conn.clone(),
            self.ctx.settings.reap_interval,
            self.languages.clone(),
            shutdown.clone(),
        ));

        info!(
            workers = self.ctx.settings.concurrency,
            languages = ?self.languages,
            "Worker pool started"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("Worker pool drained");
    }
}

#[instrument(skip_all, fields(worker_id = worker_id))]
async fn worker_loop(
    worker_id: usize,
    mut conn: ConnectionManager,
    ctx: JobContext,
    languages: Vec<Language>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker started");

    while !*shutdown.borrow() {
        let mut claimed_any = false;

        for language in &languages {
            let claimed = match queue::claim_job(&mut conn, language, ctx.settings.visibility_timeout).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(e) => {
                    error!(language = %language, error = %e, "Redis error while claiming");
                    tokio::time::sleep(REDIS_BACKOFF).await;
                    continue;
                }
            };
            claimed_any = true;

            info!(
                job_id = %claimed.job.id,
                target = %claimed.job.target,
                language = %language,
                test_cases = claimed.job.request.test_cases().len(),
                source_size = claimed.job.request.source_code().len(),
                delivery = claimed.deliveries,
                "Received job"
            );

            let start = std::time::Instant::now();
            match execute_job(&mut conn, &ctx, &claimed).await {
                Ok(JobOutcome::Judged(result)) => info!(
                    job_id = %claimed.job.id,
                    verdict = result.verdict().code(),
                    failing_test = ?result.failing_test_number(),
                    execution_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                ),
                Ok(outcome) => info!(job_id = %claimed.job.id, outcome = ?outcome, "Job finished without judging"),
                Err(e) => {
                    // Left claimed; the reaper redelivers it
                    error!(job_id = %claimed.job.id, error = %e, "Job failed");
                    tokio::time::sleep(REDIS_BACKOFF).await;
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }

        if !claimed_any {
            tokio::select! {
                _ = tokio::time::sleep(ctx.settings.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    debug!("Worker stopped");
}

async fn reaper_loop(
    mut conn: ConnectionManager,
    interval: Duration,
    languages: Vec<Language>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        for language in &languages {
            match queue::requeue_expired(&mut conn, language).await {
                Ok(0) => {}
                Ok(requeued) => {
                    warn!(language = %language, requeued, "Requeued jobs with expired visibility deadlines")
                }
                Err(e) => error!(language = %language, error = %e, "Redis error while reaping"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}
