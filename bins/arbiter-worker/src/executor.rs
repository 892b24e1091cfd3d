/// Job Executor - runs one claimed job end to end
///
/// 1. Give up on a job that keeps failing to complete (dead-letter it)
/// 2. Mark the target record InProcessing; skip stale or deleted targets
/// 3. Judge, keeping the job's lease alive with a heartbeat
/// 4. Persist the verdict to the record and to the result key, then ack
///
/// Any error before the ack leaves the job claimed; the reaper hands it to
/// another worker once its visibility deadline passes.
use crate::config::WorkerSettings;
use crate::engine::JudgingEngine;
use anyhow::{Context, Result};
use arbiter_common::redis::{self as queue, ClaimedJob};
use arbiter_common::store::{self, RecordUpdate};
use arbiter_common::types::{JudgeJob, JudgeRequest, JudgeResult, TestCase};
use redis::aio::ConnectionManager;
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

pub const INCOMPLETE_JUDGING_MESSAGE: &str = "judging did not complete";

/// Everything a job needs besides the connection
#[derive(Clone)]
pub struct JobContext {
    pub engine: Arc<JudgingEngine>,
    pub settings: Arc<WorkerSettings>,
    pub result_ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Judged(JudgeResult),
    /// The target record was gone or superseded; nothing was judged
    Skipped(RecordUpdate),
    DeadLettered,
}

#[instrument(
    skip_all,
    fields(job_id = %claimed.job.id, target = %claimed.job.target, delivery = claimed.deliveries)
)]
pub async fn execute_job(
    conn: &mut ConnectionManager,
    ctx: &JobContext,
    claimed: &ClaimedJob,
) -> Result<JobOutcome> {
    let job = &claimed.job;

    if claimed.deliveries > ctx.settings.max_deliveries {
        warn!(
            max_deliveries = ctx.settings.max_deliveries,
            "Job exceeded delivery limit, dead-lettering"
        );
        let result = JudgeResult::compilation_error(first_test(&job.request), INCOMPLETE_JUDGING_MESSAGE);
        // The job leaves the queue even if its record cannot take the verdict
        if let Err(e) = persist(conn, ctx, job, &result).await {
            error!(error = %format!("{:#}", e), "Failed to record incomplete judging");
        }
        queue::dead_letter(conn, claimed)
            .await
            .context("Failed to dead-letter job")?;
        return Ok(JobOutcome::DeadLettered);
    }

    let marked = store::apply_result(conn, job, &JudgeResult::in_processing())
        .await
        .context("Failed to mark record in processing")?;
    if marked != RecordUpdate::Applied {
        info!(reason = ?marked, "Target record is gone or superseded, skipping job");
        queue::ack_job(conn, claimed).await.context("Failed to ack job")?;
        return Ok(JobOutcome::Skipped(marked));
    }

    let heartbeat = spawn_heartbeat(conn.clone(), claimed.clone(), ctx.settings.clone());
    let result = judge_guarded(ctx.engine.clone(), job.request.clone()).await;
    heartbeat.abort();

    persist(conn, ctx, job, &result).await?;
    queue::ack_job(conn, claimed).await.context("Failed to ack job")?;

    Ok(JobOutcome::Judged(result))
}

/// Write `result` to the job's record and to its result key
async fn persist(
    conn: &mut ConnectionManager,
    ctx: &JobContext,
    job: &JudgeJob,
    result: &JudgeResult,
) -> Result<()> {
    let update = store::apply_result(conn, job, result)
        .await
        .context("Failed to write verdict to record")?;
    if update != RecordUpdate::Applied {
        info!(reason = ?update, verdict = result.verdict().code(), "Verdict not written to record");
    }

    queue::store_result(conn, &job.id, result, ctx.result_ttl_seconds)
        .await
        .context("Failed to store job result")?;

    Ok(())
}

/// Judge on a separate task so a panic inside the engine becomes a verdict
/// instead of taking the worker down
pub async fn judge_guarded(engine: Arc<JudgingEngine>, request: JudgeRequest) -> JudgeResult {
    let first_test = first_test(&request);

    match tokio::spawn(async move { engine.judge(&request).await }).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(panic = %message, "Judging panicked");
            JudgeResult::compilation_error(first_test, message)
        }
        Err(e) => {
            error!(error = %e, "Judging task was cancelled");
            JudgeResult::compilation_error(first_test, e.to_string())
        }
    }
}

fn first_test(request: &JudgeRequest) -> Option<u32> {
    request.test_cases().first().map(TestCase::sequence_number)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "judging panicked".to_string()
    }
}

fn spawn_heartbeat(
    mut conn: ConnectionManager,
    claimed: ClaimedJob,
    settings: Arc<WorkerSettings>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.heartbeat_interval());
        // The first tick completes immediately; the claim already set a deadline
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = queue::extend_lease(&mut conn, &claimed, settings.visibility_timeout).await {
                warn!(job_id = %claimed.job.id, error = %e, "Failed to extend job lease");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Sandbox, SandboxError, SandboxProvider};
    use arbiter_common::types::{Language, Verdict};
    use async_trait::async_trait;

    struct PanickingProvider;

    #[async_trait]
    impl SandboxProvider for PanickingProvider {
        async fn acquire(&self, _language: Language) -> Result<Box<dyn Sandbox>, SandboxError> {
            panic!("sandbox exploded");
        }
    }

    fn make_request() -> JudgeRequest {
        JudgeRequest::new(
            "print(input())",
            Language::Python311,
            1,
            64,
            vec![TestCase::new(4, "1", "1"), TestCase::new(7, "2", "2")],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_panic_becomes_compilation_error() {
        let engine = Arc::new(JudgingEngine::new(Arc::new(PanickingProvider)));
        let result = judge_guarded(engine, make_request()).await;

        assert_eq!(result.verdict(), Verdict::CompilationError);
        assert_eq!(result.failing_test_number(), Some(4));
        assert_eq!(result.diagnostic_message(), Some("sandbox exploded"));
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "judging panicked");
    }
}
