// HTTP route handlers for the Arbiter API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use arbiter_common::redis as queue;
use arbiter_common::store::{self, ProblemRecord, StoreError, SubmissionRecord, Transaction};
use arbiter_common::types::{JobHandle, Language, TestCase};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics;
use crate::AppState;

/// Optimistic retries for read-modify-write endpoints
const MAX_UPDATE_ATTEMPTS: u32 = 5;

#[derive(Debug, Deserialize)]
pub struct TestCaseInput {
    /// Defaults to the case's 1-based position in the list
    #[serde(default)]
    pub sequence_number: Option<u32>,
    #[serde(default)]
    pub input_data: String,
    pub expected_output: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateProblemRequest {
    pub time_limit_seconds: u32,
    pub memory_limit_mb: u32,
    #[serde(default)]
    pub test_cases: Vec<TestCaseInput>,
    pub author_solution: String,
    pub author_language: String,
}

impl CreateProblemRequest {
    pub fn into_record(self) -> Result<ProblemRecord, ApiError> {
        let language = parse_language(&self.author_language)?;
        let test_cases = self
            .test_cases
            .into_iter()
            .enumerate()
            .map(|(idx, tc)| {
                TestCase::new(
                    tc.sequence_number.unwrap_or(idx as u32 + 1),
                    tc.input_data,
                    tc.expected_output,
                )
            })
            .collect();

        Ok(ProblemRecord::new(
            self.time_limit_seconds,
            self.memory_limit_mb,
            test_cases,
            self.author_solution,
            language,
        )?)
    }
}

/// Body of both `PUT /problems/:id/solution` and `POST /problems/:id/submissions`
#[derive(Debug, Deserialize)]
pub struct SourceRequest {
    pub source_code: String,
    pub language: String,
}

#[derive(Debug, Serialize)]
pub struct ProblemResponse {
    pub problem: ProblemRecord,
    /// Present when an author check was queued
    pub job: Option<JobHandle>,
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub submission: SubmissionRecord,
    pub job: JobHandle,
}

fn parse_language(raw: &str) -> Result<Language, ApiError> {
    Ok(Language::from_str(raw)?)
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid {} ID format", what)))
}

/// Single job handle out of a commit that deferred exactly one job
fn only_handle(handles: Vec<JobHandle>) -> Result<JobHandle, ApiError> {
    handles
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Internal("commit returned no job handle".into()))
}

fn record_enqueued(handles: &[JobHandle]) {
    for handle in handles {
        metrics::JOBS_ENQUEUED
            .with_label_values(&[handle.target.kind()])
            .inc();
    }
}

fn enqueue_failed(e: StoreError) -> ApiError {
    if !matches!(e, StoreError::Conflict | StoreError::InvalidRequest(_)) {
        metrics::ENQUEUE_FAILURES.inc();
    }
    e.into()
}

/// POST /problems - Store a problem and queue its author check
pub async fn create_problem(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateProblemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let problem = payload.into_record()?;
    let job = problem.author_job()?;

    let mut tx = Transaction::new();
    tx.insert_problem(&problem)?;
    tx.enqueue_after_commit(job);

    let mut conn = state.redis.clone();
    let handles = tx.commit(&mut conn).await.map_err(enqueue_failed)?;
    record_enqueued(&handles);
    let handle = only_handle(handles)?;

    info!(
        problem_id = %problem.id,
        job_id = %handle.job_id,
        test_cases = problem.test_cases.len(),
        "Problem created, author check queued"
    );

    Ok((
        StatusCode::CREATED,
        Json(ProblemResponse {
            problem,
            job: Some(handle),
        }),
    ))
}

/// PUT /problems/:id/solution - Replace the author solution
///
/// Re-judges only when the code or language actually changed.
pub async fn replace_solution(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<String>,
    Json(payload): Json<SourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let problem_id = parse_id(&problem_id, "problem")?;
    let language = parse_language(&payload.language)?;
    let mut conn = state.redis.clone();

    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let original = store::load_problem(&mut conn, &problem_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Problem {} not found", problem_id)))?;

        let mut problem = original.record.clone();
        if !problem.replace_author_solution(payload.source_code.clone(), language) {
            info!(problem_id = %problem_id, "Author solution unchanged, nothing to judge");
            return Ok(Json(ProblemResponse { problem, job: None }));
        }

        let mut tx = Transaction::new();
        tx.update_problem(&original, &problem)?;
        tx.enqueue_after_commit(problem.author_job()?);

        match tx.commit(&mut conn).await {
            Ok(handles) => {
                record_enqueued(&handles);
                let handle = only_handle(handles)?;
                info!(
                    problem_id = %problem_id,
                    job_id = %handle.job_id,
                    "Author solution replaced, re-check queued"
                );
                return Ok(Json(ProblemResponse {
                    problem,
                    job: Some(handle),
                }));
            }
            Err(StoreError::Conflict) => {
                warn!(problem_id = %problem_id, attempt, "Problem changed concurrently, retrying");
            }
            Err(e) => return Err(enqueue_failed(e)),
        }
    }

    Err(StoreError::Conflict.into())
}

/// GET /problems/:id
pub async fn get_problem(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let problem_id = parse_id(&problem_id, "problem")?;
    let mut conn = state.redis.clone();

    let problem = store::load_problem(&mut conn, &problem_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Problem {} not found", problem_id)))?;

    Ok(Json(problem.record))
}

/// POST /problems/:id/submissions - Store a submission and queue it
pub async fn create_submission(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<String>,
    Json(payload): Json<SourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let problem_id = parse_id(&problem_id, "problem")?;
    let language = parse_language(&payload.language)?;
    let mut conn = state.redis.clone();

    let problem = store::load_problem(&mut conn, &problem_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Problem {} not found", problem_id)))?
        .record;

    let submission = SubmissionRecord::new(problem_id, payload.source_code, language);
    let job = submission.job(&problem)?;

    let mut tx = Transaction::new();
    tx.insert_submission(&submission)?;
    tx.enqueue_after_commit(job);

    let handles = tx.commit(&mut conn).await.map_err(enqueue_failed)?;
    record_enqueued(&handles);
    let handle = only_handle(handles)?;

    info!(
        problem_id = %problem_id,
        submission_id = %submission.id,
        job_id = %handle.job_id,
        language = %language,
        "Submission queued"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmissionResponse {
            submission,
            job: handle,
        }),
    ))
}

/// GET /submissions/:id
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let submission_id = parse_id(&submission_id, "submission")?;
    let mut conn = state.redis.clone();

    let submission = store::load_submission(&mut conn, &submission_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Submission {} not found", submission_id)))?;

    Ok(Json(submission.record))
}

/// GET /jobs/:id - Query a job's result
///
/// 202 until a worker has stored a final verdict for the job.
pub async fn get_job_result(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_uuid = parse_id(&job_id, "job")?;
    let mut conn = state.redis.clone();

    match queue::get_result(&mut conn, &job_uuid).await? {
        Some(result) => {
            info!(job_id = %job_id, verdict = result.verdict().code(), "Job result retrieved");
            Ok((StatusCode::OK, Json(result)).into_response())
        }
        None => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": job_id,
                "status": "pending",
                "message": "Job is queued or still being judged"
            })),
        )
            .into_response()),
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut conn = state.redis.clone();
    for language in Language::ALL {
        match queue::queue_depth(&mut conn, &language).await {
            Ok(depth) => metrics::QUEUE_DEPTH
                .with_label_values(&[language.as_str()])
                .set(depth as i64),
            Err(e) => warn!(language = %language, error = %e, "Failed to sample queue depth"),
        }
    }

    match metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            ApiError::Internal(e.to_string()).into_response()
        }
    }
}
