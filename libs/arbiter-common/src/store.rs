//! Minimal durable records for the two things a judging job reports to:
//! a user's submission and a problem's author solution.
//!
//! Records are JSON documents in Redis. Writes go through [`Transaction`],
//! which applies all of its writes atomically (optionally guarded by the
//! version that was read) and only then hands its deferred jobs to the queue.

use crate::redis as queue;
use crate::types::{
    JobHandle, JobTarget, JudgeJob, JudgeRequest, JudgeResult, Language, RequestError, TestCase,
    Verdict,
};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const PROBLEM_PREFIX: &str = "arbiter:problem";
pub const SUBMISSION_PREFIX: &str = "arbiter:submission";

const MAX_UPDATE_ATTEMPTS: u32 = 5;

// KEYS: record keys. ARGV: (expected, payload) per key; an empty expected
// value means "write unconditionally".
const COMMIT_SCRIPT: &str = r"
for i, key in ipairs(KEYS) do
  local expected = ARGV[2 * i - 1]
  if expected ~= '' and redis.call('GET', key) ~= expected then
    return 0
  end
end
for i, key in ipairs(KEYS) do
  redis.call('SET', key, ARGV[2 * i])
end
return 1
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
    #[error("stored record cannot be judged: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("record was modified concurrently")]
    Conflict,
}

pub fn problem_key(id: &Uuid) -> String {
    format!("{}:{}", PROBLEM_PREFIX, id)
}

pub fn submission_key(id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub id: Uuid,
    pub time_limit_seconds: u32,
    pub memory_limit_mb: u32,
    pub test_cases: Vec<TestCase>,
    pub author_solution: String,
    pub author_language: Language,
    pub verdict: Verdict,
    pub failing_test_number: Option<u32>,
    pub diagnostic_message: Option<String>,
    /// The author solution passed every test in its current form
    pub is_correct: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProblemRecord {
    pub fn new(
        time_limit_seconds: u32,
        memory_limit_mb: u32,
        test_cases: Vec<TestCase>,
        author_solution: String,
        author_language: Language,
    ) -> Result<Self, RequestError> {
        let request = JudgeRequest::new(
            author_solution,
            author_language,
            time_limit_seconds,
            memory_limit_mb,
            test_cases,
        )?;

        Ok(Self {
            id: Uuid::new_v4(),
            time_limit_seconds,
            memory_limit_mb,
            test_cases: request.test_cases().to_vec(),
            author_solution: request.source_code().to_string(),
            author_language,
            verdict: Verdict::InQueue,
            failing_test_number: None,
            diagnostic_message: None,
            is_correct: false,
            updated_at: Utc::now(),
        })
    }

    /// A fresh request judging `source_code` against this problem's tests
    pub fn request_for(
        &self,
        source_code: &str,
        language: Language,
    ) -> Result<JudgeRequest, RequestError> {
        JudgeRequest::new(
            source_code,
            language,
            self.time_limit_seconds,
            self.memory_limit_mb,
            self.test_cases.clone(),
        )
    }

    pub fn judge_request(&self) -> Result<JudgeRequest, RequestError> {
        self.request_for(&self.author_solution, self.author_language)
    }

    pub fn author_job(&self) -> Result<JudgeJob, RequestError> {
        Ok(JudgeJob::new(
            JobTarget::AuthorSolution {
                problem_id: self.id,
            },
            self.judge_request()?,
        ))
    }

    /// Swap in new author code. Any verdict for the old code is stale from
    /// here on; returns whether the solution actually changed and therefore
    /// needs judging again.
    pub fn replace_author_solution(&mut self, code: String, language: Language) -> bool {
        if self.author_solution == code && self.author_language == language {
            return false;
        }

        self.author_solution = code;
        self.author_language = language;
        self.is_correct = false;
        self.set_result(&JudgeResult::in_queue());
        true
    }

    /// Whether `request` judged the author solution currently stored
    pub fn is_current(&self, request: &JudgeRequest) -> bool {
        self.author_solution == request.source_code() && self.author_language == request.language()
    }

    pub fn apply_result(&mut self, result: &JudgeResult) {
        if !result.verdict().is_pending() {
            self.is_correct = result.verdict() == Verdict::Accept;
        }
        self.set_result(result);
    }

    fn set_result(&mut self, result: &JudgeResult) {
        self.verdict = result.verdict();
        self.failing_test_number = result.failing_test_number();
        self.diagnostic_message = result.diagnostic_message().map(str::to_string);
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub problem_id: Uuid,
    pub source_code: String,
    pub language: Language,
    pub verdict: Verdict,
    pub failing_test_number: Option<u32>,
    pub diagnostic_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub judged_at: Option<DateTime<Utc>>,
}

impl SubmissionRecord {
    pub fn new(problem_id: Uuid, source_code: String, language: Language) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem_id,
            source_code,
            language,
            verdict: Verdict::InQueue,
            failing_test_number: None,
            diagnostic_message: None,
            submitted_at: Utc::now(),
            judged_at: None,
        }
    }

    pub fn judge_request(&self, problem: &ProblemRecord) -> Result<JudgeRequest, RequestError> {
        problem.request_for(&self.source_code, self.language)
    }

    pub fn job(&self, problem: &ProblemRecord) -> Result<JudgeJob, RequestError> {
        Ok(JudgeJob::new(
            JobTarget::Submission {
                submission_id: self.id,
            },
            self.judge_request(problem)?,
        ))
    }

    pub fn apply_result(&mut self, result: &JudgeResult) {
        self.verdict = result.verdict();
        self.failing_test_number = result.failing_test_number();
        self.diagnostic_message = result.diagnostic_message().map(str::to_string);
        self.judged_at = if result.verdict().is_pending() {
            None
        } else {
            Some(Utc::now())
        };
    }
}

/// A record together with the exact stored bytes it was decoded from, so a
/// later write can be made conditional on nobody else having written since.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub record: T,
    raw: String,
}

/// What happened to a record a worker tried to update
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    Applied,
    /// The record no longer exists
    Missing,
    /// The author solution changed after the job was queued; a newer job
    /// owns the verdict
    Stale,
}

#[derive(Debug)]
struct Write {
    key: String,
    expected: Option<String>,
    payload: String,
}

/// A batch of record writes plus the jobs that must only become visible to
/// workers once those writes are committed.
#[derive(Debug, Default)]
pub struct Transaction {
    writes: Vec<Write>,
    deferred: Vec<JudgeJob>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<T: Serialize>(
        &mut self,
        key: String,
        expected: Option<String>,
        record: &T,
    ) -> Result<&mut Self, StoreError> {
        let payload = serde_json::to_string(record)?;
        self.writes.push(Write {
            key,
            expected,
            payload,
        });
        Ok(self)
    }

    pub fn insert_problem(&mut self, record: &ProblemRecord) -> Result<&mut Self, StoreError> {
        self.write(problem_key(&record.id), None, record)
    }

    pub fn insert_submission(
        &mut self,
        record: &SubmissionRecord,
    ) -> Result<&mut Self, StoreError> {
        self.write(submission_key(&record.id), None, record)
    }

    /// Overwrite a problem, failing the whole commit if it changed since
    /// `original` was read
    pub fn update_problem(
        &mut self,
        original: &Versioned<ProblemRecord>,
        record: &ProblemRecord,
    ) -> Result<&mut Self, StoreError> {
        self.write(problem_key(&record.id), Some(original.raw.clone()), record)
    }

    pub fn update_submission(
        &mut self,
        original: &Versioned<SubmissionRecord>,
        record: &SubmissionRecord,
    ) -> Result<&mut Self, StoreError> {
        self.write(submission_key(&record.id), Some(original.raw.clone()), record)
    }

    /// Queue `job` once the writes of this transaction are visible
    pub fn enqueue_after_commit(&mut self, job: JudgeJob) -> &mut Self {
        self.deferred.push(job);
        self
    }

    /// Apply every write atomically, then enqueue the deferred jobs.
    ///
    /// Returns [`StoreError::Conflict`] (and enqueues nothing) if any guarded
    /// record changed since it was read.
    pub async fn commit(self, conn: &mut ConnectionManager) -> Result<Vec<JobHandle>, StoreError> {
        if !self.writes.is_empty() {
            let script = redis::Script::new(COMMIT_SCRIPT);
            let mut invocation = script.prepare_invoke();
            for write in &self.writes {
                invocation.key(&write.key);
                invocation.arg(write.expected.as_deref().unwrap_or(""));
                invocation.arg(&write.payload);
            }

            let applied: i64 = invocation.invoke_async(conn).await?;
            if applied == 0 {
                return Err(StoreError::Conflict);
            }
        }

        let mut handles = Vec::with_capacity(self.deferred.len());
        for job in &self.deferred {
            handles.push(queue::enqueue(conn, job).await?);
        }
        Ok(handles)
    }
}

async fn load<T: DeserializeOwned>(
    conn: &mut ConnectionManager,
    key: &str,
) -> Result<Option<Versioned<T>>, StoreError> {
    let raw: Option<String> = conn.get(key).await?;
    match raw {
        Some(raw) => {
            let record = serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })?;
            Ok(Some(Versioned { record, raw }))
        }
        None => Ok(None),
    }
}

pub async fn load_problem(
    conn: &mut ConnectionManager,
    id: &Uuid,
) -> Result<Option<Versioned<ProblemRecord>>, StoreError> {
    load(conn, &problem_key(id)).await
}

pub async fn load_submission(
    conn: &mut ConnectionManager,
    id: &Uuid,
) -> Result<Option<Versioned<SubmissionRecord>>, StoreError> {
    load(conn, &submission_key(id)).await
}

enum Updated {
    Written,
    Skipped,
    Missing,
}

/// Read-modify-write with optimistic retries. `f` returns false to leave
/// the record untouched.
async fn update_record<T, F>(
    conn: &mut ConnectionManager,
    key: &str,
    mut f: F,
) -> Result<Updated, StoreError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> bool,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let Some(original) = load::<T>(conn, key).await? else {
            return Ok(Updated::Missing);
        };

        let Versioned { mut record, raw } = original;
        if !f(&mut record) {
            return Ok(Updated::Skipped);
        }

        let mut tx = Transaction::new();
        tx.write(key.to_string(), Some(raw), &record)?;
        match tx.commit(conn).await {
            Ok(_) => return Ok(Updated::Written),
            Err(StoreError::Conflict) => {
                debug!(key, attempt, "Record changed during update, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Conflict)
}

/// Write a (pending or final) result onto the record targeted by `job`
pub async fn apply_result(
    conn: &mut ConnectionManager,
    job: &JudgeJob,
    result: &JudgeResult,
) -> Result<RecordUpdate, StoreError> {
    let updated = match job.target {
        JobTarget::Submission { submission_id } => {
            update_record(conn, &submission_key(&submission_id), |s: &mut SubmissionRecord| {
                s.apply_result(result);
                true
            })
            .await?
        }
        JobTarget::AuthorSolution { problem_id } => {
            update_record(conn, &problem_key(&problem_id), |p: &mut ProblemRecord| {
                if !p.is_current(&job.request) {
                    return false;
                }
                p.apply_result(result);
                true
            })
            .await?
        }
    };

    Ok(match updated {
        Updated::Written => RecordUpdate::Applied,
        Updated::Skipped => RecordUpdate::Stale,
        Updated::Missing => RecordUpdate::Missing,
    })
}
