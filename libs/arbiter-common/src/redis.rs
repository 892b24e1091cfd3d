//! Redis queue semantics shared by the API (producer) and the worker
//! (consumer), so key names never drift between the two.
//!
//! Delivery is at-least-once: a claimed job sits in the processing list and
//! the in-flight set until it is acked. If its visibility deadline passes
//! first, the reaper puts it back on the pending list.

use crate::types::{JobHandle, JudgeJob, JudgeResult, Language};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use tracing::warn;

pub const QUEUE_PREFIX: &str = "arbiter:queue";
pub const PROCESSING_PREFIX: &str = "arbiter:processing";
pub const INFLIGHT_PREFIX: &str = "arbiter:inflight";
pub const RESULT_PREFIX: &str = "arbiter:result";
pub const DELIVERIES_KEY: &str = "arbiter:deliveries";
pub const DEAD_LETTER_KEY: &str = "arbiter:dead";

// KEYS: pending, processing, inflight, deliveries. ARGV: deadline (ms).
const CLAIM_SCRIPT: &str = r"
local payload = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if not payload then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[1], payload)
local deliveries = 1
local ok, decoded = pcall(cjson.decode, payload)
if ok and type(decoded) == 'table' and decoded['id'] then
  deliveries = redis.call('HINCRBY', KEYS[4], decoded['id'], 1)
end
return {payload, deliveries}
";

// KEYS: inflight, processing, pending. ARGV: now (ms).
const REAP_SCRIPT: &str = r"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, payload in ipairs(expired) do
  redis.call('ZREM', KEYS[1], payload)
  redis.call('LREM', KEYS[2], 1, payload)
  redis.call('RPUSH', KEYS[3], payload)
end
return #expired
";

// KEYS: processing, inflight, dead letters, deliveries. ARGV: payload.
// Drops the delivery count CLAIM_SCRIPT may have started for the payload.
const DISCARD_SCRIPT: &str = r"
redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[1])
local ok, decoded = pcall(cjson.decode, ARGV[1])
if ok and type(decoded) == 'table' and decoded['id'] then
  redis.call('HDEL', KEYS[4], decoded['id'])
end
return 1
";

/// Pending jobs for a language
pub fn queue_name(language: &Language) -> String {
    format!("{}:{}", QUEUE_PREFIX, language)
}

/// Jobs claimed by some worker and not yet acked
pub fn processing_name(language: &Language) -> String {
    format!("{}:{}", PROCESSING_PREFIX, language)
}

/// Visibility deadlines of claimed jobs, scored in unix milliseconds
pub fn inflight_name(language: &Language) -> String {
    format!("{}:{}", INFLIGHT_PREFIX, language)
}

pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

/// A job taken off the pending list, together with the exact payload that
/// identifies it in the processing structures.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JudgeJob,
    pub payload: String,
    /// How many times this job has been handed to a worker, this one included
    pub deliveries: u32,
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialization error",
        e.to_string(),
    ))
}

fn deadline_after(visibility: Duration) -> i64 {
    chrono::Utc::now().timestamp_millis() + visibility.as_millis() as i64
}

/// Push a job to its language queue (RPUSH, FIFO)
pub async fn push_job(conn: &mut ConnectionManager, job: &JudgeJob) -> RedisResult<()> {
    let queue = queue_name(&job.request.language());
    let payload = serde_json::to_string(job).map_err(serialization_error)?;

    conn.rpush(&queue, payload).await
}

/// Hand a job to the worker pool. Returns as soon as the job is queued.
pub async fn enqueue(conn: &mut ConnectionManager, job: &JudgeJob) -> RedisResult<JobHandle> {
    push_job(conn, job).await?;
    Ok(job.handle())
}

/// Atomically move the oldest pending job into the processing list and
/// start its visibility timer.
///
/// Payloads that do not decode are dead-lettered immediately so they cannot
/// wedge the queue.
pub async fn claim_job(
    conn: &mut ConnectionManager,
    language: &Language,
    visibility: Duration,
) -> RedisResult<Option<ClaimedJob>> {
    let claimed: Option<(String, u32)> = redis::Script::new(CLAIM_SCRIPT)
        .key(queue_name(language))
        .key(processing_name(language))
        .key(inflight_name(language))
        .key(DELIVERIES_KEY)
        .arg(deadline_after(visibility))
        .invoke_async(conn)
        .await?;

    let Some((payload, deliveries)) = claimed else {
        return Ok(None);
    };

    match serde_json::from_str::<JudgeJob>(&payload) {
        Ok(job) => Ok(Some(ClaimedJob {
            job,
            payload,
            deliveries,
        })),
        Err(e) => {
            warn!(language = %language, error = %e, "Dead-lettering undecodable job payload");
            discard_payload(conn, language, &payload).await?;
            Ok(None)
        }
    }
}

async fn discard_payload(
    conn: &mut ConnectionManager,
    language: &Language,
    payload: &str,
) -> RedisResult<()> {
    let _: i64 = redis::Script::new(DISCARD_SCRIPT)
        .key(processing_name(language))
        .key(inflight_name(language))
        .key(DEAD_LETTER_KEY)
        .key(DELIVERIES_KEY)
        .arg(payload)
        .invoke_async(conn)
        .await?;
    Ok(())
}

/// Push the visibility deadline of a claimed job further out. A no-op if
/// the job was already reaped or acked.
pub async fn extend_lease(
    conn: &mut ConnectionManager,
    claimed: &ClaimedJob,
    visibility: Duration,
) -> RedisResult<()> {
    redis::cmd("ZADD")
        .arg(inflight_name(&claimed.job.request.language()))
        .arg("XX")
        .arg(deadline_after(visibility))
        .arg(&claimed.payload)
        .query_async(conn)
        .await
}

/// Mark a claimed job as done
pub async fn ack_job(conn: &mut ConnectionManager, claimed: &ClaimedJob) -> RedisResult<()> {
    let language = claimed.job.request.language();
    redis::pipe()
        .atomic()
        .lrem(processing_name(&language), 1, &claimed.payload)
        .ignore()
        .zrem(inflight_name(&language), &claimed.payload)
        .ignore()
        .hdel(DELIVERIES_KEY, claimed.job.id.to_string())
        .ignore()
        .query_async(conn)
        .await
}

/// Give up on a job that keeps failing to complete
pub async fn dead_letter(conn: &mut ConnectionManager, claimed: &ClaimedJob) -> RedisResult<()> {
    let language = claimed.job.request.language();
    redis::pipe()
        .atomic()
        .lrem(processing_name(&language), 1, &claimed.payload)
        .ignore()
        .zrem(inflight_name(&language), &claimed.payload)
        .ignore()
        .hdel(DELIVERIES_KEY, claimed.job.id.to_string())
        .ignore()
        .rpush(DEAD_LETTER_KEY, &claimed.payload)
        .ignore()
        .query_async(conn)
        .await
}

/// Return every job whose visibility deadline has passed to the pending
/// list. Returns how many were requeued.
pub async fn requeue_expired(conn: &mut ConnectionManager, language: &Language) -> RedisResult<usize> {
    redis::Script::new(REAP_SCRIPT)
        .key(inflight_name(language))
        .key(processing_name(language))
        .key(queue_name(language))
        .arg(chrono::Utc::now().timestamp_millis())
        .invoke_async(conn)
        .await
}

/// Number of jobs waiting to be claimed
pub async fn queue_depth(conn: &mut ConnectionManager, language: &Language) -> RedisResult<usize> {
    conn.llen(queue_name(language)).await
}

/// Store a job's result for lookup by job id
pub async fn store_result(
    conn: &mut ConnectionManager,
    job_id: &uuid::Uuid,
    result: &JudgeResult,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let payload = serde_json::to_string(result).map_err(serialization_error)?;
    conn.set_ex(result_key(job_id), payload, ttl_seconds as _).await
}

pub async fn get_result(
    conn: &mut ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JudgeResult>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let result = serde_json::from_str(&data).map_err(serialization_error)?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}
