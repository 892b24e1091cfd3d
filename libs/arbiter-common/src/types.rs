use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const MIN_TIME_LIMIT_SECONDS: u32 = 1;
pub const MAX_TIME_LIMIT_SECONDS: u32 = 10;
pub const MIN_MEMORY_LIMIT_MB: u32 = 64;
pub const MAX_MEMORY_LIMIT_MB: u32 = 1024;

/// Languages the judge knows how to name.
///
/// Whether a language can actually be judged is decided by the worker's
/// language registry; a known language without a registered runtime is
/// judged as a compilation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "python3.11", alias = "Py3.11")]
    Python311,
}

impl Language {
    pub const ALL: [Language; 1] = [Language::Python311];

    /// Stable identifier used on the wire, in queue names and in languages.json
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python311 => "python3.11",
        }
    }

}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python3.11" | "py3.11" | "python 3.11" => Ok(Language::Python311),
            _ => Err(RequestError::UnknownLanguage(s.to_string())),
        }
    }
}

/// Final classification of a judging run, plus the two pending states a
/// stored record passes through before it is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accept,
    #[serde(rename = "CE")]
    CompilationError,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TL")]
    TimeLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "ML")]
    MemoryLimitExceeded,
    #[default]
    #[serde(rename = "IQ")]
    InQueue,
    #[serde(rename = "IP")]
    InProcessing,
}

impl Verdict {
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Accept => "AC",
            Verdict::CompilationError => "CE",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TL",
            Verdict::RuntimeError => "RE",
            Verdict::MemoryLimitExceeded => "ML",
            Verdict::InQueue => "IQ",
            Verdict::InProcessing => "IP",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Verdict::InQueue | Verdict::InProcessing)
    }

    /// Verdicts that name a failing test case
    pub fn is_failure(&self) -> bool {
        !self.is_pending() && *self != Verdict::Accept
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Accept => "Accepted",
            Verdict::CompilationError => "Compilation Error",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceeded",
            Verdict::InQueue => "In Queue",
            Verdict::InProcessing => "In Processing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("time limit must be between 1 and 10 seconds, got {got}")]
    TimeLimitOutOfRange { got: u32 },
    #[error("memory limit must be between 64 and 1024 MB, got {got}")]
    MemoryLimitOutOfRange { got: u32 },
    #[error("test case sequence numbers must be positive")]
    ZeroSequenceNumber,
    #[error("duplicate test case sequence number {0}")]
    DuplicateSequenceNumber(u32),
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
}

/// One input / expected-output pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    sequence_number: u32,
    input_data: String,
    expected_output: String,
}

impl TestCase {
    pub fn new(
        sequence_number: u32,
        input_data: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            sequence_number,
            input_data: input_data.into(),
            expected_output: expected_output.into(),
        }
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn input_data(&self) -> &str {
        &self.input_data
    }

    pub fn expected_output(&self) -> &str {
        &self.expected_output
    }
}

/// Input to one judging run.
///
/// Validated on construction and on deserialization, so a value of this
/// type always has in-range limits and test cases sorted by unique,
/// positive sequence numbers. There are no setters: a re-run builds a new
/// request from the stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJudgeRequest")]
pub struct JudgeRequest {
    source_code: String,
    language: Language,
    time_limit_seconds: u32,
    memory_limit_mb: u32,
    test_cases: Vec<TestCase>,
}

#[derive(Deserialize)]
struct RawJudgeRequest {
    source_code: String,
    language: Language,
    time_limit_seconds: u32,
    memory_limit_mb: u32,
    #[serde(default)]
    test_cases: Vec<TestCase>,
}

impl TryFrom<RawJudgeRequest> for JudgeRequest {
    type Error = RequestError;

    fn try_from(raw: RawJudgeRequest) -> Result<Self, Self::Error> {
        JudgeRequest::new(
            raw.source_code,
            raw.language,
            raw.time_limit_seconds,
            raw.memory_limit_mb,
            raw.test_cases,
        )
    }
}

impl JudgeRequest {
    pub fn new(
        source_code: impl Into<String>,
        language: Language,
        time_limit_seconds: u32,
        memory_limit_mb: u32,
        mut test_cases: Vec<TestCase>,
    ) -> Result<Self, RequestError> {
        if !(MIN_TIME_LIMIT_SECONDS..=MAX_TIME_LIMIT_SECONDS).contains(&time_limit_seconds) {
            return Err(RequestError::TimeLimitOutOfRange {
                got: time_limit_seconds,
            });
        }
        if !(MIN_MEMORY_LIMIT_MB..=MAX_MEMORY_LIMIT_MB).contains(&memory_limit_mb) {
            return Err(RequestError::MemoryLimitOutOfRange {
                got: memory_limit_mb,
            });
        }

        let mut seen = HashSet::with_capacity(test_cases.len());
        for test in &test_cases {
            if test.sequence_number == 0 {
                return Err(RequestError::ZeroSequenceNumber);
            }
            if !seen.insert(test.sequence_number) {
                return Err(RequestError::DuplicateSequenceNumber(test.sequence_number));
            }
        }
        test_cases.sort_by_key(|t| t.sequence_number);

        Ok(Self {
            source_code: source_code.into(),
            language,
            time_limit_seconds,
            memory_limit_mb,
            test_cases,
        })
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn time_limit_seconds(&self) -> u32 {
        self.time_limit_seconds
    }

    pub fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }

    /// Test cases in run order
    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }
}

/// Output of one judging run.
///
/// `failing_test_number` is present for every failure except a compilation
/// error on a request with no tests; the constructors are the only way to
/// build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeResult {
    verdict: Verdict,
    failing_test_number: Option<u32>,
    diagnostic_message: Option<String>,
}

impl JudgeResult {
    pub fn accepted() -> Self {
        Self {
            verdict: Verdict::Accept,
            failing_test_number: None,
            diagnostic_message: None,
        }
    }

    pub fn in_queue() -> Self {
        Self {
            verdict: Verdict::InQueue,
            failing_test_number: None,
            diagnostic_message: None,
        }
    }

    pub fn in_processing() -> Self {
        Self {
            verdict: Verdict::InProcessing,
            failing_test_number: None,
            diagnostic_message: None,
        }
    }

    /// A failing verdict pinned to the test case it failed on
    pub fn failed(verdict: Verdict, test_number: u32, diagnostic: Option<String>) -> Self {
        debug_assert!(verdict.is_failure(), "{verdict:?} is not a failure verdict");
        Self {
            verdict,
            failing_test_number: Some(test_number),
            diagnostic_message: diagnostic,
        }
    }

    /// The judge could not run the program at all.
    ///
    /// `test_number` is the test that was about to run, or `None` when the
    /// request has no test cases.
    pub fn compilation_error(test_number: Option<u32>, diagnostic: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::CompilationError,
            failing_test_number: test_number,
            diagnostic_message: Some(diagnostic.into()),
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn failing_test_number(&self) -> Option<u32> {
        self.failing_test_number
    }

    pub fn diagnostic_message(&self) -> Option<&str> {
        self.diagnostic_message.as_deref()
    }
}

/// Which stored record receives a job's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTarget {
    Submission { submission_id: Uuid },
    AuthorSolution { problem_id: Uuid },
}

impl JobTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            JobTarget::Submission { .. } => "submission",
            JobTarget::AuthorSolution { .. } => "author_solution",
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTarget::Submission { submission_id } => write!(f, "submission:{}", submission_id),
            JobTarget::AuthorSolution { problem_id } => write!(f, "author_solution:{}", problem_id),
        }
    }
}

/// Unit of work carried by the dispatch queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeJob {
    pub id: Uuid,
    pub target: JobTarget,
    pub request: JudgeRequest,
    pub enqueued_at: DateTime<Utc>,
}

impl JudgeJob {
    pub fn new(target: JobTarget, request: JudgeRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            request,
            enqueued_at: Utc::now(),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.id,
            target: self.target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub target: JobTarget,
}
