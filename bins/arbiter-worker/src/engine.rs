/// Judging Engine - turns a `JudgeRequest` into a `JudgeResult`
///
/// **Critical Architectural Boundary:**
/// - Engine sequences tests and decides verdicts
/// - Engine does NOT know how programs are isolated (that is the injected
///   `SandboxProvider`)
/// - Engine does NOT know about Redis or records
///
/// Tests run strictly in `sequence_number` order; the first failure ends
/// the run. Infrastructure failures become CompilationError results, never
/// errors, so a job always ends with a verdict.
use crate::evaluator::{memory_limit_message, outputs_match, time_limit_message, wrong_answer_message};
use crate::runner::{self, RunOutcome};
use crate::sandbox::{Sandbox, SandboxError, SandboxProvider};
use arbiter_common::types::{JudgeRequest, JudgeResult, TestCase, Verdict};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub const UNSUPPORTED_LANGUAGE_MESSAGE: &str = "language not supported by judging system";

/// Progress of one judging run. Transitions only move forward and exactly
/// one terminal state is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeState {
    NotStarted,
    /// Test `test_number` has run and passed
    Running { test_number: u32 },
    Accepted,
    Failed {
        verdict: Verdict,
        test_number: u32,
        diagnostic: Option<String>,
    },
}

impl JudgeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JudgeState::Accepted | JudgeState::Failed { .. })
    }

    /// Fold the outcome of `test` into the state
    pub fn advance(self, test: &TestCase, outcome: RunOutcome) -> Self {
        let test_number = test.sequence_number();
        if self.is_terminal() {
            return self;
        }
        if let JudgeState::Running { test_number: previous } = &self {
            debug_assert!(test_number > *previous, "tests must run in order");
        }

        match outcome {
            RunOutcome::TimedOut => JudgeState::Failed {
                verdict: Verdict::TimeLimitExceeded,
                test_number,
                diagnostic: Some(time_limit_message(test_number)),
            },
            RunOutcome::MemoryExceeded => JudgeState::Failed {
                verdict: Verdict::MemoryLimitExceeded,
                test_number,
                diagnostic: Some(memory_limit_message(test_number)),
            },
            RunOutcome::Crashed(diagnostic) => JudgeState::Failed {
                verdict: Verdict::RuntimeError,
                test_number,
                diagnostic: Some(diagnostic),
            },
            RunOutcome::Completed(stdout) => {
                if outputs_match(&stdout, test.expected_output()) {
                    JudgeState::Running { test_number }
                } else {
                    JudgeState::Failed {
                        verdict: Verdict::WrongAnswer,
                        test_number,
                        diagnostic: Some(wrong_answer_message(
                            test_number,
                            &stdout,
                            test.expected_output(),
                        )),
                    }
                }
            }
        }
    }

    /// Every test has run: a run that has not failed is accepted
    pub fn finish(self) -> Self {
        match self {
            JudgeState::NotStarted | JudgeState::Running { .. } => JudgeState::Accepted,
            terminal => terminal,
        }
    }

    pub fn into_result(self) -> JudgeResult {
        match self.finish() {
            JudgeState::Failed {
                verdict,
                test_number,
                diagnostic,
            } => JudgeResult::failed(verdict, test_number, diagnostic),
            _ => JudgeResult::accepted(),
        }
    }
}

/// Holds the sandbox capability, constructed once at worker start-up
pub struct JudgingEngine {
    provider: Arc<dyn SandboxProvider>,
}

impl JudgingEngine {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self { provider }
    }

    #[instrument(
        skip_all,
        fields(language = %request.language(), test_count = request.test_cases().len())
    )]
    pub async fn judge(&self, request: &JudgeRequest) -> JudgeResult {
        let start = Instant::now();
        let first_test = request.test_cases().first().map(TestCase::sequence_number);

        let mut sandbox = match self.provider.acquire(request.language()).await {
            Ok(sandbox) => sandbox,
            Err(SandboxError::UnsupportedLanguage(language)) => {
                warn!(language = %language, "No runtime registered for language");
                return JudgeResult::compilation_error(first_test, UNSUPPORTED_LANGUAGE_MESSAGE);
            }
            Err(e) => {
                error!(error = %e, "Failed to provision sandbox");
                return JudgeResult::compilation_error(first_test, e.to_string());
            }
        };

        let result = self.run_tests(sandbox.as_mut(), request).await;

        if let Err(e) = sandbox.release().await {
            warn!(error = %e, "Failed to release sandbox");
        }

        info!(
            verdict = result.verdict().code(),
            failing_test = ?result.failing_test_number(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Judging finished"
        );

        result
    }

    async fn run_tests(&self, sandbox: &mut dyn Sandbox, request: &JudgeRequest) -> JudgeResult {
        let mut state = JudgeState::NotStarted;

        for test in request.test_cases() {
            let outcome = match runner::run_one(
                sandbox,
                request.source_code(),
                test.input_data(),
                request.time_limit_seconds(),
                request.memory_limit_mb(),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(test = test.sequence_number(), error = %e, "Sandbox failed while running test");
                    return JudgeResult::compilation_error(Some(test.sequence_number()), e.to_string());
                }
            };

            debug!(test = test.sequence_number(), outcome = outcome.kind(), "Test finished");

            state = state.advance(test, outcome);
            if state.is_terminal() {
                break;
            }
        }

        state.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Execution, Limits};
    use arbiter_common::types::Language;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Decides what a "program" does with a given input
    type Script = dyn Fn(&str) -> Result<Execution, SandboxError> + Send + Sync;

    #[derive(Default)]
    struct Counters {
        acquired: AtomicUsize,
        executed: AtomicUsize,
        released: AtomicUsize,
    }

    struct ScriptedProvider {
        script: Arc<Script>,
        counters: Arc<Counters>,
        acquire_error: Option<fn() -> SandboxError>,
    }

    struct ScriptedSandbox {
        script: Arc<Script>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl SandboxProvider for ScriptedProvider {
        async fn acquire(&self, _language: Language) -> Result<Box<dyn Sandbox>, SandboxError> {
            if let Some(make_error) = self.acquire_error {
                return Err(make_error());
            }
            self.counters.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSandbox {
                script: self.script.clone(),
                counters: self.counters.clone(),
            }))
        }
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn execute(
            &mut self,
            _source_code: &str,
            input: &str,
            _limits: Limits,
        ) -> Result<Execution, SandboxError> {
            self.counters.executed.fetch_add(1, Ordering::SeqCst);
            (self.script)(input)
        }

        async fn release(&mut self) -> Result<(), SandboxError> {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn exited(stdout: &str) -> Result<Execution, SandboxError> {
        Ok(Execution {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            elapsed: Duration::from_millis(5),
            ..Default::default()
        })
    }

    /// `print(input())`
    fn echo(input: &str) -> Result<Execution, SandboxError> {
        exited(input)
    }

    fn make_engine(
        script: impl Fn(&str) -> Result<Execution, SandboxError> + Send + Sync + 'static,
    ) -> (JudgingEngine, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let provider = ScriptedProvider {
            script: Arc::new(script),
            counters: counters.clone(),
            acquire_error: None,
        };
        (JudgingEngine::new(Arc::new(provider)), counters)
    }

    fn make_request(tests: &[(&str, &str)]) -> JudgeRequest {
        let test_cases = tests
            .iter()
            .enumerate()
            .map(|(i, (input, expected))| TestCase::new(i as u32 + 1, *input, *expected))
            .collect();
        JudgeRequest::new("print(input())", Language::Python311, 1, 64, test_cases).unwrap()
    }

    #[tokio::test]
    async fn test_zero_tests_is_accepted() {
        let (engine, counters) = make_engine(echo);
        let result = engine.judge(&make_request(&[])).await;

        assert_eq!(result, JudgeResult::accepted());
        assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_match_is_accepted() {
        let (engine, counters) = make_engine(echo);
        let result = engine
            .judge(&make_request(&[("1", "1\n"), ("  2\n", "2"), ("3", "3")]))
            .await;

        assert_eq!(result.verdict(), Verdict::Accept);
        assert_eq!(result.failing_test_number(), None);
        assert_eq!(result.diagnostic_message(), None);
        assert_eq!(counters.executed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wrong_answer_stops_at_first_mismatch() {
        let (engine, counters) = make_engine(echo);
        let result = engine
            .judge(&make_request(&[("1", "1"), ("2", "3"), ("4", "4"), ("5", "6")]))
            .await;

        assert_eq!(result.verdict(), Verdict::WrongAnswer);
        assert_eq!(result.failing_test_number(), Some(2));
        assert_eq!(
            result.diagnostic_message(),
            Some("Wrong answer on test 2: received \"2\", expected \"3\"")
        );
        assert_eq!(counters.executed.load(Ordering::SeqCst), 2);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tests_run_in_sequence_order() {
        let (engine, _) = make_engine(echo);
        // Submitted out of order; test 1 is the mismatch
        let request = JudgeRequest::new(
            "print(input())",
            Language::Python311,
            1,
            64,
            vec![TestCase::new(2, "b", "b"), TestCase::new(1, "a", "z")],
        )
        .unwrap();

        let result = engine.judge(&request).await;
        assert_eq!(result.failing_test_number(), Some(1));
    }

    #[tokio::test]
    async fn test_timeout_is_time_limit_exceeded() {
        let (engine, counters) = make_engine(|_| {
            Ok(Execution {
                timed_out: true,
                ..Default::default()
            })
        });
        let result = engine.judge(&make_request(&[("1", "1"), ("2", "2")])).await;

        assert_eq!(result.verdict(), Verdict::TimeLimitExceeded);
        assert_eq!(result.failing_test_number(), Some(1));
        assert_eq!(
            result.diagnostic_message(),
            Some("Time limit exceeded on test 1")
        );
        assert_eq!(counters.executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_error_is_memory_limit_exceeded() {
        let (engine, _) = make_engine(|input| {
            if input == "big" {
                Ok(Execution {
                    stderr: "Traceback (most recent call last):\nMemoryError\n".to_string(),
                    exit_code: Some(1),
                    ..Default::default()
                })
            } else {
                echo(input)
            }
        });
        let result = engine
            .judge(&make_request(&[("small", "small"), ("big", "big")]))
            .await;

        assert_eq!(result.verdict(), Verdict::MemoryLimitExceeded);
        assert_eq!(result.failing_test_number(), Some(2));
        assert_eq!(
            result.diagnostic_message(),
            Some("Memory limit exceeded on test 2")
        );
    }

    #[tokio::test]
    async fn test_crash_is_runtime_error_with_diagnostic() {
        let (engine, _) = make_engine(|_| {
            Ok(Execution {
                stderr: "Traceback (most recent call last):\n  File \"main.py\", line 1\nZeroDivisionError: division by zero\n".to_string(),
                exit_code: Some(1),
                ..Default::default()
            })
        });
        let result = engine.judge(&make_request(&[("1", "1")])).await;

        assert_eq!(result.verdict(), Verdict::RuntimeError);
        assert_eq!(result.failing_test_number(), Some(1));
        assert_eq!(
            result.diagnostic_message(),
            Some("division by zero ZeroDivisionError")
        );
    }

    #[tokio::test]
    async fn test_unsupported_language_is_compilation_error() {
        let counters = Arc::new(Counters::default());
        let provider = ScriptedProvider {
            script: Arc::new(echo),
            counters: counters.clone(),
            acquire_error: Some(|| SandboxError::UnsupportedLanguage(Language::Python311)),
        };
        let engine = JudgingEngine::new(Arc::new(provider));

        let result = engine.judge(&make_request(&[("1", "1")])).await;

        assert_eq!(result.verdict(), Verdict::CompilationError);
        assert_eq!(result.failing_test_number(), Some(1));
        assert_eq!(result.diagnostic_message(), Some(UNSUPPORTED_LANGUAGE_MESSAGE));
        assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provision_failure_is_compilation_error() {
        let provider = ScriptedProvider {
            script: Arc::new(echo),
            counters: Arc::new(Counters::default()),
            acquire_error: Some(|| SandboxError::Provision("no daemon".to_string())),
        };
        let engine = JudgingEngine::new(Arc::new(provider));

        let result = engine.judge(&make_request(&[])).await;

        assert_eq!(result.verdict(), Verdict::CompilationError);
        assert_eq!(result.failing_test_number(), None);
        assert_eq!(
            result.diagnostic_message(),
            Some("failed to provision sandbox: no daemon")
        );
    }

    #[tokio::test]
    async fn test_sandbox_failure_mid_run_is_compilation_error_and_releases() {
        let (engine, counters) = make_engine(|input| {
            if input == "2" {
                Err(SandboxError::Execution("container vanished".to_string()))
            } else {
                echo(input)
            }
        });
        let result = engine
            .judge(&make_request(&[("1", "1"), ("2", "2"), ("3", "3")]))
            .await;

        assert_eq!(result.verdict(), Verdict::CompilationError);
        assert_eq!(result.failing_test_number(), Some(2));
        assert_eq!(
            result.diagnostic_message(),
            Some("sandbox execution failed: container vanished")
        );
        assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_judging_is_repeatable() {
        let (engine, _) = make_engine(echo);
        let request = make_request(&[("1", "1"), ("2", "3")]);

        let first = engine.judge(&request).await;
        let second = engine.judge(&request).await;
        assert_eq!(first, second);
    }

    #[test]
    fn test_state_machine_only_moves_forward() {
        let first = TestCase::new(1, "1", "1");
        let second = TestCase::new(2, "2", "2");

        let state = JudgeState::NotStarted.advance(&first, RunOutcome::Completed("1".to_string()));
        assert_eq!(state, JudgeState::Running { test_number: 1 });

        let failed = state.advance(&second, RunOutcome::TimedOut);
        assert!(failed.is_terminal());

        // Once terminal, further outcomes are ignored
        let still_failed = failed
            .clone()
            .advance(&TestCase::new(3, "3", "3"), RunOutcome::Completed("3".to_string()));
        assert_eq!(still_failed, failed);
        assert_eq!(still_failed.clone().finish(), failed);
    }

    #[test]
    fn test_finish_without_failure_is_accepted() {
        assert_eq!(JudgeState::NotStarted.finish(), JudgeState::Accepted);
        assert_eq!(
            JudgeState::Running { test_number: 4 }.into_result(),
            JudgeResult::accepted()
        );
        let accepted = JudgeState::Accepted.advance(
            &TestCase::new(1, "", "x"),
            RunOutcome::Completed(String::new()),
        );
        assert_eq!(accepted, JudgeState::Accepted);
    }
}
