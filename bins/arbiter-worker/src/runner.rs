/// Isolation runner - one program, one test case, one outcome
///
/// Turns what a sandbox observed into a `RunOutcome`. Classification order:
/// timeout, memory exhaustion, clean exit, crash.
use crate::evaluator::truncate_chars;
use crate::sandbox::{Execution, Limits, Sandbox, SandboxError};

/// Safety limits to keep pathological inputs out of the sandbox
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

pub const MAX_DIAGNOSTIC_CHARS: usize = 1024;

/// Markers an interpreter prints when an allocation hits the address-space cap
const MEMORY_ERROR_MARKERS: &[&str] = &["MemoryError", "Cannot allocate memory", "std::bad_alloc"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(String),
    TimedOut,
    MemoryExceeded,
    Crashed(String),
}

impl RunOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::TimedOut => "timed_out",
            RunOutcome::MemoryExceeded => "memory_exceeded",
            RunOutcome::Crashed(_) => "crashed",
        }
    }
}

/// Run `source_code` once against `input_data` in `sandbox`
pub async fn run_one(
    sandbox: &mut dyn Sandbox,
    source_code: &str,
    input_data: &str,
    time_limit_seconds: u32,
    memory_limit_mb: u32,
) -> Result<RunOutcome, SandboxError> {
    if source_code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(SandboxError::Execution(format!(
            "source code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }
    if input_data.len() > MAX_TEST_INPUT_BYTES {
        return Err(SandboxError::Execution(format!(
            "test input exceeds maximum size of {} bytes",
            MAX_TEST_INPUT_BYTES
        )));
    }

    let limits = Limits {
        time_limit_seconds,
        memory_limit_mb,
    };
    let execution = sandbox.execute(source_code, input_data, limits).await?;

    Ok(classify(execution))
}

pub fn classify(execution: Execution) -> RunOutcome {
    if execution.timed_out {
        return RunOutcome::TimedOut;
    }
    if execution.oom_killed {
        return RunOutcome::MemoryExceeded;
    }
    if execution.exit_code == Some(0) {
        return RunOutcome::Completed(execution.stdout);
    }
    if is_memory_error(&execution.stderr) {
        return RunOutcome::MemoryExceeded;
    }

    RunOutcome::Crashed(diagnose(&execution.stderr, execution.exit_code))
}

fn is_memory_error(stderr: &str) -> bool {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map_or(false, |last| {
            MEMORY_ERROR_MARKERS
                .iter()
                .any(|marker| last.contains(marker))
        })
}

/// Short description of a crash: `"<message> <ExceptionClass>"` from the
/// final traceback line, or the exit status when nothing was printed.
pub fn diagnose(stderr: &str, exit_code: Option<i64>) -> String {
    let last_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());

    let message = match last_line {
        Some(line) => match parse_exception_line(line) {
            Some((class, "")) => class.to_string(),
            Some((class, message)) => format!("{} {}", message, class),
            None => line.to_string(),
        },
        None => match exit_code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated abnormally".to_string(),
        },
    };

    truncate_chars(&message, MAX_DIAGNOSTIC_CHARS)
}

/// Split `"pkg.ClassName: message"` into `("ClassName", "message")`
fn parse_exception_line(line: &str) -> Option<(&str, &str)> {
    let (head, message) = match line.split_once(':') {
        Some((head, message)) => (head, message.trim()),
        None => (line, ""),
    };

    let looks_like_class = !head.is_empty()
        && head
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    if !looks_like_class {
        return None;
    }

    let class = head.rsplit('.').next()?;
    class
        .chars()
        .next()
        .filter(|c| c.is_uppercase())
        .map(|_| (class, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    fn make_execution(exit_code: Option<i64>, stdout: &str, stderr: &str) -> Execution {
        Execution {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            elapsed: Duration::from_millis(10),
            ..Default::default()
        }
    }

    const ZERO_DIVISION: &str = "Traceback (most recent call last):\n  File \"/sandbox/main.py\", line 1, in <module>\n    print(1 / 0)\n          ~~^~~\nZeroDivisionError: division by zero\n";

    #[test]
    fn test_clean_exit_is_completed() {
        let outcome = classify(make_execution(Some(0), "42\n", ""));
        assert_eq!(outcome, RunOutcome::Completed("42\n".to_string()));
    }

    #[test]
    fn test_clean_exit_with_warnings_is_completed() {
        let outcome = classify(make_execution(Some(0), "1", "DeprecationWarning: old\n"));
        assert_eq!(outcome, RunOutcome::Completed("1".to_string()));
    }

    #[test]
    fn test_timeout_wins_over_everything() {
        let mut execution = make_execution(None, "partial", "");
        execution.timed_out = true;
        execution.oom_killed = true;
        assert_eq!(classify(execution), RunOutcome::TimedOut);
    }

    #[test]
    fn test_oom_killed_is_memory_exceeded() {
        let mut execution = make_execution(Some(137), "", "");
        execution.oom_killed = true;
        assert_eq!(classify(execution), RunOutcome::MemoryExceeded);
    }

    #[test]
    fn test_memory_error_traceback_is_memory_exceeded() {
        let stderr = "Traceback (most recent call last):\n  File \"main.py\", line 1, in <module>\nMemoryError\n";
        assert_eq!(
            classify(make_execution(Some(1), "", stderr)),
            RunOutcome::MemoryExceeded
        );
    }

    #[test]
    fn test_exception_is_crash_with_message_then_class() {
        assert_eq!(
            classify(make_execution(Some(1), "", ZERO_DIVISION)),
            RunOutcome::Crashed("division by zero ZeroDivisionError".to_string())
        );
    }

    #[test]
    fn test_diagnose_variants() {
        assert_eq!(
            diagnose("SyntaxError: invalid syntax\n", Some(1)),
            "invalid syntax SyntaxError"
        );
        assert_eq!(
            diagnose("json.decoder.JSONDecodeError: Expecting value: line 1 column 1 (char 0)", Some(1)),
            "Expecting value: line 1 column 1 (char 0) JSONDecodeError"
        );
        assert_eq!(diagnose("KeyboardInterrupt\n", Some(130)), "KeyboardInterrupt");
        assert_eq!(diagnose("", Some(3)), "process exited with code 3");
        assert_eq!(diagnose("  \n", None), "process terminated abnormally");
        assert_eq!(
            diagnose("something odd happened: badly\n", Some(2)),
            "something odd happened: badly"
        );
    }

    #[test]
    fn test_diagnose_is_bounded() {
        let stderr = format!("ValueError: {}", "v".repeat(5000));
        let diagnostic = diagnose(&stderr, Some(1));
        assert_eq!(diagnostic.chars().count(), MAX_DIAGNOSTIC_CHARS);
        assert!(diagnostic.ends_with("..."));
    }

    /// Records what it was asked to run and replays a canned execution
    struct RecordingSandbox {
        calls: Vec<(String, Limits)>,
        execution: Execution,
    }

    #[async_trait]
    impl Sandbox for RecordingSandbox {
        async fn execute(
            &mut self,
            _source_code: &str,
            input: &str,
            limits: Limits,
        ) -> Result<Execution, SandboxError> {
            self.calls.push((input.to_string(), limits));
            Ok(self.execution.clone())
        }

        async fn release(&mut self) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_one_passes_input_and_limits() {
        let mut sandbox = RecordingSandbox {
            calls: Vec::new(),
            execution: make_execution(Some(0), "7\n", ""),
        };

        let outcome = run_one(&mut sandbox, "print(input())", "7\n", 3, 128)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed("7\n".to_string()));
        assert_eq!(
            sandbox.calls,
            vec![(
                "7\n".to_string(),
                Limits {
                    time_limit_seconds: 3,
                    memory_limit_mb: 128,
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_run_one_rejects_oversized_input() {
        let mut sandbox = RecordingSandbox {
            calls: Vec::new(),
            execution: make_execution(Some(0), "", ""),
        };
        let input = "x".repeat(MAX_TEST_INPUT_BYTES + 1);

        let result = run_one(&mut sandbox, "print(1)", &input, 1, 64).await;

        assert!(matches!(result, Err(SandboxError::Execution(_))));
        assert!(sandbox.calls.is_empty());
    }
}
