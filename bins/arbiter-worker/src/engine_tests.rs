/// Integration tests against real interpreters
///
/// These exercise the whole judging path with real Python:
/// 1. Accepted and wrong-answer runs
/// 2. Timeouts are hard kills
/// 3. Tracebacks become short diagnostics
/// 4. Allocation past the memory limit is MemoryLimitExceeded
/// 5. A full queue round trip through Redis

#[cfg(test)]
mod python_tests {
    use crate::config::{LanguageConfig, LanguageConfigManager, LanguageExecution, WorkerSettings};
    use crate::docker::DockerSandboxProvider;
    use crate::engine::JudgingEngine;
    use crate::executor::{execute_job, JobContext, JobOutcome};
    use crate::process::ProcessSandboxProvider;
    use arbiter_common::redis as queue;
    use arbiter_common::store::{self, ProblemRecord, SubmissionRecord, Transaction};
    use arbiter_common::types::{JudgeRequest, Language, TestCase, Verdict};
    use redis::AsyncCommands;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn python_languages() -> Arc<LanguageConfigManager> {
        let config = LanguageConfig {
            name: "python3.11".to_string(),
            version: "3.11".to_string(),
            image: "arbiter-python:3.11".to_string(),
            dockerfile_path: Some("dockerfiles/python/Dockerfile".to_string()),
            execution: LanguageExecution {
                command: "python3".to_string(),
                args: vec![],
                file_name: "main.py".to_string(),
                env: vec!["PYTHONDONTWRITEBYTECODE=1".to_string()],
            },
            cpu_limit: 1.0,
            pids_limit: 64,
            user: "65534:65534".to_string(),
        };
        Arc::new(LanguageConfigManager::from_configs(vec![config]).unwrap())
    }

    fn process_engine() -> JudgingEngine {
        let provider = ProcessSandboxProvider::new(python_languages(), std::env::temp_dir());
        JudgingEngine::new(Arc::new(provider))
    }

    fn docker_engine() -> JudgingEngine {
        let provider = DockerSandboxProvider::new(python_languages(), std::env::temp_dir())
            .expect("Failed to create Docker provider");
        JudgingEngine::new(Arc::new(provider))
    }

    fn make_request(source: &str, time_limit_seconds: u32, tests: &[(&str, &str)]) -> JudgeRequest {
        let test_cases = tests
            .iter()
            .enumerate()
            .map(|(i, (input, expected))| TestCase::new(i as u32 + 1, *input, *expected))
            .collect();
        JudgeRequest::new(source, Language::Python311, time_limit_seconds, 128, test_cases).unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_process_echo_wrong_answer_on_second_test() {
        let engine = process_engine();
        let request = make_request("print(input())", 1, &[("1", "1"), ("2", "3")]);

        let result = engine.judge(&request).await;

        assert_eq!(result.verdict(), Verdict::WrongAnswer);
        assert_eq!(result.failing_test_number(), Some(2));
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_process_accepts_sum() {
        let engine = process_engine();
        let source = "a, b = map(int, input().split())\nprint(a + b)\n";
        let request = make_request(source, 1, &[("1 2", "3"), ("10 -4", "6")]);

        let result = engine.judge(&request).await;
        assert_eq!(result.verdict(), Verdict::Accept);
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_process_infinite_loop_times_out() {
        let engine = process_engine();
        let request = make_request("while True:\n    pass\n", 1, &[("", "")]);

        let start = Instant::now();
        let result = engine.judge(&request).await;

        assert_eq!(result.verdict(), Verdict::TimeLimitExceeded);
        assert_eq!(result.failing_test_number(), Some(1));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_process_exception_diagnostic() {
        let engine = process_engine();
        let request = make_request("print(1 // 0)", 1, &[("", "1")]);

        let result = engine.judge(&request).await;

        assert_eq!(result.verdict(), Verdict::RuntimeError);
        assert_eq!(
            result.diagnostic_message(),
            Some("integer division or modulo by zero ZeroDivisionError")
        );
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_process_memory_limit() {
        let engine = process_engine();
        let request = make_request("data = bytearray(512 * 1024 * 1024)\nprint(len(data))", 2, &[("", "0")]);

        let result = engine.judge(&request).await;

        assert_eq!(result.verdict(), Verdict::MemoryLimitExceeded);
        assert_eq!(result.failing_test_number(), Some(1));
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the arbiter-python:3.11 image
    async fn test_docker_echo_and_timeout() {
        let engine = docker_engine();

        let wrong = engine
            .judge(&make_request("print(input())", 2, &[("1", "1"), ("2", "3")]))
            .await;
        assert_eq!(wrong.verdict(), Verdict::WrongAnswer);
        assert_eq!(wrong.failing_test_number(), Some(2));

        let start = Instant::now();
        let looping = engine
            .judge(&make_request("while True:\n    pass\n", 1, &[("", "")]))
            .await;
        assert_eq!(looping.verdict(), Verdict::TimeLimitExceeded);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the arbiter-python:3.11 image
    async fn test_docker_has_no_network() {
        let engine = docker_engine();
        let source = "import socket\nsocket.create_connection(('1.1.1.1', 53), timeout=1)\nprint('online')\n";

        let result = engine.judge(&make_request(source, 3, &[("", "online")])).await;
        assert_eq!(result.verdict(), Verdict::RuntimeError);
    }

    #[tokio::test]
    #[ignore] // Requires python3 and Redis
    async fn test_submission_round_trip_through_queue() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let mut conn = client.get_connection_manager().await.unwrap();

        let problem = ProblemRecord::new(
            1,
            128,
            vec![TestCase::new(1, "1", "1"), TestCase::new(2, "2", "3")],
            "print(input())".to_string(),
            Language::Python311,
        )
        .unwrap();
        let submission =
            SubmissionRecord::new(problem.id, "print(input())".to_string(), Language::Python311);
        let job = submission.job(&problem).unwrap();

        let mut tx = Transaction::new();
        tx.insert_problem(&problem).unwrap();
        tx.insert_submission(&submission).unwrap();
        tx.enqueue_after_commit(job.clone());
        tx.commit(&mut conn).await.unwrap();

        let ctx = JobContext {
            engine: Arc::new(process_engine()),
            settings: Arc::new(WorkerSettings::default()),
            result_ttl_seconds: 60,
        };

        // Other jobs may be queued ahead of ours; drain until we see it
        let mut outcome = None;
        while let Some(claimed) = queue::claim_job(&mut conn, &Language::Python311, Duration::from_secs(60))
            .await
            .unwrap()
        {
            let is_ours = claimed.job.id == job.id;
            let result = execute_job(&mut conn, &ctx, &claimed).await.unwrap();
            if is_ours {
                outcome = Some(result);
                break;
            }
        }

        match outcome {
            Some(JobOutcome::Judged(result)) => {
                assert_eq!(result.verdict(), Verdict::WrongAnswer);
                assert_eq!(result.failing_test_number(), Some(2));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let stored = store::load_submission(&mut conn, &submission.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.verdict, Verdict::WrongAnswer);
        assert_eq!(stored.record.failing_test_number, Some(2));

        let by_job = queue::get_result(&mut conn, &job.id).await.unwrap().unwrap();
        assert_eq!(by_job.verdict(), Verdict::WrongAnswer);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_over_delivered_job_with_corrupt_record_is_dead_lettered() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let mut conn = client.get_connection_manager().await.unwrap();
        let language = Language::Python311;
        let _: () = redis::cmd("DEL")
            .arg(queue::queue_name(&language))
            .arg(queue::processing_name(&language))
            .arg(queue::inflight_name(&language))
            .query_async(&mut conn)
            .await
            .unwrap();

        let problem = ProblemRecord::new(
            1,
            128,
            vec![TestCase::new(1, "1", "1")],
            "print(input())".to_string(),
            Language::Python311,
        )
        .unwrap();
        let job = problem.author_job().unwrap();
        let _: () = conn.set(store::problem_key(&problem.id), "{not json").await.unwrap();
        queue::enqueue(&mut conn, &job).await.unwrap();

        let ctx = JobContext {
            engine: Arc::new(process_engine()),
            settings: Arc::new(WorkerSettings {
                max_deliveries: 0,
                ..WorkerSettings::default()
            }),
            result_ttl_seconds: 60,
        };

        let claimed = queue::claim_job(&mut conn, &language, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("job should be claimable");
        assert_eq!(claimed.job.id, job.id);

        let outcome = execute_job(&mut conn, &ctx, &claimed).await.unwrap();
        assert_eq!(outcome, JobOutcome::DeadLettered);

        let dead: Vec<String> = conn.lrange(queue::DEAD_LETTER_KEY, -1, -1).await.unwrap();
        assert_eq!(dead, vec![claimed.payload.clone()]);
        let counted: bool = conn
            .hexists(queue::DELIVERIES_KEY, job.id.to_string())
            .await
            .unwrap();
        assert!(!counted);
        let processing: usize = conn.llen(queue::processing_name(&language)).await.unwrap();
        assert_eq!(processing, 0);
    }
}
