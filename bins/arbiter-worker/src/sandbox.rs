/// Sandbox abstraction
///
/// A sandbox runs one program against one input under a time and memory
/// limit and reports what it observed. It does not know about expected
/// outputs or verdicts; the runner and the judging engine own that.
///
/// Backends: `docker::DockerSandboxProvider` (production) and
/// `process::ProcessSandboxProvider` (rlimit'd child process, for hosts
/// without a Docker daemon).
use arbiter_common::types::Language;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Captured stdout/stderr beyond this many bytes is dropped
pub const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("language {0} is not supported by the judging system")]
    UnsupportedLanguage(Language),

    #[error("failed to provision sandbox: {0}")]
    Provision(String),

    #[error("sandbox execution failed: {0}")]
    Execution(String),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub time_limit_seconds: u32,
    pub memory_limit_mb: u32,
}

impl Limits {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_seconds as u64)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb as u64 * 1024 * 1024
    }
}

/// What a sandbox observed about a single run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub stdout: String,
    pub stderr: String,
    /// None when the process never reported an exit status (killed on timeout)
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    /// Killed by the kernel or cgroup OOM killer
    pub oom_killed: bool,
    pub elapsed: Duration,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a sandbox able to run `language`.
    ///
    /// Fails with `SandboxError::UnsupportedLanguage` when no runtime is
    /// registered for the language.
    async fn acquire(&self, language: Language) -> Result<Box<dyn Sandbox>, SandboxError>;
}

#[async_trait]
pub trait Sandbox: Send {
    /// Run `source_code` once with `input` on stdin
    async fn execute(
        &mut self,
        source_code: &str,
        input: &str,
        limits: Limits,
    ) -> Result<Execution, SandboxError>;

    /// Tear down everything this sandbox provisioned. Dropping a sandbox
    /// without releasing it still cleans up, but only on a best-effort basis.
    async fn release(&mut self) -> Result<(), SandboxError>;
}

/// Drain `reader` to EOF, keeping at most `MAX_CAPTURE_BYTES`.
///
/// Reading continues past the cap so a chatty child never blocks on a full
/// pipe.
pub async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => push_capped(&mut captured, &chunk[..n]),
        }
    }

    String::from_utf8_lossy(&captured).into_owned()
}

pub fn push_capped(buffer: &mut Vec<u8>, bytes: &[u8]) {
    let room = MAX_CAPTURE_BYTES.saturating_sub(buffer.len());
    buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
}
