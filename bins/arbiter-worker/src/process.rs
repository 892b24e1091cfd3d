/// Process sandbox backend
///
/// Runs the interpreter as a plain child process with an address-space
/// rlimit, no core dumps, a cleared environment and its own process group,
/// inside a private scratch directory. This is weaker isolation than the
/// Docker backend: there is no filesystem or network confinement.
use crate::config::{LanguageConfigManager, LanguageExecution};
use crate::sandbox::{read_capped, Execution, Limits, Sandbox, SandboxError, SandboxProvider};
use arbiter_common::types::Language;
use async_trait::async_trait;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to keep reading pipes once the process group is dead. A
/// descendant that left the group may still hold them open.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

pub struct ProcessSandboxProvider {
    languages: Arc<LanguageConfigManager>,
    scratch_root: PathBuf,
}

impl ProcessSandboxProvider {
    pub fn new(languages: Arc<LanguageConfigManager>, scratch_root: PathBuf) -> Self {
        warn!("Process sandbox provides no filesystem or network isolation");
        Self {
            languages,
            scratch_root,
        }
    }
}

#[async_trait]
impl SandboxProvider for ProcessSandboxProvider {
    async fn acquire(&self, language: Language) -> Result<Box<dyn Sandbox>, SandboxError> {
        let execution = self
            .languages
            .get_config(&language)
            .ok_or(SandboxError::UnsupportedLanguage(language))?
            .execution
            .clone();

        let scratch = tempfile::Builder::new()
            .prefix("arbiter-")
            .tempdir_in(&self.scratch_root)?;

        debug!(language = %language, scratch = %scratch.path().display(), "Provisioned process sandbox");

        Ok(Box::new(ProcessSandbox {
            execution,
            scratch: Some(scratch),
        }))
    }
}

pub struct ProcessSandbox {
    execution: LanguageExecution,
    scratch: Option<TempDir>,
}

impl ProcessSandbox {
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    fn command(&self, scratch: &Path, limits: Limits) -> Command {
        let mut cmd = Command::new(&self.execution.command);
        cmd.args(&self.execution.args)
            .arg(&self.execution.file_name)
            .current_dir(scratch)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for pair in &self.execution.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        let memory_bytes = limits.memory_limit_bytes();
        // SAFETY: the closure only calls async-signal-safe libc functions
        unsafe {
            cmd.pre_exec(move || apply_limits(memory_bytes));
        }

        cmd
    }
}

/// Runs in the forked child, before exec
fn apply_limits(memory_bytes: u64) -> io::Result<()> {
    let address_space = libc::rlimit {
        rlim_cur: memory_bytes as libc::rlim_t,
        rlim_max: memory_bytes as libc::rlim_t,
    };
    let no_core = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    unsafe {
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setrlimit(libc::RLIMIT_AS, &address_space) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setrlimit(libc::RLIMIT_CORE, &no_core) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

/// SIGKILL the whole process group led by `pid`
fn kill_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

/// Output collected by a reader task, abandoned after `DRAIN_GRACE`
async fn drain(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };

    match tokio::time::timeout(DRAIN_GRACE, &mut reader).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            warn!("Output pipe still open after the process group was killed");
            reader.abort();
            String::new()
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(
        &mut self,
        source_code: &str,
        input: &str,
        limits: Limits,
    ) -> Result<Execution, SandboxError> {
        let scratch = self
            .scratch_dir()
            .ok_or_else(|| SandboxError::Execution("sandbox already released".to_string()))?
            .to_path_buf();
        tokio::fs::write(scratch.join(&self.execution.file_name), source_code).await?;

        let start_time = Instant::now();
        let mut child = self.command(&scratch, limits).spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let input = input.to_owned();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading its input
                let _ = stdin.write_all(input.as_bytes()).await;
            }
        });

        let stdout = child.stdout.take().map(|out| tokio::spawn(read_capped(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_capped(err)));

        let mut execution = Execution::default();
        match tokio::time::timeout(limits.time_limit(), child.wait()).await {
            Ok(status) => {
                let status = status?;
                execution.exit_code = status
                    .code()
                    .map(i64::from)
                    .or_else(|| status.signal().map(|signal| 128 + i64::from(signal)));
            }
            Err(_) => {
                execution.timed_out = true;
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                let _ = child.start_kill();
                child.wait().await?;
            }
        }
        execution.elapsed = start_time.elapsed();

        // Background children die with the program, whatever way it ended
        if let Some(pid) = pid {
            kill_group(pid);
        }

        writer.abort();
        execution.stdout = drain(stdout).await;
        execution.stderr = drain(stderr).await;

        debug!(
            exit_code = ?execution.exit_code,
            timed_out = execution.timed_out,
            elapsed_ms = execution.elapsed.as_millis() as u64,
            "Process run finished"
        );

        Ok(execution)
    }

    async fn release(&mut self) -> Result<(), SandboxError> {
        if let Some(scratch) = self.scratch.take() {
            scratch.close()?;
        }
        Ok(())
    }
}
