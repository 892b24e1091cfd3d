/// Docker sandbox backend
///
/// **Isolation per run:**
/// - Fresh container for every test, removed afterwards
/// - Network disabled, read-only root filesystem, all capabilities dropped
/// - Source and stdin bind-mounted read-only from a per-submission scratch
///   directory; the scratch directory never outlives the sandbox
/// - Address space capped with `ulimit -v` before the interpreter starts,
///   with the container memory cgroup as a backstop
/// - Wall clock enforced in-container by `timeout`, and by a hard
///   `tokio::time::timeout` around the whole run
///
/// The scratch root must be a path the Docker daemon can see, since it is
/// bind-mounted by host path.
use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::sandbox::{push_capped, Execution, Limits, Sandbox, SandboxError, SandboxProvider};
use arbiter_common::types::Language;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Mount point of the scratch directory inside the container
const SANDBOX_DIR: &str = "/sandbox";
const STDIN_FILE: &str = "stdin.txt";

/// Exit status `timeout(1)` reports when it had to kill the command
const TIMEOUT_EXIT_CODE: i64 = 124;
/// `timeout -s KILL` re-raises the signal on itself unless it runs as PID 1
const KILLED_EXIT_CODE: i64 = 137;

/// Slack on top of the time limit for container start-up and teardown
const STARTUP_GRACE: Duration = Duration::from_secs(2);

/// Cgroup memory on top of the address-space limit, so the interpreter sees
/// `MemoryError` before the OOM killer fires
const CGROUP_HEADROOM_BYTES: i64 = 64 * 1024 * 1024;

/// Container cleanup guard - guarantees container removal on drop.
/// Covers panics and cancellation of the run future.
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id: Some(container_id),
        }
    }

    /// Remove the container now and disarm the guard
    async fn remove(mut self) {
        if let Some(container_id) = self.container_id.take() {
            remove_container(&self.docker, &container_id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Cannot be async in Drop
        if let Some(container_id) = self.container_id.take() {
            let docker = self.docker.clone();
            tokio::spawn(async move {
                remove_container(&docker, &container_id).await;
            });
        }
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    if let Err(e) = docker.remove_container(container_id, Some(options)).await {
        warn!(container_id, error = %e, "Failed to clean up container");
    }
}

/// Where a missing language image comes from
#[derive(Debug, Clone, PartialEq)]
enum ImageSource {
    /// Build from a local Dockerfile; its directory is the build context
    Build { context: PathBuf, dockerfile: String },
    Pull,
}

impl ImageSource {
    fn for_config(config: &LanguageConfig) -> Self {
        let Some(path) = config.dockerfile_path.as_deref().map(Path::new) else {
            return ImageSource::Pull;
        };

        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => ImageSource::Build {
                context: if parent.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    parent.to_path_buf()
                },
                dockerfile: name.to_string_lossy().into_owned(),
            },
            _ => ImageSource::Pull,
        }
    }
}

fn build_options(config: &LanguageConfig, dockerfile: &str) -> BuildImageOptions<String> {
    BuildImageOptions {
        dockerfile: dockerfile.to_string(),
        t: config.image.clone(),
        rm: true,
        forcerm: true,
        labels: HashMap::from([
            ("arbiter.language".to_string(), config.name.clone()),
            ("arbiter.language.version".to_string(), config.version.clone()),
        ]),
        ..Default::default()
    }
}

/// Tar up a build context directory for the Docker API
fn tar_context(context: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    archive.append_dir_all(".", context)?;
    archive.into_inner()
}

pub struct DockerSandboxProvider {
    docker: Docker,
    languages: Arc<LanguageConfigManager>,
    scratch_root: PathBuf,
    /// Serializes image provisioning so concurrent misses build once
    provisioning: Mutex<()>,
}

impl DockerSandboxProvider {
    pub fn new(
        languages: Arc<LanguageConfigManager>,
        scratch_root: PathBuf,
    ) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;

        Ok(Self {
            docker,
            languages,
            scratch_root,
            provisioning: Mutex::new(()),
        })
    }

    async fn has_image(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Ensure the language image is present locally, building it from its
    /// Dockerfile (or pulling it when none is configured) on a miss
    async fn ensure_image(&self, config: &LanguageConfig) -> Result<(), SandboxError> {
        let image = config.image.as_str();
        if self.has_image(image).await {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        let _guard = self.provisioning.lock().await;
        if self.has_image(image).await {
            return Ok(());
        }

        match ImageSource::for_config(config) {
            ImageSource::Build {
                context,
                dockerfile,
            } => self.build_image(config, &context, &dockerfile).await,
            ImageSource::Pull => self.pull_image(image).await,
        }
    }

    async fn build_image(
        &self,
        config: &LanguageConfig,
        context: &Path,
        dockerfile: &str,
    ) -> Result<(), SandboxError> {
        let image = config.image.as_str();
        warn!(
            image,
            version = %config.version,
            context = %context.display(),
            "Image cache miss, building"
        );

        let context_dir = context.to_path_buf();
        let tarball = tokio::task::spawn_blocking(move || tar_context(&context_dir))
            .await
            .map_err(|e| SandboxError::Provision(format!("build context task failed: {}", e)))?
            .map_err(|e| {
                SandboxError::Provision(format!(
                    "failed to read build context {}: {}",
                    context.display(),
                    e
                ))
            })?;

        let mut stream = self.docker.build_image(
            build_options(config, dockerfile),
            None,
            Some(bytes::Bytes::from(tarball)),
        );
        while let Some(result) = stream.next().await {
            let info = result
                .map_err(|e| SandboxError::Provision(format!("failed to build {}: {}", image, e)))?;
            if let Some(error) = info.error {
                return Err(SandboxError::Provision(format!(
                    "failed to build {}: {}",
                    image, error
                )));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image, "{}", line);
                }
            }
        }

        info!(image, "Image built");
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        warn!(image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Provision(format!("failed to pull {}: {}", image, e)))?;
        }

        info!(image, "Image pulled");
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn acquire(&self, language: Language) -> Result<Box<dyn Sandbox>, SandboxError> {
        let config = self
            .languages
            .get_config(&language)
            .ok_or(SandboxError::UnsupportedLanguage(language))?
            .clone();

        self.ensure_image(&config).await?;

        let scratch = tempfile::Builder::new()
            .prefix("arbiter-")
            .tempdir_in(&self.scratch_root)?;
        // The container user is unprivileged and must be able to traverse it
        fs::set_permissions(scratch.path(), fs::Permissions::from_mode(0o755))?;

        debug!(language = %language, scratch = %scratch.path().display(), "Provisioned docker sandbox");

        Ok(Box::new(DockerSandbox {
            docker: self.docker.clone(),
            config,
            scratch: Some(scratch),
        }))
    }
}

struct DockerSandbox {
    docker: Docker,
    config: LanguageConfig,
    scratch: Option<TempDir>,
}

impl DockerSandbox {
    fn scratch_dir(&self) -> Result<&Path, SandboxError> {
        self.scratch
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| SandboxError::Execution("sandbox already released".to_string()))
    }

    fn container_config(&self, scratch: &Path, limits: Limits) -> Config<String> {
        let execution = &self.config.execution;
        let mut program = vec![execution.command.clone()];
        program.extend(execution.args.iter().cloned());
        program.push(format!("{}/{}", SANDBOX_DIR, execution.file_name));

        let script = format!(
            "ulimit -v {} && exec timeout -s KILL {} {} < {}/{}",
            limits.memory_limit_bytes() / 1024,
            limits.time_limit_seconds,
            program.join(" "),
            SANDBOX_DIR,
            STDIN_FILE,
        );

        let memory = limits.memory_limit_bytes() as i64 + CGROUP_HEADROOM_BYTES;

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
            entrypoint: Some(vec![]),
            env: Some(execution.env.clone()),
            user: Some(self.config.user.clone()),
            working_dir: Some(SANDBOX_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}:ro", scratch.display(), SANDBOX_DIR)]),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((self.config.cpu_limit as f64 * 1_000_000_000.0) as i64),
                pids_limit: Some(self.config.pids_limit),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,noexec,nosuid,size=16m".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Collect output until the container stops, then its exit status
    async fn collect(&self, container_id: &str) -> (String, String, Option<i64>) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });

        let mut logs_stream = self.docker.logs(container_id, logs_options);
        while let Some(output) = logs_stream.next().await {
            match output {
                Ok(LogOutput::StdOut { message }) => push_capped(&mut stdout, &message),
                Ok(LogOutput::StdErr { message }) => push_capped(&mut stderr, &message),
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        // Non-zero exits surface as an error carrying the status code
        let mut wait_stream = self.docker.wait_container(container_id, Some(wait_options));
        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(container_id, error = %e, "Failed to wait for container");
                None
            }
            None => None,
        };

        (
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        )
    }

    async fn was_oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!(container_id, error = %e, "Failed to inspect container");
                false
            }
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn execute(
        &mut self,
        source_code: &str,
        input: &str,
        limits: Limits,
    ) -> Result<Execution, SandboxError> {
        let scratch = self.scratch_dir()?.to_path_buf();
        write_readable(&scratch.join(&self.config.execution.file_name), source_code)?;
        write_readable(&scratch.join(STDIN_FILE), input)?;

        let container_name = format!("arbiter-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(&scratch, limits))
            .await?;
        let container_id = container.id;

        // Set up cleanup immediately after creation
        let guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;

        let hard_timeout = limits.time_limit() + STARTUP_GRACE;
        let mut execution = match tokio::time::timeout(hard_timeout, self.collect(&container_id)).await {
            Ok((stdout, stderr, exit_code)) => Execution {
                stdout,
                stderr,
                exit_code,
                ..Default::default()
            },
            Err(_) => {
                warn!(container_id = %container_id, "Execution exceeded hard timeout, killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }
                Execution {
                    timed_out: true,
                    ..Default::default()
                }
            }
        };

        execution.elapsed = start_time.elapsed();
        if !execution.timed_out && execution.exit_code != Some(0) {
            execution.oom_killed = self.was_oom_killed(&container_id).await;
            execution.timed_out = !execution.oom_killed
                && hit_time_limit(execution.exit_code, execution.elapsed, limits.time_limit());
        }

        guard.remove().await;

        debug!(
            exit_code = ?execution.exit_code,
            timed_out = execution.timed_out,
            oom_killed = execution.oom_killed,
            elapsed_ms = execution.elapsed.as_millis() as u64,
            "Container run finished"
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

fn write_readable(path: &Path, contents: &str) -> Result<(), SandboxError> {
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

fn hit_time_limit(exit_code: Option<i64>, elapsed: Duration, limit: Duration) -> bool {
    match exit_code {
        Some(TIMEOUT_EXIT_CODE) => true,
        Some(KILLED_EXIT_CODE) => elapsed >= limit,
        _ => false,
    }
}
