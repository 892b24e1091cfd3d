// Worker configuration: the language registry (languages.json) and
// environment-driven runtime settings
use anyhow::{bail, Context, Result};
use arbiter_common::config::env_or;
use arbiter_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LANGUAGES_CONFIG: &str = "config/languages.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    /// Interpreter binary, e.g. `python3`
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Name the submitted source is saved under in the scratch directory
    pub file_name: String,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    #[serde(default)]
    pub dockerfile_path: Option<String>,
    pub execution: LanguageExecution,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Container user; `nobody` unless overridden
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_cpu_limit() -> f32 {
    1.0
}

fn default_pids_limit() -> i64 {
    64
}

fn default_user() -> String {
    "65534:65534".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Registry of languages this worker can provision sandboxes for
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load from `LANGUAGES_CONFIG`, or config/languages.json
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("LANGUAGES_CONFIG")
            .unwrap_or_else(|_| DEFAULT_LANGUAGES_CONFIG.to_string());
        Self::load(Path::new(&path))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;
        Self::from_configs(languages_json.languages)
    }

    pub fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self> {
        let mut configs = HashMap::new();
        for lang in languages {
            let language = Language::from_str(&lang.name)
                .with_context(|| format!("Unknown language '{}' in language config", lang.name))?;
            if configs.insert(language, lang).is_some() {
                bail!("Language '{}' is configured more than once", language);
            }
        }

        Ok(Self { configs })
    }

    /// Configuration for `language`, if this worker has a runtime for it
    pub fn get_config(&self, language: &Language) -> Option<&LanguageConfig> {
        self.configs.get(language)
    }

    pub fn list_languages(&self) -> Vec<Language> {
        self.configs.keys().copied().collect()
    }
}

/// Which isolation backend the worker runs submissions under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    Docker,
    Process,
}

impl FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(SandboxBackend::Docker),
            "process" => Ok(SandboxBackend::Process),
            other => Err(format!("unknown sandbox backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Jobs judged concurrently by this process
    pub concurrency: usize,
    pub backend: SandboxBackend,
    pub visibility_timeout: Duration,
    /// Deliveries after which a job is dead-lettered
    pub max_deliveries: u32,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    pub scratch_root: PathBuf,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_or("WORKER_CONCURRENCY", defaults.concurrency).max(1),
            backend: env_or("SANDBOX_BACKEND", defaults.backend),
            visibility_timeout: Duration::from_secs(env_or(
                "VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
            )),
            max_deliveries: env_or("MAX_DELIVERIES", defaults.max_deliveries).max(1),
            poll_interval: Duration::from_millis(env_or(
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            reap_interval: Duration::from_secs(env_or(
                "REAP_INTERVAL_SECS",
                defaults.reap_interval.as_secs(),
            )),
            scratch_root: std::env::var("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
        }
    }

    /// How often a running job pushes its visibility deadline out
    pub fn heartbeat_interval(&self) -> Duration {
        (self.visibility_timeout / 3).max(Duration::from_secs(1))
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            backend: SandboxBackend::Docker,
            visibility_timeout: Duration::from_secs(120),
            max_deliveries: 3,
            poll_interval: Duration::from_millis(500),
            reap_interval: Duration::from_secs(15),
            scratch_root: std::env::temp_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LANGUAGES_JSON: &str = r#"{
        "languages": [
            {
                "name": "python3.11",
                "version": "3.11",
                "image": "arbiter-python:3.11",
                "dockerfile_path": "dockerfiles/python/Dockerfile",
                "execution": {
                    "command": "python3",
                    "args": ["-I"],
                    "file_name": "main.py"
                },
                "cpu_limit": 0.5
            }
        ]
    }"#;

    #[test]
    fn test_parse_languages_json() {
        let manager = LanguageConfigManager::from_json(LANGUAGES_JSON).unwrap();
        let config = manager.get_config(&Language::Python311).unwrap();

        assert_eq!(config.image, "arbiter-python:3.11");
        assert_eq!(config.execution.command, "python3");
        assert_eq!(config.execution.file_name, "main.py");
        assert_eq!(config.cpu_limit, 0.5);
        assert_eq!(config.pids_limit, 64);
        assert_eq!(config.user, "65534:65534");
        assert_eq!(manager.list_languages(), vec![Language::Python311]);
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        let json = LANGUAGES_JSON.replace("python3.11", "brainfuck");
        assert!(LanguageConfigManager::from_json(&json).is_err());
    }

    #[test]
    fn test_empty_registry_supports_nothing() {
        let manager = LanguageConfigManager::from_configs(vec![]).unwrap();
        assert!(manager.get_config(&Language::Python311).is_none());
    }

    #[test]
    fn test_missing_file() {
        let result = LanguageConfigManager::load(Path::new("/nonexistent/languages.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("docker".parse::<SandboxBackend>(), Ok(SandboxBackend::Docker));
        assert_eq!("Process".parse::<SandboxBackend>(), Ok(SandboxBackend::Process));
        assert!("vm".parse::<SandboxBackend>().is_err());
    }

    #[test]
    fn test_heartbeat_is_shorter_than_visibility() {
        let settings = WorkerSettings::default();
        assert!(settings.heartbeat_interval() < settings.visibility_timeout);

        let tiny = WorkerSettings {
            visibility_timeout: Duration::from_secs(1),
            ..WorkerSettings::default()
        };
        assert_eq!(tiny.heartbeat_interval(), Duration::from_secs(1));
    }
}
