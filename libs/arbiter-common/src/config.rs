// Shared runtime configuration, read from the environment
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_RESULT_TTL_SECONDS: u64 = 86400;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// How long per-job results stay readable under `arbiter:result:<job_id>`
    pub result_ttl_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            result_ttl_seconds: env_or("RESULT_TTL_SECONDS", DEFAULT_RESULT_TTL_SECONDS),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            result_ttl_seconds: DEFAULT_RESULT_TTL_SECONDS,
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when
/// it is unset or unparsable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparsable environment variable");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back() {
        std::env::remove_var("ARBITER_TEST_UNSET_KEY");
        assert_eq!(env_or("ARBITER_TEST_UNSET_KEY", 7u32), 7);

        std::env::set_var("ARBITER_TEST_BAD_KEY", "not-a-number");
        assert_eq!(env_or("ARBITER_TEST_BAD_KEY", 3u64), 3);

        std::env::set_var("ARBITER_TEST_GOOD_KEY", " 42 ");
        assert_eq!(env_or("ARBITER_TEST_GOOD_KEY", 0u64), 42);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.result_ttl_seconds, 86400);
    }
}
