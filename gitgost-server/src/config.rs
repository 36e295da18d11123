use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Applied to the JSON/badge surface; git transfers run unbounded under
    /// the request's own deadline.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Optional gate for the non-git API surface. Never applied to
    /// `info/refs` or `git-receive-pack`, which must stay anonymous.
    pub api_key: Option<String>,
    /// Bearer token for all forge writes. Absence surfaces as
    /// `GITHUB_TOKEN not set` on the affected operation.
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub github_url: String,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub ntfy_base_url: String,
    pub log_format: LogFormat,
    pub commit_hash: String,
    pub build_time: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = get_env("PORT", "8080")
            .parse::<u16>()
            .context("PORT must be a valid port number")?;

        let log_format = match get_env("LOG_FORMAT", "text").as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Config {
            port,
            read_timeout: get_duration_env("READ_TIMEOUT", Duration::from_secs(30)),
            write_timeout: get_duration_env("WRITE_TIMEOUT", Duration::from_secs(30)),
            api_key: get_optional_env("GITGOST_API_KEY"),
            github_token: get_optional_env("GITHUB_TOKEN"),
            github_api_url: get_env("GITHUB_API_URL", "https://api.github.com"),
            github_url: get_env("GITHUB_URL", "https://github.com"),
            supabase_url: get_optional_env("SUPABASE_URL"),
            supabase_key: get_optional_env("SUPABASE_KEY"),
            ntfy_base_url: get_env("NTFY_BASE_URL", crate::ntfy::DEFAULT_BASE_URL),
            log_format,
            commit_hash: get_env("COMMIT_HASH", "main"),
            build_time: get_env("BUILD_TIME", "unknown"),
        })
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Duration env vars are whole seconds.
fn get_duration_env(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_env_falls_back_to_default() {
        env::remove_var("GITGOST_TEST_MISSING");
        assert_eq!(get_env("GITGOST_TEST_MISSING", "fallback"), "fallback");
    }

    #[test]
    fn get_optional_env_treats_blank_as_absent() {
        env::set_var("GITGOST_TEST_BLANK", "   ");
        assert_eq!(get_optional_env("GITGOST_TEST_BLANK"), None);
        env::remove_var("GITGOST_TEST_BLANK");
    }

    #[test]
    fn duration_env_parses_seconds() {
        env::set_var("GITGOST_TEST_TIMEOUT", "45");
        assert_eq!(
            get_duration_env("GITGOST_TEST_TIMEOUT", Duration::from_secs(30)),
            Duration::from_secs(45)
        );
        env::set_var("GITGOST_TEST_TIMEOUT", "not-a-number");
        assert_eq!(
            get_duration_env("GITGOST_TEST_TIMEOUT", Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        env::remove_var("GITGOST_TEST_TIMEOUT");
    }
}
