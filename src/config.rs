//! Runtime settings.
//!
//! Resolution order: command-line flags, then environment (optionally loaded
//! from a `.env` file), then defaults.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TRIPCHECK_DATA_DIR` | `~/.tripcheck` | Store, queue and trip files |
//! | `TRIPCHECK_REMOTE_URL` | unset | Remote task service base URL |
//! | `TRIPCHECK_SUGGEST_URL` | unset | Suggestion service endpoint |
//! | `TRIPCHECK_MAX_ATTEMPTS` | `8` | Rejections before an action is dead-lettered |
//! | `TRIPCHECK_BACKOFF_BASE_SECS` | `30` | First retry delay |
//! | `TRIPCHECK_BACKOFF_MAX_SECS` | `3600` | Retry delay cap |
//! | `TRIPCHECK_HTTP_TIMEOUT_SECS` | `15` | Per-request timeout |

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::RetryPolicy;
use crate::sync::SyncConfig;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub remote_url: Option<String>,
    pub suggest_url: Option<String>,
    /// Start the session offline regardless of remote availability.
    pub offline: bool,
    pub http_timeout: Duration,
    pub sync: SyncConfig,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

impl Settings {
    /// Build settings from CLI overrides and the environment.
    pub fn resolve(data_dir: Option<PathBuf>, remote_url: Option<String>, offline: bool) -> Self {
        let data_dir = data_dir
            .or_else(|| env_var("TRIPCHECK_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".tripcheck")
            });

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: env_parse::<u32>("TRIPCHECK_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts)
                .max(1),
            base_backoff: env_parse::<i64>("TRIPCHECK_BACKOFF_BASE_SECS")
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.base_backoff),
            max_backoff: env_parse::<i64>("TRIPCHECK_BACKOFF_MAX_SECS")
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.max_backoff),
        };

        Settings {
            data_dir,
            remote_url: remote_url.or_else(|| env_var("TRIPCHECK_REMOTE_URL")),
            suggest_url: env_var("TRIPCHECK_SUGGEST_URL"),
            offline,
            http_timeout: Duration::from_secs(
                env_parse("TRIPCHECK_HTTP_TIMEOUT_SECS").unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            ),
            sync: SyncConfig { retry },
        }
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("pending_actions.json")
    }

    pub fn trips_dir(&self) -> PathBuf {
        self.data_dir.join("trips")
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_take_precedence_and_paths_derive_from_data_dir() {
        let settings = Settings::resolve(
            Some(PathBuf::from("/tmp/tc")),
            Some("http://localhost:9000".into()),
            true,
        );
        assert_eq!(settings.remote_url.as_deref(), Some("http://localhost:9000"));
        assert!(settings.offline);
        assert_eq!(settings.tasks_path(), PathBuf::from("/tmp/tc/tasks.json"));
        assert_eq!(settings.queue_path(), PathBuf::from("/tmp/tc/pending_actions.json"));
        assert_eq!(settings.trips_dir(), PathBuf::from("/tmp/tc/trips"));
        assert!(settings.sync.retry.max_attempts >= 1);
    }
}
