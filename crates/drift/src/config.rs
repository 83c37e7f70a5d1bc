//! TOML configuration for the drift CLI.
//!
//! Every section and field is optional; a missing file or an empty one
//! yields a local file store under `~/.drift` and no repository.

use std::path::{Path, PathBuf};
use std::time::Duration;

use drift_types::{StorageBackend, SyncConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Local content store.
    pub store: StoreSection,
    /// Remote repository.
    pub repository: RepositorySection,
    /// Transfer tuning.
    pub sync: SyncSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[store]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Backend type: `"file"` (default) or `"memory"`.
    pub backend: StorageBackend,
    /// Directory holding chunk files and the index.
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".drift"))
            .unwrap_or_else(|| PathBuf::from(".drift"));
        Self {
            backend: StorageBackend::File,
            path,
        }
    }
}

/// Repository transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    /// A directory tree, e.g. on a shared mount.
    #[default]
    File,
    /// A REST endpoint.
    Http,
}

/// `[repository]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RepositorySection {
    /// Transport to use.
    pub kind: RepositoryKind,
    /// Root directory for `kind = "file"`.
    pub path: Option<PathBuf>,
    /// Base URL for `kind = "http"`.
    pub url: Option<String>,
    /// Per-request timeout in seconds for `kind = "http"`.
    pub timeout_secs: Option<u64>,
}

/// `[sync]` section. Unset fields fall back to [`SyncConfig::default`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Maximum concurrent chunk transfers.
    pub concurrency: Option<usize>,
    /// Retries after a transient repository failure.
    pub max_retries: Option<u32>,
    /// First backoff delay in milliseconds.
    pub retry_base_delay_ms: Option<u64>,
    /// Longest backoff delay in milliseconds.
    pub retry_max_delay_ms: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Point the repository at `target`: an `http(s)://` URL or a directory.
    pub fn set_repository(&mut self, target: &str) {
        if target.starts_with("http://") || target.starts_with("https://") {
            self.repository.kind = RepositoryKind::Http;
            self.repository.url = Some(target.to_string());
        } else {
            self.repository.kind = RepositoryKind::File;
            self.repository.path = Some(PathBuf::from(target));
        }
    }

    /// Effective sync tuning.
    pub fn sync_config(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            concurrency: self.sync.concurrency.unwrap_or(defaults.concurrency).max(1),
            max_retries: self.sync.max_retries.unwrap_or(defaults.max_retries),
            retry_base_delay_ms: self
                .sync
                .retry_base_delay_ms
                .unwrap_or(defaults.retry_base_delay_ms),
            retry_max_delay_ms: self
                .sync
                .retry_max_delay_ms
                .unwrap_or(defaults.retry_max_delay_ms),
        }
    }

    /// Effective HTTP request timeout. Defaults to 30 seconds.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.repository.timeout_secs.unwrap_or(30))
    }
}
