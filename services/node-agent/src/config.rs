//! Configuration for the node agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::template::{CacheConfig, DEFAULT_MAX_SUBSTITUTION_BYTES};

/// Agent configuration, loaded from `WARREN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address for brain commands.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Node name reported at registration; registration upserts on it.
    pub node_name: String,

    /// Base URL the brain should use to reach this agent.
    pub advertised_url: String,

    /// Brain base URL.
    pub brain_url: String,

    /// Region tag reported at registration.
    pub region: Option<String>,

    /// Comma-separated capability tags.
    pub tags: Option<String>,

    /// Whether this node accepts dev-mode placements.
    pub dev_mode: bool,

    /// Instance slots offered to the scheduler.
    pub capacity_slots: i32,

    /// Root for the template cache (`<cache_root>/templates/...`).
    pub cache_root: PathBuf,

    /// Root for instance workspaces (`<workspace_root>/instances/...`).
    pub workspace_root: PathBuf,

    /// HTTP object storage endpoint (e.g. a MinIO or S3 gateway URL).
    pub storage_endpoint: Option<String>,

    /// Bucket under the storage endpoint.
    pub storage_bucket: String,

    /// Local directory standing in for object storage; dev setups only.
    pub storage_dir: Option<PathBuf>,

    /// Per-request timeout for template archive downloads.
    pub storage_timeout: Duration,

    /// Per-request timeout for brain calls.
    pub request_timeout: Duration,

    /// Overrides the brain-assigned heartbeat interval when set.
    pub heartbeat_interval_override: Option<Duration>,

    /// Walk the cache at startup and log each entry's validity.
    pub cache_check: bool,

    /// Ceiling on entries per template archive.
    pub max_archive_entries: u64,

    /// Ceiling on bytes extracted per template archive.
    pub max_extracted_bytes: u64,

    /// Files larger than this are skipped by variable substitution.
    pub max_substitution_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        let cache_defaults = CacheConfig::default();
        Self {
            listen_addr: ([0, 0, 0, 0], 8081).into(),
            log_level: "info".to_string(),
            node_name: "node-1".to_string(),
            advertised_url: "http://127.0.0.1:8081".to_string(),
            brain_url: "http://127.0.0.1:8080".to_string(),
            region: None,
            tags: None,
            dev_mode: false,
            capacity_slots: 4,
            cache_root: PathBuf::from("/var/lib/warren-agent"),
            workspace_root: PathBuf::from("/var/lib/warren-agent"),
            storage_endpoint: None,
            storage_bucket: "templates".to_string(),
            storage_dir: None,
            storage_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval_override: None,
            cache_check: false,
            max_archive_entries: cache_defaults.max_archive_entries,
            max_extracted_bytes: cache_defaults.max_extracted_bytes,
            max_substitution_bytes: DEFAULT_MAX_SUBSTITUTION_BYTES,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let listen_addr = match std::env::var("WARREN_LISTEN_ADDR") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.listen_addr,
        };

        let log_level =
            std::env::var("WARREN_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());
        let node_name =
            std::env::var("WARREN_NODE_NAME").unwrap_or_else(|_| defaults.node_name.clone());
        let advertised_url = std::env::var("WARREN_ADVERTISED_URL")
            .unwrap_or_else(|_| defaults.advertised_url.clone());
        let brain_url =
            std::env::var("WARREN_BRAIN_URL").unwrap_or_else(|_| defaults.brain_url.clone());

        let region = std::env::var("WARREN_REGION").ok();
        let tags = std::env::var("WARREN_TAGS").ok();
        let dev_mode = env_bool("WARREN_DEV_MODE").unwrap_or(defaults.dev_mode);
        let capacity_slots = std::env::var("WARREN_CAPACITY_SLOTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.capacity_slots);

        let cache_root = std::env::var("WARREN_CACHE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.cache_root.clone());
        let workspace_root = std::env::var("WARREN_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.workspace_root.clone());

        let storage_endpoint = std::env::var("WARREN_STORAGE_ENDPOINT").ok();
        let storage_bucket = std::env::var("WARREN_STORAGE_BUCKET")
            .unwrap_or_else(|_| defaults.storage_bucket.clone());
        let storage_dir = std::env::var("WARREN_STORAGE_DIR").ok().map(PathBuf::from);
        let storage_timeout =
            env_secs("WARREN_STORAGE_TIMEOUT_SECS").unwrap_or(defaults.storage_timeout);
        let request_timeout =
            env_secs("WARREN_REQUEST_TIMEOUT_SECS").unwrap_or(defaults.request_timeout);
        let heartbeat_interval_override = env_secs("WARREN_HEARTBEAT_INTERVAL_SECS");

        let cache_check = env_bool("WARREN_CACHE_CHECK").unwrap_or(defaults.cache_check);
        let max_archive_entries = std::env::var("WARREN_MAX_ARCHIVE_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_archive_entries);
        let max_extracted_bytes = std::env::var("WARREN_MAX_EXTRACTED_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_extracted_bytes);
        let max_substitution_bytes = std::env::var("WARREN_MAX_SUBSTITUTION_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_substitution_bytes);

        Ok(Self {
            listen_addr,
            log_level,
            node_name,
            advertised_url,
            brain_url,
            region,
            tags,
            dev_mode,
            capacity_slots,
            cache_root,
            workspace_root,
            storage_endpoint,
            storage_bucket,
            storage_dir,
            storage_timeout,
            request_timeout,
            heartbeat_interval_override,
            cache_check,
            max_archive_entries,
            max_extracted_bytes,
            max_substitution_bytes,
        })
    }

    /// Checks the whole configuration and reports every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.node_name.trim().is_empty() {
            problems.push("WARREN_NODE_NAME must not be blank".to_string());
        }
        if self.advertised_url.trim().is_empty() {
            problems.push("WARREN_ADVERTISED_URL must not be blank".to_string());
        }
        if self.brain_url.trim().is_empty() {
            problems.push("WARREN_BRAIN_URL must not be blank".to_string());
        }
        if self.capacity_slots < 1 {
            problems.push(format!(
                "WARREN_CAPACITY_SLOTS must be at least 1, got {}",
                self.capacity_slots
            ));
        }
        match (&self.storage_endpoint, &self.storage_dir) {
            (None, None) => problems.push(
                "set one of WARREN_STORAGE_ENDPOINT or WARREN_STORAGE_DIR".to_string(),
            ),
            (Some(_), Some(_)) => problems.push(
                "WARREN_STORAGE_ENDPOINT and WARREN_STORAGE_DIR are mutually exclusive"
                    .to_string(),
            ),
            _ => {}
        }
        if self.max_archive_entries == 0 {
            problems.push("WARREN_MAX_ARCHIVE_ENTRIES must be positive".to_string());
        }
        if self.max_extracted_bytes == 0 {
            problems.push("WARREN_MAX_EXTRACTED_BYTES must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration: {}", problems.join("; "))
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_archive_entries: self.max_archive_entries,
            max_extracted_bytes: self.max_extracted_bytes,
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_needs_a_storage_source() {
        let error = Config::default().validate().unwrap_err();
        assert!(error.to_string().contains("WARREN_STORAGE_ENDPOINT"));
    }

    #[test]
    fn storage_dir_satisfies_validation() {
        let config = Config {
            storage_dir: Some(PathBuf::from("/tmp/templates")),
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn validation_reports_every_problem_at_once() {
        let config = Config {
            node_name: "  ".to_string(),
            capacity_slots: 0,
            max_archive_entries: 0,
            ..Config::default()
        };
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("WARREN_NODE_NAME"));
        assert!(message.contains("WARREN_CAPACITY_SLOTS"));
        assert!(message.contains("WARREN_MAX_ARCHIVE_ENTRIES"));
        assert!(message.contains("WARREN_STORAGE_ENDPOINT"));
    }

    #[test]
    fn endpoint_and_dir_together_are_rejected() {
        let config = Config {
            storage_endpoint: Some("http://minio:9000".to_string()),
            storage_dir: Some(PathBuf::from("/tmp/templates")),
            ..Config::default()
        };
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("mutually exclusive"));
    }
}
