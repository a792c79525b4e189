//! Configuration loading: JSON file with per-field defaults, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::resources::ResourceBudget;

/// Per-stage timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// One capability request to one provider.
    pub request_ms: u64,
    /// One lifecycle transition call on one cell.
    pub transition_ms: u64,
    /// One side of a connection handshake.
    pub handshake_ms: u64,
    /// Any trail ledger call.
    pub trail_ms: u64,
    /// Whole assembly pipeline.
    pub assembly_deadline_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 5_000,
            transition_ms: 3_000,
            handshake_ms: 2_000,
            trail_ms: 2_000,
            assembly_deadline_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn transition(&self) -> Duration {
        Duration::from_millis(self.transition_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn trail(&self) -> Duration {
        Duration::from_millis(self.trail_ms)
    }

    pub fn assembly_deadline(&self) -> Duration {
        Duration::from_millis(self.assembly_deadline_ms)
    }
}

/// Retry, reuse and concurrency policy for the assembly pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyPolicy {
    /// Alternate cells requested after a verification failure, per capability.
    pub max_verification_retries: u32,
    /// Alternate cells substituted after a lifecycle failure, per capability.
    pub alternate_substitutions: u32,
    /// Minimum similarity for a trail configuration to be returned at all.
    pub similarity_threshold: f64,
    /// Minimum historical success rate for a trail configuration to bias requests.
    pub success_rate_threshold: f64,
    /// Size of the worker pool shared by per-capability and per-cell tasks.
    pub max_concurrency: usize,
    /// Finished solutions still answerable by id; the oldest are forgotten first.
    pub retained_solutions: usize,
}

impl Default for AssemblyPolicy {
    fn default() -> Self {
        Self {
            max_verification_retries: 3,
            alternate_substitutions: 1,
            similarity_threshold: 0.6,
            success_rate_threshold: 0.8,
            max_concurrency: 8,
            retained_solutions: 1024,
        }
    }
}

/// Top-level QCC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QccConfig {
    /// Anonymous user identifier folded into quantum signatures.
    #[serde(default = "default_user_id")]
    pub user_id: String,
    /// HTTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cell provider endpoints, in preference order.
    #[serde(default = "default_provider_urls")]
    pub provider_urls: Vec<String>,
    /// Providers accepted at `high` and `maximum` security levels.
    #[serde(default)]
    pub trusted_providers: Vec<String>,
    /// Remote trail ledger; the local ledger is used when unset.
    #[serde(default)]
    pub trail_url: Option<String>,
    /// Persistence file for the local trail ledger.
    #[serde(default)]
    pub trail_file: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub assembly: AssemblyPolicy,
    /// Overrides the discovered device capacity.
    #[serde(default)]
    pub device_capacity: Option<ResourceBudget>,
    /// Path to the config file (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_user_id() -> String {
    "anonymous".into()
}
fn default_port() -> u16 {
    8080
}
fn default_provider_urls() -> Vec<String> {
    vec!["http://localhost:8081".into()]
}

impl Default for QccConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            port: default_port(),
            provider_urls: default_provider_urls(),
            trusted_providers: Vec::new(),
            trail_url: None,
            trail_file: None,
            timeouts: TimeoutConfig::default(),
            assembly: AssemblyPolicy::default(),
            device_capacity: None,
            config_path: PathBuf::new(),
        }
    }
}

impl QccConfig {
    /// Load config from a JSON file, or return defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: QccConfig = match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                QccConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.config_path = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Load `qcc.json` from the data directory, then apply environment overrides.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let mut config = Self::load(&data_dir.join("qcc.json"))?;

        if let Some(port) = std::env::var("QCC_PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        if let Ok(providers) = std::env::var("QCC_PROVIDERS") {
            let urls: Vec<String> = providers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if urls.is_empty() {
                warn!("QCC_PROVIDERS is set but empty, keeping configured providers");
            } else {
                config.provider_urls = urls;
            }
        }
        if let Ok(url) = std::env::var("QCC_TRAIL_URL") {
            config.trail_url = Some(url);
        }
        if let Ok(user) = std::env::var("QCC_USER_ID") {
            config.user_id = user;
        }
        if config.trail_url.is_none() && config.trail_file.is_none() {
            config.trail_file = Some(data_dir.join("quantum-trail.json"));
        }

        config.validate()?;
        Ok(config)
    }

    /// Save config to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.config_path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider_urls.is_empty() {
            return Err(Error::Config("at least one provider URL is required".into()));
        }
        if self.assembly.max_concurrency == 0 {
            return Err(Error::Config("assembly.max_concurrency must be positive".into()));
        }
        for (name, value) in [
            ("similarity_threshold", self.assembly.similarity_threshold),
            ("success_rate_threshold", self.assembly.success_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("assembly.{} must be within [0, 1]", name)));
            }
        }
        Ok(())
    }
}
