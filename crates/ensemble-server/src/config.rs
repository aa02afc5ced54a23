//! Server configuration: TOML file + CLI overrides.

use crate::auth::{AdmissionConfig, SharedSecret};
use crate::relay::AggregatorPolicy;
use ensemble_core::token::DEFAULT_CODE_LEN;
use ensemble_core::{EnsembleError, EnsembleResult, TelemetrySchema};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Shortest admission token the server will issue. Shorter codes leave too few
/// distinct values for rotation to find a free one.
pub const MIN_TOKEN_LEN: usize = 4;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub admission: AdmissionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            http_port: default_http_port(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub telemetry_schema: TelemetrySchema,
    #[serde(default)]
    pub aggregator_policy: AggregatorPolicy,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            telemetry_schema: TelemetrySchema::default(),
            aggregator_policy: AggregatorPolicy::default(),
            stale_after_secs: default_stale_after(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

/// `[admission]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    #[serde(default = "default_true")]
    pub require_approval: bool,
    #[serde(default = "default_token_length")]
    pub token_length: usize,
    #[serde(default = "default_rotate_interval")]
    pub rotate_interval_secs: u64,
    #[serde(default = "default_max_pending_age")]
    pub max_pending_age_secs: u64,
    #[serde(default)]
    pub shared_secret: Option<String>,
    #[serde(default = "default_approve_attempts")]
    pub approve_attempts_per_minute: u32,
    #[serde(default = "default_create_attempts")]
    pub create_attempts_per_minute: u32,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            require_approval: true,
            token_length: default_token_length(),
            rotate_interval_secs: default_rotate_interval(),
            max_pending_age_secs: default_max_pending_age(),
            shared_secret: None,
            approve_attempts_per_minute: default_approve_attempts(),
            create_attempts_per_minute: default_create_attempts(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    3215
}
fn default_http_port() -> u16 {
    3216
}
fn default_outbound_queue() -> usize {
    64
}
fn default_stale_after() -> u64 {
    30 * 60
}
fn default_reap_interval() -> u64 {
    5 * 60
}
fn default_token_length() -> usize {
    DEFAULT_CODE_LEN
}
fn default_rotate_interval() -> u64 {
    30
}
fn default_max_pending_age() -> u64 {
    300
}
fn default_approve_attempts() -> u32 {
    10
}
fn default_create_attempts() -> u32 {
    20
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub http_port: Option<u16>,
    pub telemetry_schema: Option<TelemetrySchema>,
    pub aggregator_policy: Option<AggregatorPolicy>,
    pub no_approval: bool,
    pub shared_secret: Option<String>,
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub http_port: u16,
    pub outbound_queue: usize,
    pub telemetry_schema: TelemetrySchema,
    pub aggregator_policy: AggregatorPolicy,
    pub stale_after: Duration,
    pub reap_interval: Duration,
    pub require_approval: bool,
    pub admission: AdmissionConfig,
    pub rotate_interval: Duration,
    pub approve_attempts_per_minute: u32,
    pub create_attempts_per_minute: u32,
    pub shared_secret: Option<SharedSecret>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> EnsembleResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::from_file(file_config, overrides))
    }

    /// Merge a parsed file with CLI overrides.
    pub fn from_file(file: ConfigFile, overrides: ConfigOverrides) -> Self {
        let ConfigFile {
            server,
            relay,
            admission,
        } = file;

        let shared_secret = overrides
            .shared_secret
            .or(admission.shared_secret)
            .filter(|s| !s.is_empty())
            .map(|s| SharedSecret::new(&s));

        if admission.token_length < MIN_TOKEN_LEN {
            warn!(
                configured = admission.token_length,
                min = MIN_TOKEN_LEN,
                "token_length too short, raising to minimum"
            );
        }

        Self {
            bind: overrides.bind.unwrap_or(server.bind),
            port: overrides.port.unwrap_or(server.port),
            http_port: overrides.http_port.unwrap_or(server.http_port),
            outbound_queue: server.outbound_queue.max(1),
            telemetry_schema: overrides.telemetry_schema.unwrap_or(relay.telemetry_schema),
            aggregator_policy: overrides.aggregator_policy.unwrap_or(relay.aggregator_policy),
            stale_after: Duration::from_secs(relay.stale_after_secs),
            reap_interval: Duration::from_secs(relay.reap_interval_secs.max(1)),
            require_approval: admission.require_approval && !overrides.no_approval,
            admission: AdmissionConfig {
                token_len: admission.token_length.max(MIN_TOKEN_LEN),
                max_pending_age: Duration::from_secs(admission.max_pending_age_secs),
            },
            rotate_interval: Duration::from_secs(admission.rotate_interval_secs.max(1)),
            approve_attempts_per_minute: admission.approve_attempts_per_minute,
            create_attempts_per_minute: admission.create_attempts_per_minute,
            shared_secret,
        }
    }
}

pub fn parse_config(content: &str) -> EnsembleResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| EnsembleError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
