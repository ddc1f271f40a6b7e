//! Process configuration.
//!
//! Everything is read once at startup and treated as immutable afterwards:
//! a TOML file under the configuration directory plus two environment
//! variables (`STATE_DIRECTORY`, `CONFIGURATION_DIRECTORY`) that anchor all
//! on-disk paths. There are no CLI flags.

mod error;

pub use error::{ConfigError, Result};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const CONFIG_FILE: &str = "pinhost.toml";

/// Service configuration, parsed from `<conf>/pinhost.toml`.
///
/// Every field except `origin` has a default, so a minimal deployment only
/// declares the zone it serves.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The parent DNS zone all pinned names live under, e.g. `tls.example`.
    pub origin: String,

    /// CAA identifier of the CA allowed to issue for the zone.
    #[serde(default = "default_ca_domain")]
    pub ca_domain: String,

    /// ACME directory URL certificates are ordered against.
    #[serde(default = "default_directory_url")]
    pub acme_directory_url: String,

    /// Optional account contact, e.g. `mailto:ops@example.com`.
    #[serde(default)]
    pub contact: Option<String>,

    /// Outer bound on a single certificate request, start to finish.
    #[serde(default = "default_acme_timeout")]
    pub acme_timeout_secs: u64,

    /// Order attempts before giving up.
    #[serde(default = "default_acme_retries")]
    pub acme_retries: u32,

    /// Initial delay between attempts; doubles each retry.
    #[serde(default = "default_acme_retry_delay")]
    pub acme_retry_delay_secs: u64,

    /// Cached chains with more remaining life than this are served as-is.
    #[serde(default = "default_min_cert_life")]
    pub min_cert_life_days: u64,

    /// Bound on each shutdown hook.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Bound on cluster membership operations.
    #[serde(default = "default_cluster_timeout")]
    pub cluster_timeout_secs: u64,
}

fn default_ca_domain() -> String {
    "letsencrypt.org".to_string()
}

fn default_directory_url() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_acme_timeout() -> u64 {
    10 * 60
}

fn default_acme_retries() -> u32 {
    3
}

fn default_acme_retry_delay() -> u64 {
    15
}

fn default_min_cert_life() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_cluster_timeout() -> u64 {
    60
}

impl Config {
    /// Parse a TOML config string.
    pub fn parse(input: &str) -> Result<Config> {
        let config: Config = toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file from the configuration directory.
    pub fn load(dirs: &Dirs) -> Result<Config> {
        let path = dirs.config_file();
        let input = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&input)
    }

    fn validate(&self) -> Result<()> {
        if self.origin.is_empty() {
            return Err(ConfigError::Invalid("origin must not be empty".into()));
        }
        if self.origin.starts_with('.') || self.origin.ends_with('.') {
            return Err(ConfigError::Invalid(format!(
                "origin must be a bare zone name, got {:?}",
                self.origin
            )));
        }
        if self.acme_retries == 0 {
            return Err(ConfigError::Invalid("acme_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn acme_timeout(&self) -> Duration {
        Duration::from_secs(self.acme_timeout_secs)
    }

    pub fn acme_retry_delay(&self) -> Duration {
        Duration::from_secs(self.acme_retry_delay_secs)
    }

    pub fn min_cert_life(&self) -> Duration {
        Duration::from_secs(self.min_cert_life_days * 24 * 60 * 60)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_timeout_secs)
    }
}

/// On-disk layout, anchored by systemd-style directory variables.
#[derive(Debug, Clone)]
pub struct Dirs {
    state: PathBuf,
    conf: PathBuf,
}

impl Dirs {
    /// Resolve from `STATE_DIRECTORY` / `CONFIGURATION_DIRECTORY`.
    pub fn from_env() -> Dirs {
        let state = std::env::var("STATE_DIRECTORY")
            .unwrap_or_else(|_| "/var/lib/pinhost".to_string());
        let conf = std::env::var("CONFIGURATION_DIRECTORY")
            .unwrap_or_else(|_| "/etc/pinhost".to_string());
        Dirs { state: PathBuf::from(state), conf: PathBuf::from(conf) }
    }

    pub fn new(state: impl Into<PathBuf>, conf: impl Into<PathBuf>) -> Dirs {
        Dirs { state: state.into(), conf: conf.into() }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state
    }

    pub fn config_file(&self) -> PathBuf {
        self.conf.join(CONFIG_FILE)
    }

    /// Zone master file (operator-maintained).
    pub fn zone_file(&self) -> PathBuf {
        self.conf.join("zonefile")
    }

    /// Cluster peers, one IPv6 address per line.
    pub fn peers_file(&self) -> PathBuf {
        self.conf.join("peers")
    }

    /// Optional External Account Binding credentials (two lines).
    pub fn eab_file(&self) -> PathBuf {
        self.conf.join("eab")
    }

    /// Static site served at `/` on the HTTPS listener.
    pub fn www_dir(&self) -> PathBuf {
        self.conf.join("www")
    }

    /// ACME account key + KID.
    pub fn acme_account_file(&self) -> PathBuf {
        self.state.join("acme-account")
    }

    /// DNSSEC zone-signing key.
    pub fn dns_key_file(&self) -> PathBuf {
        self.state.join("dns-key")
    }

    /// Raft log/snapshot directory.
    pub fn raft_dir(&self) -> PathBuf {
        self.state.join("raft")
    }
}
