use crate::store::StoreConnector;
use crate::store::memory::MemoryConnector;
use crate::store::sqlite::SqliteConnector;
use serde::Deserialize;
use site_cache::{SiteCacheConfig, SiteSourceConfig};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Duplicate site id: {0}")]
    DuplicateSite(u32),

    #[error("Site {0} has a visit timeout of 0 seconds")]
    InvalidVisitTimeout(u32),

    #[error("request_timeout_ms must be greater than 0")]
    InvalidRequestTimeout,

    #[error("site_cache.ttl_secs must be greater than 0")]
    InvalidCacheTtl,

    #[error("sqlite max_connections must be greater than 0")]
    InvalidMaxConnections,

    #[error("bulk.require_token is set but no token_auth is configured")]
    MissingBulkToken,
}

/// Tracker configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener receiving tracking hits
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    #[serde(default)]
    pub settings: TrackerSettings,
    pub storage: StorageConfig,
    /// Where site settings come from
    pub sites: SiteSourceConfig,
    #[serde(default)]
    pub site_cache: SiteCacheConfig,
    #[serde(default)]
    pub archiving: ArchiveConfig,
}

impl Config {
    /// Validates the tracker configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.settings.validate()?;
        self.storage.validate()?;

        if self.site_cache.ttl_secs == 0 {
            return Err(ValidationError::InvalidCacheTtl);
        }

        if let SiteSourceConfig::Static { sites } = &self.sites {
            let mut ids = HashSet::new();
            for site in sites {
                if !ids.insert(site.id) {
                    return Err(ValidationError::DuplicateSite(site.id));
                }
                if site.visit_timeout_secs == 0 {
                    return Err(ValidationError::InvalidVisitTimeout(site.id));
                }
            }
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Snapshot of the switches that govern one tracking run.
///
/// Each [`crate::tracker::Tracker`] keeps its own copy, so changing a value
/// never affects a run in progress.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TrackerSettings {
    /// False until storage has been set up; nothing is recorded before that.
    #[serde(default = "default_true")]
    pub installed: bool,
    #[serde(default = "default_true")]
    pub record_statistics: bool,
    #[serde(default)]
    pub debug: bool,
    /// Processing budget of one call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Take the client IP from `X-Forwarded-For` when running behind a proxy.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    #[serde(default)]
    pub bulk: BulkConfig,
}

impl TrackerSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.request_timeout_ms == 0 {
            return Err(ValidationError::InvalidRequestTimeout);
        }
        if self.bulk.require_token && self.bulk.token_auth.is_empty() {
            return Err(ValidationError::MissingBulkToken);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_installed(mut self, installed: bool) -> Self {
        self.installed = installed;
        self
    }

    pub fn with_record_statistics(mut self, record_statistics: bool) -> Self {
        self.record_statistics = record_statistics;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        TrackerSettings {
            installed: true,
            record_statistics: true,
            debug: false,
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            trust_forwarded_for: false,
            bulk: BulkConfig::default(),
        }
    }
}

/// Bulk submission authentication
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct BulkConfig {
    /// Accepted values of `token_auth`
    #[serde(default)]
    pub token_auth: Vec<String>,
    /// Reject bulk payloads that carry no token
    #[serde(default)]
    pub require_token: bool,
}

impl BulkConfig {
    pub fn accepts(&self, token: &str) -> bool {
        self.token_auth.iter().any(|accepted| accepted == token)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StorageConfig {
    Memory,
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let StorageConfig::Sqlite {
            max_connections: 0, ..
        } = self
        {
            return Err(ValidationError::InvalidMaxConnections);
        }
        Ok(())
    }

    pub fn connector(&self) -> Arc<dyn StoreConnector> {
        match self {
            StorageConfig::Memory => Arc::new(MemoryConnector::new()),
            StorageConfig::Sqlite {
                path,
                max_connections,
            } => Arc::new(SqliteConnector::new(path, *max_connections)),
        }
    }
}

/// Checkpoint policy of the external archiving job
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    /// Minimum time between two archiving runs of the same site and period
    #[serde(default = "default_archive_min_interval_secs")]
    pub min_interval_secs: u64,
}

impl ArchiveConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            min_interval_secs: default_archive_min_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_connections() -> u32 {
    8
}

fn default_archive_min_interval_secs() -> u64 {
    3600
}
