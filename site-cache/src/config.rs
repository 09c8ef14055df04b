use crate::source::{FilesystemSiteSource, SiteSource, StaticSiteSource};
use crate::types::SiteConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SiteSourceConfig {
    Static { sites: Vec<SiteConfig> },
    Filesystem { path: PathBuf },
}

impl SiteSourceConfig {
    pub fn build(&self) -> Arc<dyn SiteSource> {
        match self {
            SiteSourceConfig::Static { sites } => Arc::new(StaticSiteSource::new(sites.clone())),
            SiteSourceConfig::Filesystem { path } => Arc::new(FilesystemSiteSource::new(path)),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct SiteCacheConfig {
    /// Upper bound on how long a cached site may be served after it changed.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

impl SiteCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for SiteCacheConfig {
    fn default() -> Self {
        SiteCacheConfig {
            ttl_secs: default_ttl_secs(),
            max_capacity: default_max_capacity(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_max_capacity() -> u64 {
    10_000
}
