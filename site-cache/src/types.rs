use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub type SiteId = u32;

/// Default length of a visit: a hit arriving later than this after the
/// previous one starts a new visit.
pub const DEFAULT_VISIT_TIMEOUT_SECS: u64 = 1800;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SiteConfig {
    pub id: SiteId,
    #[serde(default)]
    pub name: String,
    /// Hits for disabled sites are acknowledged but never stored.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_visit_timeout_secs")]
    pub visit_timeout_secs: u64,
    /// Free-form settings consumed by visit factories.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl SiteConfig {
    pub fn new(id: SiteId) -> Self {
        SiteConfig {
            id,
            name: String::new(),
            enabled: true,
            visit_timeout_secs: DEFAULT_VISIT_TIMEOUT_SECS,
            settings: BTreeMap::new(),
        }
    }

    pub fn visit_timeout(&self) -> Duration {
        Duration::from_secs(self.visit_timeout_secs)
    }

    pub fn with_visit_timeout(mut self, timeout: Duration) -> Self {
        self.visit_timeout_secs = timeout.as_secs();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn default_enabled() -> bool {
    true
}

fn default_visit_timeout_secs() -> u64 {
    DEFAULT_VISIT_TIMEOUT_SECS
}
