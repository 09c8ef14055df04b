/// Site sources provide the authoritative site settings the cache is filled from.
use crate::types::{SiteConfig, SiteId};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_yaml::Error),
}

pub trait SiteSource: Send + Sync {
    /// Loads the settings of a single site, `None` when the site does not exist.
    fn load(&self, site_id: SiteId) -> Result<Option<SiteConfig>, SourceError>;

    /// Loads every known site.
    fn load_all(&self) -> Result<Vec<SiteConfig>, SourceError>;
}

/// Fixed set of sites, typically taken from the service configuration.
pub struct StaticSiteSource {
    sites: HashMap<SiteId, SiteConfig>,
}

impl StaticSiteSource {
    pub fn new(sites: Vec<SiteConfig>) -> Self {
        StaticSiteSource {
            sites: sites.into_iter().map(|site| (site.id, site)).collect(),
        }
    }
}

impl SiteSource for StaticSiteSource {
    fn load(&self, site_id: SiteId) -> Result<Option<SiteConfig>, SourceError> {
        Ok(self.sites.get(&site_id).cloned())
    }

    fn load_all(&self) -> Result<Vec<SiteConfig>, SourceError> {
        let mut sites: Vec<SiteConfig> = self.sites.values().cloned().collect();
        sites.sort_by_key(|site| site.id);
        Ok(sites)
    }
}

#[derive(Deserialize)]
struct SiteList {
    #[serde(default)]
    sites: Vec<SiteConfig>,
}

/// Reads sites from a YAML file maintained by the admin side.
///
/// The file is read again on every cache miss, so edits become visible once
/// the cached entry expires.
pub struct FilesystemSiteSource {
    path: PathBuf,
}

impl FilesystemSiteSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FilesystemSiteSource {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read(&self) -> Result<SiteList, SourceError> {
        let file = File::open(&self.path)?;
        let reader = io::BufReader::new(file);
        Ok(serde_yaml::from_reader(reader)?)
    }
}

impl SiteSource for FilesystemSiteSource {
    fn load(&self, site_id: SiteId) -> Result<Option<SiteConfig>, SourceError> {
        let list = self.read()?;
        Ok(list.sites.into_iter().find(|site| site.id == site_id))
    }

    fn load_all(&self) -> Result<Vec<SiteConfig>, SourceError> {
        Ok(self.read()?.sites)
    }
}
