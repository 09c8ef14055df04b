use crate::config::TrackerSettings;
use crate::store::memory::{MemoryConnector, MemoryStore};
use crate::tracker::TrackerEnv;
use crate::visit::{VisitFactory, VisitFactoryChain};
use parking_lot::RwLock;
use site_cache::{SiteCacheConfig, SiteConfig, SiteConfigCache, SiteId, SiteSource, SourceError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Site source that tests can add sites to after the cache was built.
#[derive(Default)]
pub struct TestSiteSource {
    sites: RwLock<BTreeMap<SiteId, SiteConfig>>,
}

impl TestSiteSource {
    pub fn insert(&self, site: SiteConfig) {
        self.sites.write().insert(site.id, site);
    }
}

impl SiteSource for TestSiteSource {
    fn load(&self, site_id: SiteId) -> Result<Option<SiteConfig>, SourceError> {
        Ok(self.sites.read().get(&site_id).cloned())
    }

    fn load_all(&self) -> Result<Vec<SiteConfig>, SourceError> {
        Ok(self.sites.read().values().cloned().collect())
    }
}

/// In-memory tracker environment with site 1 configured.
pub struct TestEnv {
    pub env: TrackerEnv,
    pub store: Arc<MemoryStore>,
    pub connector: Arc<MemoryConnector>,
    pub sites: Arc<TestSiteSource>,
}

impl TestEnv {
    pub fn new() -> Self {
        let sites = Arc::new(TestSiteSource::default());
        sites.insert(SiteConfig::new(1));

        let connector = Arc::new(MemoryConnector::new());
        let env = TrackerEnv {
            settings: TrackerSettings::default(),
            sites: SiteConfigCache::new(&SiteCacheConfig::default(), sites.clone()),
            connector: connector.clone(),
            factories: VisitFactoryChain::new(),
        };

        TestEnv {
            env,
            store: connector.store(),
            connector,
            sites,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn VisitFactory>) -> Self {
        self.env.factories.register(factory);
        self
    }

    pub fn with_settings(mut self, settings: TrackerSettings) -> Self {
        self.env.settings = settings;
        self
    }

    pub fn add_site(&self, site: SiteConfig) {
        let site_id = site.id;
        self.sites.insert(site);
        self.env.sites.invalidate(site_id);
    }
}
