use crate::config::SiteCacheConfig;
use crate::metrics_defs::{SITE_CACHE_HIT, SITE_CACHE_MISS, SITE_SOURCE_ERRORS};
use crate::negative_cache::NegativeCache;
use crate::source::{SiteSource, SourceError};
use crate::types::{SiteConfig, SiteId};
use moka::sync::Cache;
use shared::counter;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SiteCacheError {
    #[error("site {0} not found")]
    NotFound(SiteId),

    #[error("could not load site settings: {0}")]
    Source(#[from] SourceError),
}

struct SiteConfigCacheInner {
    entries: Cache<SiteId, Arc<SiteConfig>>,
    negative: NegativeCache,
    source: Arc<dyn SiteSource>,
}

/// Shared, cheaply clonable handle to the site settings cache.
///
/// Lookups are safe from any number of tasks. The ingestion path only ever
/// reads; [`SiteConfigCache::invalidate`] is for the admin side.
#[derive(Clone)]
pub struct SiteConfigCache {
    inner: Arc<SiteConfigCacheInner>,
}

impl SiteConfigCache {
    pub fn new(config: &SiteCacheConfig, source: Arc<dyn SiteSource>) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl())
            .build();

        SiteConfigCache {
            inner: Arc::new(SiteConfigCacheInner {
                entries,
                negative: NegativeCache::new(),
                source,
            }),
        }
    }

    pub fn lookup(&self, site_id: SiteId) -> Result<Arc<SiteConfig>, SiteCacheError> {
        if let Some(site) = self.inner.entries.get(&site_id) {
            counter!(SITE_CACHE_HIT).increment(1);
            return Ok(site);
        }

        if self.inner.negative.contains(site_id) {
            return Err(SiteCacheError::NotFound(site_id));
        }

        counter!(SITE_CACHE_MISS).increment(1);
        let loaded = self.inner.source.load(site_id).inspect_err(|err| {
            counter!(SITE_SOURCE_ERRORS).increment(1);
            tracing::warn!(site_id, error = %err, "failed to load site settings");
        })?;

        match loaded {
            Some(site) => {
                let site = Arc::new(site);
                self.inner.entries.insert(site_id, site.clone());
                Ok(site)
            }
            None => {
                self.inner.negative.insert(site_id);
                Err(SiteCacheError::NotFound(site_id))
            }
        }
    }

    /// Drops the cached settings of one site so the next lookup reloads them.
    pub fn invalidate(&self, site_id: SiteId) {
        self.inner.entries.invalidate(&site_id);
        self.inner.negative.remove(site_id);
    }

    pub fn invalidate_all(&self) {
        self.inner.entries.invalidate_all();
        self.inner.negative.clear();
    }

    /// Loads every site from the source into the cache.
    ///
    /// Returns the number of sites loaded.
    pub fn warm(&self) -> Result<usize, SiteCacheError> {
        let sites = self.inner.source.load_all()?;
        let count = sites.len();
        for site in sites {
            self.inner.negative.remove(site.id);
            self.inner.entries.insert(site.id, Arc::new(site));
        }
        tracing::info!(count, "site cache warmed");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FilesystemSiteSource, StaticSiteSource};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSource {
        inner: StaticSiteSource,
        loads: AtomicUsize,
    }

    impl SiteSource for CountingSource {
        fn load(&self, site_id: SiteId) -> Result<Option<SiteConfig>, SourceError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(site_id)
        }

        fn load_all(&self) -> Result<Vec<SiteConfig>, SourceError> {
            self.inner.load_all()
        }
    }

    fn counting_source(sites: Vec<SiteConfig>) -> Arc<CountingSource> {
        Arc::new(CountingSource {
            inner: StaticSiteSource::new(sites),
            loads: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_lookup_caches_found_sites() {
        let source = counting_source(vec![SiteConfig::new(1)]);
        let cache = SiteConfigCache::new(&SiteCacheConfig::default(), source.clone());

        assert_eq!(cache.lookup(1).unwrap().id, 1);
        assert_eq!(cache.lookup(1).unwrap().id, 1);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_site_hits_negative_cache() {
        let source = counting_source(vec![]);
        let cache = SiteConfigCache::new(&SiteCacheConfig::default(), source.clone());

        assert!(matches!(cache.lookup(9), Err(SiteCacheError::NotFound(9))));
        assert!(matches!(cache.lookup(9), Err(SiteCacheError::NotFound(9))));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.yaml");
        std::fs::write(&path, "sites:\n  - id: 1\n").unwrap();

        let cache = SiteConfigCache::new(
            &SiteCacheConfig::default(),
            Arc::new(FilesystemSiteSource::new(&path)),
        );
        assert!(cache.lookup(1).unwrap().enabled);

        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "sites:\n  - id: 1\n    enabled: false\n").unwrap();

        // Still served from the cache until invalidated.
        assert!(cache.lookup(1).unwrap().enabled);
        cache.invalidate(1);
        assert!(!cache.lookup(1).unwrap().enabled);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let source = counting_source(vec![SiteConfig::new(1)]);
        let config = SiteCacheConfig {
            ttl_secs: 1,
            max_capacity: 10,
        };
        let cache = SiteConfigCache::new(&config, source.clone());

        cache.lookup(1).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        cache.lookup(1).unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_warm_fills_cache() {
        let source = counting_source(vec![SiteConfig::new(1), SiteConfig::new(2)]);
        let cache = SiteConfigCache::new(&SiteCacheConfig::default(), source.clone());

        assert_eq!(cache.warm().unwrap(), 2);
        cache.lookup(1).unwrap();
        cache.lookup(2).unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_lookups() {
        let source = counting_source((1..=4).map(SiteConfig::new).collect());
        let cache = SiteConfigCache::new(&SiteCacheConfig::default(), source);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.lookup(i % 4 + 1).unwrap().id)
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), (i as u32) % 4 + 1);
        }
    }
}
