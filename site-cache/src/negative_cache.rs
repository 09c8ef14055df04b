// Lightweight negative cache which temporarily stores unknown site ids in order to
// prevent repeated source lookups for sites that do not exist.
use crate::metrics_defs::{NEGATIVE_CACHE_HIT, NEGATIVE_CACHE_MISS};
use crate::types::SiteId;
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

const SIZE: u64 = 1000;
const TTL_SECS: u64 = 5;

pub struct NegativeCache {
    cache: Cache<SiteId, ()>,
}

impl NegativeCache {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .max_capacity(SIZE)
            .time_to_live(Duration::from_secs(TTL_SECS))
            .build();

        NegativeCache { cache }
    }

    pub fn insert(&self, site_id: SiteId) {
        self.cache.insert(site_id, ());
    }

    pub fn remove(&self, site_id: SiteId) {
        self.cache.invalidate(&site_id);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn contains(&self, site_id: SiteId) -> bool {
        let cache_hit = self.cache.contains_key(&site_id);
        let metric_def = if cache_hit {
            NEGATIVE_CACHE_HIT
        } else {
            NEGATIVE_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        cache_hit
    }
}
