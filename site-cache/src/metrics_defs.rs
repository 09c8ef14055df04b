//! Metrics definitions for the site config cache.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SITE_CACHE_HIT: MetricDef = MetricDef {
    name: "site_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of site lookups answered from the cache",
};

pub const SITE_CACHE_MISS: MetricDef = MetricDef {
    name: "site_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of site lookups that had to go to the site source",
};

pub const NEGATIVE_CACHE_HIT: MetricDef = MetricDef {
    name: "site_cache.negative.hit",
    metric_type: MetricType::Counter,
    description: "Number of lookups that hit the negative cache",
};

pub const NEGATIVE_CACHE_MISS: MetricDef = MetricDef {
    name: "site_cache.negative.miss",
    metric_type: MetricType::Counter,
    description: "Number of lookups that missed the negative cache",
};

pub const SITE_SOURCE_ERRORS: MetricDef = MetricDef {
    name: "site_cache.source.errors",
    metric_type: MetricType::Counter,
    description: "Number of failed loads from the site source",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SITE_CACHE_HIT,
    SITE_CACHE_MISS,
    NEGATIVE_CACHE_HIT,
    NEGATIVE_CACHE_MISS,
    SITE_SOURCE_ERRORS,
];
