//! Metrics definitions for the tracking pipeline.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUESTS_RECEIVED: MetricDef = MetricDef {
    name: "tracker.requests.received",
    metric_type: MetricType::Counter,
    description: "Number of tracking requests received, bulk items included",
};

pub const REQUESTS_LOGGED: MetricDef = MetricDef {
    name: "tracker.requests.logged",
    metric_type: MetricType::Counter,
    description: "Number of tracking requests that produced a stored action",
};

pub const REQUESTS_SKIPPED: MetricDef = MetricDef {
    name: "tracker.requests.skipped",
    metric_type: MetricType::Counter,
    description: "Number of tracking requests skipped, tagged by reason",
};

pub const BATCH_DURATION: MetricDef = MetricDef {
    name: "tracker.batch.duration",
    metric_type: MetricType::Histogram,
    description: "Time spent processing one batch, in seconds",
};

pub const BATCH_TIMEOUTS: MetricDef = MetricDef {
    name: "tracker.batch.timeouts",
    metric_type: MetricType::Counter,
    description: "Number of batches cut short by the request deadline",
};

pub const VISITS_CREATED: MetricDef = MetricDef {
    name: "tracker.visits.created",
    metric_type: MetricType::Counter,
    description: "Number of new visits written",
};

pub const VISIT_FACTORY_ERRORS: MetricDef = MetricDef {
    name: "tracker.visit_factory.errors",
    metric_type: MetricType::Counter,
    description: "Number of visit factory failures, tagged by factory",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUESTS_RECEIVED,
    REQUESTS_LOGGED,
    REQUESTS_SKIPPED,
    BATCH_DURATION,
    BATCH_TIMEOUTS,
    VISITS_CREATED,
    VISIT_FACTORY_ERRORS,
];
