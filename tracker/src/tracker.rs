//! Tracking orchestration: one [`Tracker`] per call drives every request of
//! a batch through visit resolution and action logging.

use crate::action::PendingAction;
use crate::config::{Config, TrackerSettings};
use crate::db::Database;
use crate::errors::{Result, TrackerError};
use crate::metrics_defs::{
    BATCH_DURATION, BATCH_TIMEOUTS, REQUESTS_LOGGED, REQUESTS_RECEIVED, REQUESTS_SKIPPED,
};
use crate::model::Action;
use crate::request::TrackingRequest;
use crate::request_set::RequestBatch;
use crate::response::{ResponseBuilder, TrackerResponse};
use crate::store::StoreConnector;
use crate::visit::{VisitFactoryChain, VisitResolver};
use shared::{counter, histogram};
use site_cache::{SiteCacheError, SiteConfigCache};
use std::sync::Arc;
use tokio::time::{Instant, timeout_at};

/// Everything a [`Tracker`] needs that outlives a single call.
#[derive(Clone)]
pub struct TrackerEnv {
    pub settings: TrackerSettings,
    pub sites: SiteConfigCache,
    pub connector: Arc<dyn StoreConnector>,
    pub factories: VisitFactoryChain,
}

impl TrackerEnv {
    pub fn from_config(config: &Config) -> Self {
        TrackerEnv {
            settings: config.settings.clone(),
            sites: SiteConfigCache::new(&config.site_cache, config.sites.build()),
            connector: config.storage.connector(),
            factories: VisitFactoryChain::new(),
        }
    }

    pub fn with_factories(mut self, factories: VisitFactoryChain) -> Self {
        self.factories = factories;
        self
    }

    pub fn with_settings(mut self, settings: TrackerSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Counters of one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub received: u64,
    pub logged: u64,
    pub skipped: u64,
    /// The deadline expired before every request was processed.
    pub timed_out: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    RecordingDisabled,
}

impl SkipReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Empty => "empty",
            SkipReason::RecordingDisabled => "recording_disabled",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrackOutcome {
    Logged(Action),
    Skipped(SkipReason),
}

pub struct Tracker {
    settings: TrackerSettings,
    sites: SiteConfigCache,
    factories: VisitFactoryChain,
    db: Database,
    outcome: BatchOutcome,
}

impl Tracker {
    pub fn new(env: &TrackerEnv) -> Self {
        Tracker {
            settings: env.settings.clone(),
            sites: env.sites.clone(),
            factories: env.factories.clone(),
            db: Database::new(env.connector.clone()),
            outcome: BatchOutcome::default(),
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn is_installed(&self) -> bool {
        self.settings.installed
    }

    pub fn should_record_statistics(&self) -> bool {
        self.settings.installed && self.settings.record_statistics
    }

    pub fn is_debug_mode_enabled(&self) -> bool {
        self.settings.debug
    }

    pub fn count_of_logged_requests(&self) -> u64 {
        self.outcome.logged
    }

    pub fn outcome(&self) -> BatchOutcome {
        self.outcome
    }

    pub fn database(&mut self) -> &mut Database {
        &mut self.db
    }

    pub fn is_database_connected(&self) -> bool {
        self.db.is_connected()
    }

    pub fn disconnect_database(&mut self) {
        self.db.disconnect();
    }

    /// Processes every request of `batch` and builds the response.
    ///
    /// Only failures that concern the whole call are returned; a bad request
    /// is skipped and counted. The request timeout bounds the whole run: an
    /// item still in flight when it expires is abandoned and its writes are
    /// rolled back.
    pub async fn main(&mut self, mut batch: RequestBatch) -> Result<TrackerResponse> {
        let started = Instant::now();
        let deadline = started + self.settings.request_timeout();
        let should_record = self.should_record_statistics();

        batch.init_requests();
        let total = batch.len();

        if should_record && batch.requests().iter().any(|request| !request.is_empty()) {
            match timeout_at(deadline, self.db.get()).await {
                Ok(connected) => {
                    connected.map_err(TrackerError::StorageUnavailable)?;
                }
                Err(_) => self.expire(0, total),
            }
        }

        for (index, request) in batch.requests().iter().enumerate() {
            if self.outcome.timed_out {
                break;
            }
            if Instant::now() >= deadline {
                self.expire(index, total);
                break;
            }

            if self.settings.debug {
                tracing::info!(index, params = ?request.params(), "tracking request");
            }

            let Ok(result) = timeout_at(deadline, self.track_request(request)).await else {
                self.expire(index, total);
                break;
            };

            self.outcome.received += 1;
            counter!(REQUESTS_RECEIVED).increment(1);

            match result {
                Ok(TrackOutcome::Logged(action)) => {
                    self.outcome.logged += 1;
                    counter!(REQUESTS_LOGGED).increment(1);
                    tracing::debug!(
                        index,
                        visit_id = action.visit_id,
                        action_id = action.id,
                        "request logged"
                    );
                }
                Ok(TrackOutcome::Skipped(reason)) => {
                    self.outcome.skipped += 1;
                    counter!(REQUESTS_SKIPPED, "reason" => reason.as_str()).increment(1);
                }
                Err(err) if err.is_recoverable() => {
                    self.outcome.skipped += 1;
                    counter!(REQUESTS_SKIPPED, "reason" => err.skip_reason()).increment(1);
                    tracing::warn!(index, error = %err, "skipping tracking request");
                }
                Err(err) => return Err(err),
            }
        }

        histogram!(BATCH_DURATION).record(started.elapsed().as_secs_f64());
        Ok(ResponseBuilder::build(&batch, &self.outcome))
    }

    /// Counts the requests from `processed` on as received and skipped.
    fn expire(&mut self, processed: usize, total: usize) {
        let remaining = (total - processed) as u64;
        self.outcome.received += remaining;
        self.outcome.skipped += remaining;
        self.outcome.timed_out = true;
        counter!(REQUESTS_RECEIVED).increment(remaining);
        counter!(REQUESTS_SKIPPED, "reason" => "timed_out").increment(remaining);
        counter!(BATCH_TIMEOUTS).increment(1);
        tracing::warn!(
            processed,
            remaining,
            "request deadline expired, skipping the rest of the batch"
        );
    }

    /// Tracks one request. Does not touch the batch counters.
    pub async fn track_request(&mut self, request: &TrackingRequest) -> Result<TrackOutcome> {
        if request.is_empty() {
            return Ok(TrackOutcome::Skipped(SkipReason::Empty));
        }
        if !self.should_record_statistics() {
            return Ok(TrackOutcome::Skipped(SkipReason::RecordingDisabled));
        }

        let site_id = request.site_id()?;
        let site = self.sites.lookup(site_id).map_err(|err| match err {
            SiteCacheError::NotFound(id) => TrackerError::UnknownSite(id),
            SiteCacheError::Source(err) => TrackerError::SiteSource(err.to_string()),
        })?;
        if !site.enabled {
            return Err(TrackerError::DisabledSite(site_id));
        }

        let pending = PendingAction::from_request(request)?;

        let store = self.db.get().await?;
        let recorded = VisitResolver::new(store.as_ref(), &self.factories)
            .resolve(request, &site, &pending)
            .await?;

        Ok(TrackOutcome::Logged(recorded.action))
    }
}
