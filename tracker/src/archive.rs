//! Checkpoints of the external archiving job.
//!
//! The archiver itself lives elsewhere; this module only records when it last
//! ran for a site and tells whether another run is due.

use crate::config::ArchiveConfig;
use crate::model::Timestamp;
use crate::store::{StoreError, TrackerStore};
use site_cache::SiteId;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchivePeriod {
    Day,
    /// Week, month and year archives, which run together.
    Periods,
}

impl ArchivePeriod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ArchivePeriod::Day => "day",
            ArchivePeriod::Periods => "periods",
        }
    }
}

impl fmt::Display for ArchivePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("unknown archive period {0:?}, expected \"day\" or \"periods\"")]
pub struct UnknownPeriod(String);

impl FromStr for ArchivePeriod {
    type Err = UnknownPeriod;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "day" => Ok(ArchivePeriod::Day),
            "periods" => Ok(ArchivePeriod::Periods),
            other => Err(UnknownPeriod(other.to_string())),
        }
    }
}

/// Option name holding the last successful run of `period` for `site_id`.
pub fn last_run_key(period: ArchivePeriod, site_id: SiteId) -> String {
    format!("lastRunArchive{period}_{site_id}")
}

pub struct ArchiveScheduler {
    min_interval: Duration,
}

impl ArchiveScheduler {
    pub fn new(min_interval: Duration) -> Self {
        ArchiveScheduler { min_interval }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(config.min_interval())
    }

    /// Time of the last successful run. Unreadable checkpoints count as never run.
    pub async fn last_run(
        &self,
        store: &dyn TrackerStore,
        period: ArchivePeriod,
        site_id: SiteId,
    ) -> Result<Option<Timestamp>, StoreError> {
        let key = last_run_key(period, site_id);
        let Some(raw) = store.get_option(&key).await? else {
            return Ok(None);
        };

        match raw.trim().parse::<Timestamp>() {
            Ok(at) => Ok(Some(at)),
            Err(_) => {
                tracing::warn!(key = %key, value = %raw, "ignoring unreadable archive checkpoint");
                Ok(None)
            }
        }
    }

    pub async fn is_due(
        &self,
        store: &dyn TrackerStore,
        period: ArchivePeriod,
        site_id: SiteId,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let min_interval = self.min_interval.as_secs() as Timestamp;
        Ok(match self.last_run(store, period, site_id).await? {
            Some(last) => now.saturating_sub(last) >= min_interval,
            None => true,
        })
    }

    pub async fn mark_run(
        &self,
        store: &dyn TrackerStore,
        period: ArchivePeriod,
        site_id: SiteId,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        store
            .set_option(&last_run_key(period, site_id), &at.to_string())
            .await
    }

    /// Subset of `sites` for which `period` is due, in the given order.
    pub async fn due_sites(
        &self,
        store: &dyn TrackerStore,
        period: ArchivePeriod,
        sites: &[SiteId],
        now: Timestamp,
    ) -> Result<Vec<SiteId>, StoreError> {
        let mut due = Vec::new();
        for &site_id in sites {
            if self.is_due(store, period, site_id, now).await? {
                due.push(site_id);
            }
        }
        Ok(due)
    }
}
