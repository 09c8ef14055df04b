//! Durable storage of visits, actions, action names and options.

pub mod memory;
pub mod sqlite;

use crate::model::{
    Action, ActionName, ActionNameId, ActionNameKind, Fingerprint, NewHit, RecordedHit,
    Timestamp, Visit, VisitId,
};
use async_trait::async_trait;
use site_cache::SiteId;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage is unavailable: {0}")]
    Unavailable(String),

    /// An open visit already exists for the same site and fingerprint.
    #[error("an open visit already exists")]
    Conflict,

    #[error("record not found")]
    NotFound,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One connection to the tracker storage.
///
/// Visits and actions are only written through [`TrackerStore::record_hit`],
/// which never creates a second open visit for the same site and fingerprint.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Most recent visit of `fingerprint` whose last action is not older than `since`.
    async fn find_open_visit(
        &self,
        site_id: SiteId,
        fingerprint: Fingerprint,
        since: Timestamp,
    ) -> Result<Option<Visit>, StoreError>;

    /// Writes the visit change, missing action names and the action of one
    /// hit, all or nothing.
    ///
    /// A [`VisitTarget::New`](crate::model::VisitTarget::New) target fails
    /// with [`StoreError::Conflict`] when an open visit exists, and an
    /// [`VisitTarget::Open`](crate::model::VisitTarget::Open) one with
    /// [`StoreError::NotFound`] when the visit is gone.
    async fn record_hit(&self, hit: &NewHit) -> Result<RecordedHit, StoreError>;

    async fn visit(&self, visit_id: VisitId) -> Result<Option<Visit>, StoreError>;

    async fn visit_count(&self, site_id: SiteId) -> Result<u64, StoreError>;

    async fn find_action_name(
        &self,
        name: &str,
        kind: ActionNameKind,
    ) -> Result<Option<ActionNameId>, StoreError>;

    async fn action_name(&self, id: ActionNameId) -> Result<Option<ActionName>, StoreError>;

    async fn actions_of_visit(&self, visit_id: VisitId) -> Result<Vec<Action>, StoreError>;

    async fn get_option(&self, name: &str) -> Result<Option<String>, StoreError>;

    async fn set_option(&self, name: &str, value: &str) -> Result<(), StoreError>;
}

/// Opens connections to a storage backend.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn TrackerStore>, StoreError>;
}
