//! Visit resolution: find the open visit of a hit or create a new one.

use crate::action::{ActionLogger, PendingAction};
use crate::metrics_defs::{VISIT_FACTORY_ERRORS, VISITS_CREATED};
use crate::model::{Fingerprint, NewVisit, RecordedHit, Timestamp, VisitTarget};
use crate::request::TrackingRequest;
use crate::store::{StoreError, TrackerStore};
use sha2::{Digest, Sha256};
use shared::counter;
use site_cache::{SiteConfig, SiteId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lookups attempted before giving up on a visit that keeps being created
/// concurrently.
pub const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct VisitFactoryError(pub String);

/// Hook that may replace the visit about to be created, typically to enrich it.
///
/// Returning `Ok(None)` passes the decision to the next factory.
pub trait VisitFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(
        &self,
        request: &TrackingRequest,
        site: &SiteConfig,
        proposed: &NewVisit,
    ) -> Result<Option<NewVisit>, VisitFactoryError>;
}

/// Visit factories in registration order.
#[derive(Clone, Default)]
pub struct VisitFactoryChain {
    factories: Vec<Arc<dyn VisitFactory>>,
}

impl VisitFactoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn VisitFactory>) {
        self.factories.push(factory);
    }

    pub fn with(mut self, factory: Arc<dyn VisitFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// The first visit a factory returns wins; failures are logged and the
    /// next factory is asked. Falls back to `proposed`.
    pub fn build(
        &self,
        request: &TrackingRequest,
        site: &SiteConfig,
        proposed: NewVisit,
    ) -> NewVisit {
        for factory in &self.factories {
            match factory.create(request, site, &proposed) {
                Ok(Some(mut visit)) => {
                    // A factory may enrich the visit but never move it to
                    // another site or visitor.
                    visit.site_id = proposed.site_id;
                    visit.fingerprint = proposed.fingerprint;
                    tracing::debug!(factory = factory.name(), "visit built by factory");
                    return visit;
                }
                Ok(None) => {}
                Err(err) => {
                    counter!(VISIT_FACTORY_ERRORS, "factory" => factory.name().to_string())
                        .increment(1);
                    tracing::warn!(factory = factory.name(), error = %err, "visit factory failed");
                }
            }
        }
        proposed
    }
}

/// Identity of the visitor behind a hit.
///
/// An explicit visitor id wins. Otherwise the id is derived from the site
/// and the client's IP, user agent and language.
pub fn fingerprint(request: &TrackingRequest, site_id: SiteId) -> Fingerprint {
    if let Some(explicit) = request.visitor_id() {
        return explicit;
    }

    let ip = request
        .client_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(site_id.to_be_bytes());
    hasher.update(ip.as_bytes());
    hasher.update([0]);
    hasher.update(request.user_agent().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(request.language().unwrap_or_default().as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    Fingerprint(u64::from_be_bytes(bytes))
}

pub struct VisitResolver<'a> {
    store: &'a dyn TrackerStore,
    factories: &'a VisitFactoryChain,
}

impl<'a> VisitResolver<'a> {
    pub fn new(store: &'a dyn TrackerStore, factories: &'a VisitFactoryChain) -> Self {
        VisitResolver { store, factories }
    }

    /// Attaches the hit to the open visit of its visitor, or creates one, and
    /// logs its action in the same write.
    pub async fn resolve(
        &self,
        request: &TrackingRequest,
        site: &SiteConfig,
        pending: &PendingAction,
    ) -> Result<RecordedHit, StoreError> {
        let fingerprint = fingerprint(request, site.id);
        let now = request.timestamp();
        let since = now.saturating_sub(site.visit_timeout().as_secs() as Timestamp);
        let logger = ActionLogger::new(self.store);
        let mut candidate: Option<NewVisit> = None;

        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            let target = match self
                .store
                .find_open_visit(site.id, fingerprint, since)
                .await?
            {
                Some(open) => VisitTarget::Open(open.id),
                None => {
                    let visit = candidate.get_or_insert_with(|| {
                        let proposed = default_visit(request, site.id, fingerprint, now);
                        self.factories.build(request, site, proposed)
                    });
                    VisitTarget::New {
                        visit: visit.clone(),
                        since,
                    }
                }
            };

            match logger.log(target, pending, now).await {
                Ok(recorded) => {
                    if recorded.visit_created {
                        counter!(VISITS_CREATED).increment(1);
                    }
                    return Ok(recorded);
                }
                Err(StoreError::Conflict) => {
                    tracing::debug!(
                        attempt,
                        site_id = site.id,
                        %fingerprint,
                        "visit created concurrently, retrying lookup"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::Conflict)
    }
}

fn default_visit(
    request: &TrackingRequest,
    site_id: SiteId,
    fingerprint: Fingerprint,
    now: Timestamp,
) -> NewVisit {
    NewVisit {
        site_id,
        fingerprint,
        first_action_time: now,
        custom_variables: request.custom_variables(),
        client_ip: request.client_ip().map(|ip| ip.to_string()),
        user_agent: request.user_agent().map(str::to_string),
        language: request.language().map(str::to_string),
        attributes: BTreeMap::new(),
    }
}
