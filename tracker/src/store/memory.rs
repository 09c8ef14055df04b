use crate::model::{
    Action, ActionId, ActionName, ActionNameId, ActionNameIds, ActionNameKind, Fingerprint,
    NewHit, RecordedHit, Timestamp, Visit, VisitId, VisitTarget,
};
use crate::store::{StoreConnector, StoreError, TrackerStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use site_cache::SiteId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Tables {
    visits: BTreeMap<VisitId, Visit>,
    actions: BTreeMap<ActionId, Action>,
    action_names: BTreeMap<ActionNameId, ActionName>,
    options: HashMap<String, String>,
    next_visit_id: VisitId,
    next_action_id: ActionId,
    next_action_name_id: ActionNameId,
}

impl Tables {
    fn open_visit(
        &self,
        site_id: SiteId,
        fingerprint: Fingerprint,
        since: Timestamp,
    ) -> Option<&Visit> {
        self.visits
            .values()
            .filter(|visit| {
                visit.site_id == site_id
                    && visit.fingerprint == fingerprint
                    && visit.last_action_time >= since
            })
            .max_by_key(|visit| visit.last_action_time)
    }

    fn find_action_name(&self, name: &str, kind: ActionNameKind) -> Option<ActionNameId> {
        self.action_names
            .values()
            .find(|entry| entry.kind == kind && entry.name == name)
            .map(|entry| entry.id)
    }

    fn action_name_id(&mut self, name: &str, kind: ActionNameKind) -> ActionNameId {
        if let Some(id) = self.find_action_name(name, kind) {
            return id;
        }
        self.next_action_name_id += 1;
        let id = self.next_action_name_id;
        self.action_names.insert(
            id,
            ActionName {
                id,
                name: name.to_string(),
                kind,
            },
        );
        id
    }
}

/// Process-local storage, used by tests and single-node setups that do not
/// need durability.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Simulates an outage: every operation fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Simulates a slow backend: every operation waits `delay` first.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn check(&self) -> Result<(), StoreError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        }
    }

    pub fn visits(&self) -> Vec<Visit> {
        self.tables.read().visits.values().cloned().collect()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.tables.read().actions.values().cloned().collect()
    }

    pub fn action_names(&self) -> Vec<ActionName> {
        self.tables.read().action_names.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackerStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check().await
    }

    async fn find_open_visit(
        &self,
        site_id: SiteId,
        fingerprint: Fingerprint,
        since: Timestamp,
    ) -> Result<Option<Visit>, StoreError> {
        self.check().await?;
        Ok(self
            .tables
            .read()
            .open_visit(site_id, fingerprint, since)
            .cloned())
    }

    async fn record_hit(&self, hit: &NewHit) -> Result<RecordedHit, StoreError> {
        self.check().await?;
        let mut tables = self.tables.write();

        // Only the visit step can fail, and it fails before anything is written.
        let (visit, visit_created) = match &hit.target {
            VisitTarget::Open(visit_id) => {
                let visit = tables
                    .visits
                    .get_mut(visit_id)
                    .ok_or(StoreError::NotFound)?;
                visit.last_action_time = visit.last_action_time.max(hit.time);
                visit.action_count += 1;
                (visit.clone(), false)
            }
            VisitTarget::New { visit, since } => {
                if tables
                    .open_visit(visit.site_id, visit.fingerprint, *since)
                    .is_some()
                {
                    return Err(StoreError::Conflict);
                }
                tables.next_visit_id += 1;
                let stored = Visit::from_new(tables.next_visit_id, visit);
                tables.visits.insert(stored.id, stored.clone());
                (stored, true)
            }
        };

        let mut ids = ActionNameIds::default();
        for name in &hit.names {
            ids.set(name.slot, tables.action_name_id(&name.name, name.kind));
        }

        tables.next_action_id += 1;
        let action = Action::from_new(tables.next_action_id, &hit.action(&visit, ids));
        tables.actions.insert(action.id, action.clone());

        Ok(RecordedHit {
            visit,
            action,
            visit_created,
        })
    }

    async fn visit(&self, visit_id: VisitId) -> Result<Option<Visit>, StoreError> {
        self.check().await?;
        Ok(self.tables.read().visits.get(&visit_id).cloned())
    }

    async fn visit_count(&self, site_id: SiteId) -> Result<u64, StoreError> {
        self.check().await?;
        Ok(self
            .tables
            .read()
            .visits
            .values()
            .filter(|visit| visit.site_id == site_id)
            .count() as u64)
    }

    async fn find_action_name(
        &self,
        name: &str,
        kind: ActionNameKind,
    ) -> Result<Option<ActionNameId>, StoreError> {
        self.check().await?;
        Ok(self.tables.read().find_action_name(name, kind))
    }

    async fn action_name(&self, id: ActionNameId) -> Result<Option<ActionName>, StoreError> {
        self.check().await?;
        Ok(self.tables.read().action_names.get(&id).cloned())
    }

    async fn actions_of_visit(&self, visit_id: VisitId) -> Result<Vec<Action>, StoreError> {
        self.check().await?;
        Ok(self
            .tables
            .read()
            .actions
            .values()
            .filter(|action| action.visit_id == visit_id)
            .cloned()
            .collect())
    }

    async fn get_option(&self, name: &str) -> Result<Option<String>, StoreError> {
        self.check().await?;
        Ok(self.tables.read().options.get(name).cloned())
    }

    async fn set_option(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.check().await?;
        self.tables
            .write()
            .options
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Hands out the same [`MemoryStore`] on every connect.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        MemoryConnector {
            store,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn TrackerStore>, StoreError> {
        self.store.check().await?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, HitName, NameSlot, NewVisit};

    fn new_visit(site_id: SiteId, fingerprint: u64, at: Timestamp) -> NewVisit {
        NewVisit {
            site_id,
            fingerprint: Fingerprint(fingerprint),
            first_action_time: at,
            custom_variables: vec![],
            client_ip: None,
            user_agent: None,
            language: None,
            attributes: BTreeMap::new(),
        }
    }

    fn hit(target: VisitTarget, url: &str, time: Timestamp) -> NewHit {
        NewHit {
            target,
            kind: ActionKind::Pageview,
            names: vec![HitName {
                slot: NameSlot::Url,
                name: url.to_string(),
                kind: ActionNameKind::PageUrl,
            }],
            event_value: None,
            time,
        }
    }

    fn create(site_id: SiteId, fingerprint: u64, at: Timestamp, since: Timestamp) -> VisitTarget {
        VisitTarget::New {
            visit: new_visit(site_id, fingerprint, at),
            since,
        }
    }

    #[tokio::test]
    async fn test_new_visit_conflicts_with_open_visit() {
        let store = MemoryStore::new();
        let first = store
            .record_hit(&hit(create(1, 7, 1000, 0), "a", 1000))
            .await
            .unwrap();
        assert!(first.visit_created);
        assert_eq!(first.visit.id, 1);
        assert_eq!(first.visit.action_count, 1);
        assert_eq!(first.action.position, 1);

        let err = store
            .record_hit(&hit(create(1, 7, 1100, 1000 - 1800), "b", 1100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        // The losing hit left nothing behind
        assert_eq!(store.actions().len(), 1);
        assert_eq!(store.action_names().len(), 1);

        // Other fingerprint, other site, or an expired visit do not conflict
        for target in [
            create(1, 8, 1100, -800),
            create(2, 7, 1100, -800),
            create(1, 7, 5000, 3200),
        ] {
            store.record_hit(&hit(target, "a", 1100)).await.unwrap();
        }
        assert_eq!(store.visit_count(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_hit_on_open_visit() {
        let store = MemoryStore::new();
        let first = store
            .record_hit(&hit(create(1, 7, 1000, 0), "a", 1000))
            .await
            .unwrap();
        let visit_id = first.visit.id;

        let second = store
            .record_hit(&hit(VisitTarget::Open(visit_id), "b", 1200))
            .await
            .unwrap();
        assert!(!second.visit_created);
        assert_eq!(second.visit.action_count, 2);
        assert_eq!(second.visit.last_action_time, 1200);
        assert_eq!(second.action.position, 2);

        // An older hit never moves the last action time backwards
        let third = store
            .record_hit(&hit(VisitTarget::Open(visit_id), "a", 900))
            .await
            .unwrap();
        assert_eq!(third.visit.action_count, 3);
        assert_eq!(third.visit.last_action_time, 1200);
        // Known names are reused
        assert_eq!(third.action.url_id, first.action.url_id);
        assert_eq!(store.action_names().len(), 2);
        assert_eq!(store.actions_of_visit(visit_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_hit_on_missing_visit_writes_nothing() {
        let store = MemoryStore::new();
        let err = store
            .record_hit(&hit(VisitTarget::Open(99), "a", 1000))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(store.visits().is_empty());
        assert!(store.actions().is_empty());
        assert!(store.action_names().is_empty());
    }

    #[tokio::test]
    async fn test_action_names_are_typed() {
        let store = MemoryStore::new();
        store
            .record_hit(&hit(create(1, 7, 1000, 0), "example.com", 1000))
            .await
            .unwrap();

        let found = store
            .find_action_name("example.com", ActionNameKind::PageUrl)
            .await
            .unwrap();
        assert_eq!(found, Some(1));
        assert_eq!(
            store
                .find_action_name("example.com", ActionNameKind::PageTitle)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            store.action_name(1).await.unwrap().map(|entry| entry.name),
            Some("example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_options() {
        let store = MemoryStore::new();
        assert_eq!(store.get_option("a").await.unwrap(), None);
        store.set_option("a", "1").await.unwrap();
        store.set_option("a", "2").await.unwrap();
        assert_eq!(store.get_option("a").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let connector = MemoryConnector::new();
        connector.store().set_available(false);
        assert!(matches!(
            connector.connect().await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(connector.connect_count(), 0);

        connector.store().set_available(true);
        let store = connector.connect().await.unwrap();
        store.ping().await.unwrap();
        assert_eq!(connector.connect_count(), 1);
    }
}
