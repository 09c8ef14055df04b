use crate::store::{StoreConnector, StoreError, TrackerStore};
use std::sync::Arc;

/// Lazily acquired storage connection of one tracking run.
///
/// Nothing is opened until [`Database::get`] is called. After
/// [`Database::disconnect`] the next access connects again.
pub struct Database {
    connector: Arc<dyn StoreConnector>,
    store: Option<Arc<dyn TrackerStore>>,
}

impl Database {
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Database {
            connector,
            store: None,
        }
    }

    pub async fn get(&mut self) -> Result<Arc<dyn TrackerStore>, StoreError> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }

        let store = self.connector.connect().await?;
        tracing::debug!("storage connection acquired");
        self.store = Some(store.clone());
        Ok(store)
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_some()
    }

    pub fn disconnect(&mut self) {
        if self.store.take().is_some() {
            tracing::debug!("storage connection released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryConnector;

    #[tokio::test]
    async fn test_lazy_connect_and_reconnect() {
        let connector = Arc::new(MemoryConnector::new());
        let mut db = Database::new(connector.clone());
        assert!(!db.is_connected());
        assert_eq!(connector.connect_count(), 0);

        db.get().await.unwrap();
        db.get().await.unwrap();
        assert!(db.is_connected());
        assert_eq!(connector.connect_count(), 1);

        db.disconnect();
        assert!(!db.is_connected());

        db.get().await.unwrap();
        assert!(db.is_connected());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_stays_disconnected() {
        let connector = Arc::new(MemoryConnector::new());
        connector.store().set_available(false);
        let mut db = Database::new(connector.clone());

        assert!(matches!(db.get().await, Err(StoreError::Unavailable(_))));
        assert!(!db.is_connected());
    }
}
