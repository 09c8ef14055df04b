//! Action logging: names resolved through the action name table, then the
//! action itself written against its visit, in one store write.

use crate::model::{
    ActionKind, ActionNameKind, HitName, NameSlot, NewHit, RecordedHit, Timestamp, VisitTarget,
};
use crate::request::{RequestError, TrackingRequest, truncate_chars};
use crate::store::{StoreError, TrackerStore};
use url::Url;

/// Longest name stored in the action name table, in characters.
pub const MAX_ACTION_NAME_LENGTH: usize = 1024;

/// Name of a page URL: no scheme, no leading `www.`, no bare `/` path and
/// no fragment. Input that does not parse as an absolute URL is kept as is.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(parsed) = Url::parse(raw) else {
        return raw.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return raw.to_string();
    };

    let mut name = host.strip_prefix("www.").unwrap_or(host).to_string();
    if let Some(port) = parsed.port() {
        name.push(':');
        name.push_str(&port.to_string());
    }
    if parsed.path() != "/" {
        name.push_str(parsed.path());
    }
    if let Some(query) = parsed.query() {
        name.push('?');
        name.push_str(query);
    }
    name
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    pub category: String,
    pub action: String,
    pub name: Option<String>,
    pub value: Option<f64>,
}

/// Validated names of an action, before anything is written.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub url: Option<String>,
    pub title: Option<String>,
    pub event: Option<PendingEvent>,
}

impl PendingAction {
    pub fn from_request(request: &TrackingRequest) -> Result<Self, RequestError> {
        let kind = request.action_kind();
        let pending = match kind {
            ActionKind::Pageview => PendingAction {
                kind,
                url: request.url().map(normalize_url),
                title: request.action_name().map(str::to_string),
                event: None,
            },
            ActionKind::Outlink | ActionKind::Download => PendingAction {
                kind,
                url: Some(
                    request
                        .link_url()
                        .map(normalize_url)
                        .ok_or(RequestError::MissingField(match kind {
                            ActionKind::Download => "download",
                            _ => "link",
                        }))?,
                ),
                title: None,
                event: None,
            },
            ActionKind::Event => {
                let event = request.event()?;
                PendingAction {
                    kind,
                    url: request.url().map(normalize_url),
                    title: None,
                    event: Some(PendingEvent {
                        category: event.category.to_string(),
                        action: event.action.to_string(),
                        name: event.name.map(str::to_string),
                        value: event.value,
                    }),
                }
            }
        };
        Ok(pending)
    }

    fn url_kind(&self) -> ActionNameKind {
        match self.kind {
            ActionKind::Outlink => ActionNameKind::Outlink,
            ActionKind::Download => ActionNameKind::Download,
            ActionKind::Pageview | ActionKind::Event => ActionNameKind::PageUrl,
        }
    }

    /// Names in resolution order: event category and action, then the title
    /// or event name, then the URL.
    pub fn names(&self) -> Vec<HitName> {
        let entry = |slot, name: &str, kind| HitName {
            slot,
            name: truncate_chars(name, MAX_ACTION_NAME_LENGTH),
            kind,
        };

        let mut names = Vec::new();
        if let Some(event) = &self.event {
            names.push(entry(
                NameSlot::EventCategory,
                &event.category,
                ActionNameKind::EventCategory,
            ));
            names.push(entry(
                NameSlot::EventAction,
                &event.action,
                ActionNameKind::EventAction,
            ));
            if let Some(name) = &event.name {
                names.push(entry(NameSlot::Name, name, ActionNameKind::EventName));
            }
        }
        if let Some(title) = &self.title {
            names.push(entry(NameSlot::Name, title, ActionNameKind::PageTitle));
        }
        if let Some(url) = &self.url {
            names.push(entry(NameSlot::Url, url, self.url_kind()));
        }
        names
    }
}

pub struct ActionLogger<'a> {
    store: &'a dyn TrackerStore,
}

impl<'a> ActionLogger<'a> {
    pub fn new(store: &'a dyn TrackerStore) -> Self {
        ActionLogger { store }
    }

    /// Writes the action as the latest one of `target`, together with the
    /// visit change and any action name it needs.
    pub async fn log(
        &self,
        target: VisitTarget,
        pending: &PendingAction,
        server_time: Timestamp,
    ) -> Result<RecordedHit, StoreError> {
        let hit = NewHit {
            target,
            kind: pending.kind,
            names: pending.names(),
            event_value: pending.event.as_ref().and_then(|event| event.value),
            time: server_time,
        };
        self.store.record_hit(&hit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Fingerprint, NewVisit};
    use crate::store::memory::MemoryStore;
    use std::collections::BTreeMap;

    fn new_visit() -> VisitTarget {
        VisitTarget::New {
            visit: NewVisit {
                site_id: 1,
                fingerprint: Fingerprint(1),
                first_action_time: 1000,
                custom_variables: vec![],
                client_ip: None,
                user_agent: None,
                language: None,
                attributes: BTreeMap::new(),
            },
            since: 0,
        }
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("http://www.example.com"), "example.com");
        assert_eq!(normalize_url("http://localhost"), "localhost");
        assert_eq!(normalize_url("http://localhost/test"), "localhost/test");
        assert_eq!(
            normalize_url("https://www.example.com:8443/a/b?x=1#top"),
            "example.com:8443/a/b?x=1"
        );
        assert_eq!(normalize_url("https://example.com:443/"), "example.com");
        assert_eq!(normalize_url(" not a url "), "not a url");
        assert_eq!(normalize_url("mailto:someone@example.com"), "mailto:someone@example.com");
    }

    #[tokio::test]
    async fn test_pageview_resolves_title_then_url() {
        let store = MemoryStore::new();
        let request = TrackingRequest::from_pairs([
            ("idsite", "1"),
            ("action_name", "test"),
            ("url", "http://www.example.com"),
        ]);

        let pending = PendingAction::from_request(&request).unwrap();
        let recorded = ActionLogger::new(&store)
            .log(new_visit(), &pending, 1000)
            .await
            .unwrap();
        let action = recorded.action;

        assert_eq!(action.kind, ActionKind::Pageview);
        assert_eq!(action.name_id, Some(1));
        assert_eq!(action.url_id, Some(2));
        assert_eq!(action.position, 1);

        let names = store.action_names();
        assert_eq!(names[0].name, "test");
        assert_eq!(names[0].kind, ActionNameKind::PageTitle);
        assert_eq!(names[1].name, "example.com");
        assert_eq!(names[1].kind, ActionNameKind::PageUrl);

        // Known names are reused
        let again = ActionLogger::new(&store)
            .log(VisitTarget::Open(recorded.visit.id), &pending, 1010)
            .await
            .unwrap()
            .action;
        assert_eq!((again.name_id, again.url_id), (Some(1), Some(2)));
        assert_eq!(again.position, 2);
        assert_eq!(store.action_names().len(), 2);
    }

    #[tokio::test]
    async fn test_outlink_and_download() {
        let store = MemoryStore::new();

        let outlink = TrackingRequest::from_pairs([
            ("idsite", "1"),
            ("link", "https://partner.example.org/offer"),
        ]);
        let pending = PendingAction::from_request(&outlink).unwrap();
        let action = ActionLogger::new(&store)
            .log(new_visit(), &pending, 1000)
            .await
            .unwrap()
            .action;
        assert_eq!(action.kind, ActionKind::Outlink);
        let name = store.action_name(action.url_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(name.name, "partner.example.org/offer");
        assert_eq!(name.kind, ActionNameKind::Outlink);

        let download = TrackingRequest::from_pairs([("idsite", "1"), ("download", "")]);
        assert_eq!(
            PendingAction::from_request(&download).unwrap_err(),
            RequestError::MissingField("download")
        );
    }

    #[tokio::test]
    async fn test_event() {
        let store = MemoryStore::new();
        let request = TrackingRequest::from_pairs([
            ("idsite", "1"),
            ("e_c", "Videos"),
            ("e_a", "Play"),
            ("e_n", "Intro"),
            ("e_v", "12.5"),
        ]);

        let pending = PendingAction::from_request(&request).unwrap();
        let action = ActionLogger::new(&store)
            .log(new_visit(), &pending, 1000)
            .await
            .unwrap()
            .action;
        assert_eq!(action.kind, ActionKind::Event);
        assert_eq!(action.event_category_id, Some(1));
        assert_eq!(action.event_action_id, Some(2));
        assert_eq!(action.name_id, Some(3));
        assert_eq!(action.url_id, None);
        assert_eq!(action.event_value, Some(12.5));

        let incomplete = TrackingRequest::from_pairs([("idsite", "1"), ("e_c", "Videos")]);
        assert_eq!(
            PendingAction::from_request(&incomplete).unwrap_err(),
            RequestError::MissingField("e_a")
        );
    }

    #[tokio::test]
    async fn test_long_names_are_truncated() {
        let store = MemoryStore::new();
        let title = "é".repeat(MAX_ACTION_NAME_LENGTH + 10);
        let request = TrackingRequest::from_pairs([
            ("idsite".to_string(), "1".to_string()),
            ("action_name".to_string(), title),
        ]);

        let pending = PendingAction::from_request(&request).unwrap();
        ActionLogger::new(&store)
            .log(new_visit(), &pending, 1000)
            .await
            .unwrap();
        assert_eq!(
            store.action_names()[0].name.chars().count(),
            MAX_ACTION_NAME_LENGTH
        );
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_action() {
        let store = MemoryStore::new();
        let request = TrackingRequest::from_pairs([("idsite", "1"), ("url", "http://localhost")]);
        let pending = PendingAction::from_request(&request).unwrap();

        let err = ActionLogger::new(&store)
            .log(VisitTarget::Open(42), &pending, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(store.action_names().is_empty());
        assert!(store.actions().is_empty());
    }
}
