//! Records persisted by the ingestion path.

use serde::{Deserialize, Serialize};
use site_cache::SiteId;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
pub type Timestamp = i64;
pub type VisitId = i64;
pub type ActionId = i64;
pub type ActionNameId = i64;

pub fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as Timestamp)
        .unwrap_or_default()
}

/// 64-bit visitor identity, rendered as 16 lowercase hex chars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn from_hex(raw: &str) -> Option<Self> {
        if raw.len() != 16 || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(raw, 16).ok().map(Fingerprint)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomVariable {
    pub index: u8,
    pub name: String,
    pub value: String,
}

/// A visit that has not been written yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewVisit {
    pub site_id: SiteId,
    pub fingerprint: Fingerprint,
    pub first_action_time: Timestamp,
    pub custom_variables: Vec<CustomVariable>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub language: Option<String>,
    /// Enrichment added by visit factories, e.g. a resolved country.
    pub attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Visit {
    pub id: VisitId,
    pub site_id: SiteId,
    pub fingerprint: Fingerprint,
    pub first_action_time: Timestamp,
    pub last_action_time: Timestamp,
    pub action_count: u32,
    pub custom_variables: Vec<CustomVariable>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub language: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Visit {
    /// The stored form of a freshly inserted visit, which counts its first action.
    pub fn from_new(id: VisitId, visit: &NewVisit) -> Self {
        Visit {
            id,
            site_id: visit.site_id,
            fingerprint: visit.fingerprint,
            first_action_time: visit.first_action_time,
            last_action_time: visit.first_action_time,
            action_count: 1,
            custom_variables: visit.custom_variables.clone(),
            client_ip: visit.client_ip.clone(),
            user_agent: visit.user_agent.clone(),
            language: visit.language.clone(),
            attributes: visit.attributes.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Pageview,
    Event,
    Download,
    Outlink,
}

impl ActionKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Pageview => "pageview",
            ActionKind::Event => "event",
            ActionKind::Download => "download",
            ActionKind::Outlink => "outlink",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pageview" => Some(ActionKind::Pageview),
            "event" => Some(ActionKind::Event),
            "download" => Some(ActionKind::Download),
            "outlink" => Some(ActionKind::Outlink),
            _ => None,
        }
    }
}

/// Type of an entry in the action name table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionNameKind {
    PageUrl,
    Outlink,
    Download,
    PageTitle,
    EventCategory,
    EventAction,
    EventName,
}

impl ActionNameKind {
    pub const fn code(&self) -> i64 {
        match self {
            ActionNameKind::PageUrl => 1,
            ActionNameKind::Outlink => 2,
            ActionNameKind::Download => 3,
            ActionNameKind::PageTitle => 4,
            ActionNameKind::EventCategory => 10,
            ActionNameKind::EventAction => 11,
            ActionNameKind::EventName => 12,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ActionNameKind::PageUrl),
            2 => Some(ActionNameKind::Outlink),
            3 => Some(ActionNameKind::Download),
            4 => Some(ActionNameKind::PageTitle),
            10 => Some(ActionNameKind::EventCategory),
            11 => Some(ActionNameKind::EventAction),
            12 => Some(ActionNameKind::EventName),
            _ => None,
        }
    }
}

/// Entry of the action name table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionName {
    pub id: ActionNameId,
    pub name: String,
    pub kind: ActionNameKind,
}

/// An action that has not been written yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAction {
    pub visit_id: VisitId,
    pub site_id: SiteId,
    pub kind: ActionKind,
    pub url_id: Option<ActionNameId>,
    pub name_id: Option<ActionNameId>,
    pub event_category_id: Option<ActionNameId>,
    pub event_action_id: Option<ActionNameId>,
    pub event_value: Option<f64>,
    /// 1-based position of the action within its visit.
    pub position: u32,
    pub server_time: Timestamp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub visit_id: VisitId,
    pub site_id: SiteId,
    pub kind: ActionKind,
    pub url_id: Option<ActionNameId>,
    pub name_id: Option<ActionNameId>,
    pub event_category_id: Option<ActionNameId>,
    pub event_action_id: Option<ActionNameId>,
    pub event_value: Option<f64>,
    pub position: u32,
    pub server_time: Timestamp,
}

impl Action {
    pub fn from_new(id: ActionId, action: &NewAction) -> Self {
        Action {
            id,
            visit_id: action.visit_id,
            site_id: action.site_id,
            kind: action.kind,
            url_id: action.url_id,
            name_id: action.name_id,
            event_category_id: action.event_category_id,
            event_action_id: action.event_action_id,
            event_value: action.event_value,
            position: action.position,
            server_time: action.server_time,
        }
    }
}

/// Visit a hit is written against.
#[derive(Clone, Debug, PartialEq)]
pub enum VisitTarget {
    /// An open visit found by lookup.
    Open(VisitId),
    /// A visit to create, unless an open one (last action at or after
    /// `since`) appeared in the meantime.
    New { visit: NewVisit, since: Timestamp },
}

/// Action column an action name ends up in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameSlot {
    EventCategory,
    EventAction,
    Name,
    Url,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HitName {
    pub slot: NameSlot,
    pub name: String,
    pub kind: ActionNameKind,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActionNameIds {
    pub event_category: Option<ActionNameId>,
    pub event_action: Option<ActionNameId>,
    pub name: Option<ActionNameId>,
    pub url: Option<ActionNameId>,
}

impl ActionNameIds {
    pub fn set(&mut self, slot: NameSlot, id: ActionNameId) {
        let field = match slot {
            NameSlot::EventCategory => &mut self.event_category,
            NameSlot::EventAction => &mut self.event_action,
            NameSlot::Name => &mut self.name,
            NameSlot::Url => &mut self.url,
        };
        *field = Some(id);
    }
}

/// One tracked hit: the visit change, the names it needs and the action.
///
/// Stores write a hit as a unit. Either all of it lands or none of it does.
#[derive(Clone, Debug, PartialEq)]
pub struct NewHit {
    pub target: VisitTarget,
    pub kind: ActionKind,
    /// Looked up or inserted in this order.
    pub names: Vec<HitName>,
    pub event_value: Option<f64>,
    /// Last action time of the visit and server time of the action.
    pub time: Timestamp,
}

impl NewHit {
    /// The action row of this hit, once the visit is updated and the names resolved.
    pub fn action(&self, visit: &Visit, ids: ActionNameIds) -> NewAction {
        NewAction {
            visit_id: visit.id,
            site_id: visit.site_id,
            kind: self.kind,
            url_id: ids.url,
            name_id: ids.name,
            event_category_id: ids.event_category,
            event_action_id: ids.event_action,
            event_value: self.event_value,
            position: visit.action_count,
            server_time: self.time,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedHit {
    pub visit: Visit,
    pub action: Action,
    pub visit_created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_hex() {
        let fp = Fingerprint::from_hex("00000000000000ff").unwrap();
        assert_eq!(fp, Fingerprint(255));
        assert_eq!(fp.to_string(), "00000000000000ff");

        assert_eq!(Fingerprint::from_hex("ff"), None);
        assert_eq!(Fingerprint::from_hex("zz000000000000ff"), None);
        assert_eq!(Fingerprint::from_hex("+0000000000000ff"), None);
    }

    #[test]
    fn test_action_name_kind_codes() {
        for kind in [
            ActionNameKind::PageUrl,
            ActionNameKind::Outlink,
            ActionNameKind::Download,
            ActionNameKind::PageTitle,
            ActionNameKind::EventCategory,
            ActionNameKind::EventAction,
            ActionNameKind::EventName,
        ] {
            assert_eq!(ActionNameKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ActionNameKind::from_code(99), None);
    }
}
