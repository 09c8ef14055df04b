//! A single tracking hit and its validated accessors.

use crate::model::{ActionKind, CustomVariable, Fingerprint, Timestamp, unix_now};
use indexmap::IndexMap;
use site_cache::SiteId;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Raw parameters in the order they arrived.
pub type Params = IndexMap<String, String>;

/// Parameters whose presence makes a request worth tracking.
pub const RECOGNIZED_FIELDS: &[&str] = &[
    "idsite",
    "url",
    "action_name",
    "link",
    "download",
    "e_c",
    "e_a",
    "e_n",
];

const MAX_CUSTOM_VARIABLES: u8 = 5;
const MAX_CUSTOM_VARIABLE_LENGTH: usize = 200;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("idsite is missing")]
    MissingSiteId,

    #[error("idsite must be a positive integer, got {0:?}")]
    InvalidSiteId(String),

    #[error("{0} is required for this kind of action")]
    MissingField(&'static str),

    #[error("{field} must be a number, got {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// What the transport layer knows about the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub language: Option<String>,
}

/// Event parameters of an event hit.
#[derive(Clone, Debug, PartialEq)]
pub struct EventFields<'a> {
    pub category: &'a str,
    pub action: &'a str,
    pub name: Option<&'a str>,
    pub value: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackingRequest {
    params: Params,
    client: ClientInfo,
    received_at: Timestamp,
    authenticated: bool,
}

impl TrackingRequest {
    pub fn new(params: Params) -> Self {
        TrackingRequest {
            params,
            client: ClientInfo::default(),
            received_at: unix_now(),
            authenticated: false,
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn with_client(mut self, client: ClientInfo) -> Self {
        self.client = client;
        self
    }

    pub fn with_received_at(mut self, received_at: Timestamp) -> Self {
        self.received_at = received_at;
        self
    }

    /// Marks the request as coming from a caller holding a valid token, which
    /// unlocks the `cdt` and `cip` overrides.
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Trimmed, non-empty parameter value.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !RECOGNIZED_FIELDS
            .iter()
            .any(|field| self.params.contains_key(*field))
    }

    pub fn site_id(&self) -> Result<SiteId, RequestError> {
        let raw = self.param("idsite").ok_or(RequestError::MissingSiteId)?;
        match raw.parse::<SiteId>() {
            Ok(site_id) if site_id > 0 => Ok(site_id),
            _ => Err(RequestError::InvalidSiteId(raw.to_string())),
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.param("url")
    }

    pub fn action_name(&self) -> Option<&str> {
        self.param("action_name")
    }

    pub fn action_kind(&self) -> ActionKind {
        if self.params.contains_key("e_c") || self.params.contains_key("e_a") {
            ActionKind::Event
        } else if self.params.contains_key("download") {
            ActionKind::Download
        } else if self.params.contains_key("link") {
            ActionKind::Outlink
        } else {
            ActionKind::Pageview
        }
    }

    /// URL of an outlink or download hit.
    pub fn link_url(&self) -> Option<&str> {
        match self.action_kind() {
            ActionKind::Download => self.param("download"),
            ActionKind::Outlink => self.param("link"),
            _ => None,
        }
    }

    pub fn event(&self) -> Result<EventFields<'_>, RequestError> {
        let category = self.param("e_c").ok_or(RequestError::MissingField("e_c"))?;
        let action = self.param("e_a").ok_or(RequestError::MissingField("e_a"))?;
        let value = match self.param("e_v") {
            Some(raw) => Some(
                raw.parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| RequestError::InvalidNumber {
                        field: "e_v",
                        value: raw.to_string(),
                    })?,
            ),
            None => None,
        };

        Ok(EventFields {
            category,
            action,
            name: self.param("e_n"),
            value,
        })
    }

    /// Custom variables from `_cvar` (or `cvar`), e.g. `{"1":["plan","pro"]}`.
    ///
    /// Malformed payloads and out of range slots are dropped.
    pub fn custom_variables(&self) -> Vec<CustomVariable> {
        let Some(raw) = self.param("_cvar").or_else(|| self.param("cvar")) else {
            return Vec::new();
        };

        let slots: BTreeMap<String, (String, String)> = match serde_json::from_str(raw) {
            Ok(slots) => slots,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed custom variables");
                return Vec::new();
            }
        };

        slots
            .into_iter()
            .filter_map(|(index, (name, value))| {
                let index = index.parse::<u8>().ok()?;
                if index == 0 || index > MAX_CUSTOM_VARIABLES || name.is_empty() {
                    return None;
                }
                Some(CustomVariable {
                    index,
                    name: truncate_chars(&name, MAX_CUSTOM_VARIABLE_LENGTH),
                    value: truncate_chars(&value, MAX_CUSTOM_VARIABLE_LENGTH),
                })
            })
            .collect()
    }

    /// Visitor id sent by the client, `cid` taking precedence over `_id`.
    pub fn visitor_id(&self) -> Option<Fingerprint> {
        self.param("cid")
            .and_then(Fingerprint::from_hex)
            .or_else(|| self.param("_id").and_then(Fingerprint::from_hex))
    }

    pub fn send_image(&self) -> bool {
        self.param("send_image") != Some("0")
    }

    /// Time of the hit. `cdt` is only honoured for authenticated requests.
    pub fn timestamp(&self) -> Timestamp {
        if self.authenticated
            && let Some(custom) = self.param("cdt").and_then(|raw| raw.parse::<Timestamp>().ok())
            && custom > 0
        {
            return custom;
        }
        self.received_at
    }

    /// Client IP. `cip` is only honoured for authenticated requests.
    pub fn client_ip(&self) -> Option<IpAddr> {
        if self.authenticated
            && let Some(ip) = self.param("cip").and_then(|raw| raw.parse().ok())
        {
            return Some(ip);
        }
        self.client.ip
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.param("ua").or(self.client.user_agent.as_deref())
    }

    pub fn language(&self) -> Option<&str> {
        self.param("lang").or(self.client.language.as_deref())
    }
}

pub(crate) fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((end, _)) => value[..end].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, &str)]) -> TrackingRequest {
        TrackingRequest::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_is_empty() {
        assert!(request(&[]).is_empty());
        assert!(request(&[("foo", "bar"), ("send_image", "0")]).is_empty());
        assert!(!request(&[("idsite", "1")]).is_empty());
        assert!(!request(&[("url", "http://localhost")]).is_empty());
        assert!(!request(&[("e_c", "video")]).is_empty());
        // Presence is what counts, not validity.
        assert!(!request(&[("idsite", "")]).is_empty());
    }

    #[test]
    fn test_site_id() {
        assert_eq!(request(&[("idsite", " 12 ")]).site_id(), Ok(12));
        assert_eq!(request(&[]).site_id(), Err(RequestError::MissingSiteId));
        assert_eq!(
            request(&[("idsite", "abc")]).site_id(),
            Err(RequestError::InvalidSiteId("abc".into()))
        );
        assert_eq!(
            request(&[("idsite", "0")]).site_id(),
            Err(RequestError::InvalidSiteId("0".into()))
        );
        assert_eq!(
            request(&[("idsite", "-1")]).site_id(),
            Err(RequestError::InvalidSiteId("-1".into()))
        );
    }

    #[test]
    fn test_action_kind() {
        assert_eq!(request(&[("url", "x")]).action_kind(), ActionKind::Pageview);
        assert_eq!(
            request(&[("link", "http://out.example")]).action_kind(),
            ActionKind::Outlink
        );
        assert_eq!(
            request(&[("download", "http://example.com/a.zip"), ("link", "x")]).action_kind(),
            ActionKind::Download
        );
        assert_eq!(
            request(&[("e_c", "video"), ("download", "x")]).action_kind(),
            ActionKind::Event
        );
    }

    #[test]
    fn test_event_fields() {
        let req = request(&[("e_c", "video"), ("e_a", "play"), ("e_n", "intro"), ("e_v", "2.5")]);
        let event = req.event().unwrap();
        assert_eq!(event.category, "video");
        assert_eq!(event.action, "play");
        assert_eq!(event.name, Some("intro"));
        assert_eq!(event.value, Some(2.5));

        assert_eq!(
            request(&[("e_c", "video")]).event(),
            Err(RequestError::MissingField("e_a"))
        );
        assert!(matches!(
            request(&[("e_c", "video"), ("e_a", "play"), ("e_v", "NaN")]).event(),
            Err(RequestError::InvalidNumber { field: "e_v", .. })
        ));
    }

    #[test]
    fn test_custom_variables() {
        let req = request(&[(
            "_cvar",
            r#"{"1":["plan","pro"],"6":["ignored","slot"],"x":["bad","index"],"2":["","empty"]}"#,
        )]);
        assert_eq!(
            req.custom_variables(),
            vec![CustomVariable {
                index: 1,
                name: "plan".into(),
                value: "pro".into()
            }]
        );

        assert!(request(&[("_cvar", "{not json")]).custom_variables().is_empty());
        assert_eq!(
            request(&[("cvar", r#"{"3":["a","b"]}"#)]).custom_variables()[0].index,
            3
        );
    }

    #[test]
    fn test_visitor_id() {
        assert_eq!(
            request(&[("_id", "0123456789abcdef")]).visitor_id(),
            Some(Fingerprint(0x0123456789abcdef))
        );
        assert_eq!(
            request(&[("_id", "0123456789abcdef"), ("cid", "ffffffffffffffff")]).visitor_id(),
            Some(Fingerprint(u64::MAX))
        );
        assert_eq!(request(&[("_id", "short")]).visitor_id(), None);
    }

    #[test]
    fn test_overrides_require_authentication() {
        let req = request(&[("cdt", "1400000000"), ("cip", "10.1.2.3")]).with_received_at(1500000000);
        assert_eq!(req.timestamp(), 1500000000);
        assert_eq!(req.client_ip(), None);

        let req = req.authenticated();
        assert_eq!(req.timestamp(), 1400000000);
        assert_eq!(req.client_ip(), Some("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_client_fallbacks() {
        let client = ClientInfo {
            ip: Some("192.168.0.1".parse().unwrap()),
            user_agent: Some("curl/8".into()),
            language: Some("de".into()),
        };
        let req = request(&[("ua", "Mozilla/5.0")]).with_client(client);
        assert_eq!(req.user_agent(), Some("Mozilla/5.0"));
        assert_eq!(req.language(), Some("de"));
        assert_eq!(req.client_ip(), Some("192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_send_image() {
        assert!(request(&[]).send_image());
        assert!(request(&[("send_image", "1")]).send_image());
        assert!(!request(&[("send_image", "0")]).send_image());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
