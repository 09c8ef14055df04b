//! Ordered batches of tracking requests, built from one call or a bulk payload.

use crate::config::BulkConfig;
use crate::errors::TrackerError;
use crate::request::{ClientInfo, Params, TrackingRequest};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchSource {
    /// Parameters of a single HTTP call.
    #[default]
    Single,
    /// JSON body carrying many requests.
    Bulk,
}

#[derive(Deserialize)]
struct BulkPayload {
    requests: Vec<BulkItem>,
    #[serde(default)]
    token_auth: Option<String>,
}

/// Bulk entries are either `?a=b&c=d` query strings or parameter objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum BulkItem {
    Query(String),
    Params(IndexMap<String, Value>),
}

impl BulkItem {
    fn into_params(self) -> Params {
        match self {
            BulkItem::Query(query) => parse_query(&query),
            BulkItem::Params(map) => map
                .into_iter()
                .filter_map(|(key, value)| param_value(value).map(|value| (key, value)))
                .collect(),
        }
    }
}

fn param_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(if b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        // Nested values such as custom variables travel as JSON text.
        other => Some(other.to_string()),
    }
}

/// Parses a query string, with or without the leading `?`.
pub fn parse_query(query: &str) -> Params {
    let query = query.trim();
    let query = query.strip_prefix('?').unwrap_or(query);
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Whether a raw body is a bulk submission rather than form parameters.
///
/// A JSON content type always means bulk. Without one, the body must parse as
/// a JSON object with a `requests` member.
pub fn is_bulk_body(body: &[u8], json_content_type: bool) -> bool {
    json_content_type
        || serde_json::from_slice::<serde_json::Map<String, Value>>(body)
            .is_ok_and(|object| object.contains_key("requests"))
}

#[derive(Clone, Debug, Default)]
pub struct RequestBatch {
    requests: Vec<TrackingRequest>,
    source: BatchSource,
    ambient: Params,
    client: ClientInfo,
}

impl RequestBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_requests(requests: Vec<TrackingRequest>) -> Self {
        RequestBatch {
            requests,
            ..Self::default()
        }
    }

    /// Batch for a single call: one request, or none when no parameter arrived.
    pub fn from_params(params: Params, client: ClientInfo) -> Self {
        RequestBatch::new().with_ambient_params(params, client)
    }

    /// Parses a bulk body and checks its token once for the whole batch.
    pub fn from_bulk(
        body: &[u8],
        client: ClientInfo,
        config: &BulkConfig,
    ) -> Result<Self, TrackerError> {
        let payload: BulkPayload = serde_json::from_slice(body)
            .map_err(|err| TrackerError::InvalidBulkPayload(err.to_string()))?;

        let authenticated = match payload.token_auth.as_deref() {
            Some(token) if config.accepts(token) => true,
            Some(_) => return Err(TrackerError::Unauthorized),
            None if config.require_token => return Err(TrackerError::Unauthorized),
            None => false,
        };

        let requests = payload
            .requests
            .into_iter()
            .map(|item| {
                let request = TrackingRequest::new(item.into_params()).with_client(client.clone());
                if authenticated {
                    request.authenticated()
                } else {
                    request
                }
            })
            .collect();

        Ok(RequestBatch {
            requests,
            source: BatchSource::Bulk,
            ambient: Params::new(),
            client,
        })
    }

    /// Parameters of the call itself, used when the batch holds no request.
    pub fn with_ambient_params(mut self, params: Params, client: ClientInfo) -> Self {
        self.ambient = params;
        self.client = client;
        self
    }

    pub fn set_requests(&mut self, requests: Vec<TrackingRequest>) {
        self.requests = requests;
    }

    /// Falls back to the ambient parameters when no request was given.
    ///
    /// Returns true when the fallback produced a request.
    pub fn init_requests(&mut self) -> bool {
        if !self.requests.is_empty() || self.ambient.is_empty() {
            return false;
        }

        let params = std::mem::take(&mut self.ambient);
        self.requests
            .push(TrackingRequest::new(params).with_client(self.client.clone()));
        true
    }

    pub fn requests(&self) -> &[TrackingRequest] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn source(&self) -> BatchSource {
        self.source
    }

    pub fn is_bulk(&self) -> bool {
        self.source == BatchSource::Bulk
    }

    /// True when the call itself or any request asked for no tracking pixel.
    pub fn suppress_image(&self) -> bool {
        self.ambient.get("send_image").is_some_and(|value| value == "0")
            || self.requests.iter().any(|request| !request.send_image())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_config(tokens: &[&str], require_token: bool) -> BulkConfig {
        BulkConfig {
            token_auth: tokens.iter().map(|t| t.to_string()).collect(),
            require_token,
        }
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("?idsite=1&url=http%3A%2F%2Flocalhost%2Fa&action_name=Home+page");
        assert_eq!(params.get("idsite").map(String::as_str), Some("1"));
        assert_eq!(params.get("url").map(String::as_str), Some("http://localhost/a"));
        assert_eq!(params.get("action_name").map(String::as_str), Some("Home page"));
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_is_bulk_body() {
        assert!(is_bulk_body(br#"  {"requests": []}"#, false));
        assert!(is_bulk_body(b"not json", true));
        assert!(!is_bulk_body(b"idsite=1&url=x", false));
        assert!(!is_bulk_body(br#"{"idsite": 1}"#, false));
        assert!(!is_bulk_body(br#"{"idsite": 1, "note": "requests"}"#, false));
        assert!(!is_bulk_body(br#"{"requests"&idsite=1"#, false));
    }

    #[test]
    fn test_from_params_and_fallback() {
        let mut batch = RequestBatch::from_params(parse_query("idsite=1"), ClientInfo::default());
        assert!(batch.is_empty());
        assert!(batch.init_requests());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.requests()[0].site_id(), Ok(1));

        // Fallback runs once.
        assert!(!batch.init_requests());
        assert_eq!(batch.len(), 1);

        let mut empty = RequestBatch::from_params(Params::new(), ClientInfo::default());
        assert!(!empty.init_requests());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_explicit_requests_win_over_ambient() {
        let mut batch = RequestBatch::from_requests(vec![TrackingRequest::from_pairs([(
            "idsite", "2",
        )])])
        .with_ambient_params(parse_query("idsite=1"), ClientInfo::default());

        assert!(!batch.init_requests());
        assert_eq!(batch.requests()[0].site_id(), Ok(2));
    }

    #[test]
    fn test_from_bulk_preserves_order_and_formats() {
        let body = br#"{
            "requests": [
                "?idsite=1&url=http%3A%2F%2Flocalhost%2Ffirst",
                {"idsite": 1, "url": "http://localhost/second", "_cvar": {"1": ["a", "b"]}, "x": null},
                {}
            ]
        }"#;
        let batch = RequestBatch::from_bulk(body, ClientInfo::default(), &BulkConfig::default())
            .unwrap();

        assert!(batch.is_bulk());
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.requests()[0].url(), Some("http://localhost/first"));
        assert_eq!(batch.requests()[1].url(), Some("http://localhost/second"));
        assert_eq!(batch.requests()[1].site_id(), Ok(1));
        assert_eq!(batch.requests()[1].custom_variables().len(), 1);
        assert!(!batch.requests()[1].params().contains_key("x"));
        assert!(batch.requests()[2].is_empty());
        assert!(!batch.requests()[0].is_authenticated());
    }

    #[test]
    fn test_from_bulk_token_validation() {
        let body = br#"{"requests": ["?idsite=1"], "token_auth": "secret"}"#;
        let batch =
            RequestBatch::from_bulk(body, ClientInfo::default(), &bulk_config(&["secret"], true))
                .unwrap();
        assert!(batch.requests()[0].is_authenticated());

        assert!(matches!(
            RequestBatch::from_bulk(body, ClientInfo::default(), &bulk_config(&["other"], false)),
            Err(TrackerError::Unauthorized)
        ));

        let anonymous = br#"{"requests": ["?idsite=1"]}"#;
        assert!(matches!(
            RequestBatch::from_bulk(anonymous, ClientInfo::default(), &bulk_config(&["secret"], true)),
            Err(TrackerError::Unauthorized)
        ));
        assert!(
            RequestBatch::from_bulk(anonymous, ClientInfo::default(), &bulk_config(&["secret"], false))
                .is_ok()
        );
    }

    #[test]
    fn test_from_bulk_rejects_garbage() {
        assert!(matches!(
            RequestBatch::from_bulk(b"{\"requests\": 5}", ClientInfo::default(), &BulkConfig::default()),
            Err(TrackerError::InvalidBulkPayload(_))
        ));
    }

    #[test]
    fn test_suppress_image() {
        let batch = RequestBatch::from_requests(vec![
            TrackingRequest::from_pairs([("idsite", "1")]),
            TrackingRequest::from_pairs([("idsite", "1"), ("send_image", "0")]),
        ]);
        assert!(batch.suppress_image());

        let batch = RequestBatch::from_requests(vec![TrackingRequest::from_pairs([("idsite", "1")])]);
        assert!(!batch.suppress_image());
    }

    #[test]
    fn test_suppress_image_from_call_params() {
        let batch = RequestBatch::from_requests(vec![TrackingRequest::from_pairs([
            ("idsite", "1"),
            ("url", "http://localhost"),
        ])])
        .with_ambient_params(parse_query("send_image=0"), ClientInfo::default());
        assert!(batch.suppress_image());

        let mut batch =
            RequestBatch::from_params(parse_query("idsite=1&send_image=0"), ClientInfo::default());
        assert!(batch.init_requests());
        assert!(batch.suppress_image());

        let batch = RequestBatch::from_requests(vec![TrackingRequest::from_pairs([("idsite", "1")])])
            .with_ambient_params(parse_query("send_image=1"), ClientInfo::default());
        assert!(!batch.suppress_image());
    }
}
