//! HTTP front of the tracker: turns a call into a [`RequestBatch`] and the
//! tracker outcome into a response.

use crate::config::TrackerSettings;
use crate::errors::TrackerError;
use crate::request::{ClientInfo, Params};
use crate::request_set::{RequestBatch, is_bulk_body, parse_query};
use crate::tracker::{Tracker, TrackerEnv};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, USER_AGENT};
use hyper::http::request::Parts;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use shared::http::{PeerAddr, make_boxed_error_response, make_error_response};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TrackerService {
    env: Arc<TrackerEnv>,
}

impl TrackerService {
    pub fn new(env: Arc<TrackerEnv>) -> Self {
        TrackerService { env }
    }
}

impl Service<Request<Incoming>> for TrackerService {
    type Response = Response<BoxBody<Bytes, Self::Error>>;
    type Error = ServiceError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let env = self.env.clone();
        Box::pin(async move { Ok(handle(&env, req).await) })
    }
}

/// Runs one tracking call. Always produces a response; fatal failures become
/// an `Error: <message>` body.
pub async fn handle<B>(env: &TrackerEnv, req: Request<B>) -> Response<BoxBody<Bytes, ServiceError>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() != Method::GET && req.method() != Method::POST {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let (parts, body) = req.into_parts();
    let result = async {
        let body = read_body(body, env.settings.max_body_bytes).await?;
        let batch = build_batch(&parts, &body, &env.settings)?;
        Tracker::new(env).main(batch).await
    }
    .await;

    match result {
        Ok(response) => response.into_http(),
        Err(err) => {
            tracing::error!(error = %err, "tracking call failed");
            make_error_response(err.status_code(), &err.to_string())
        }
    }
}

async fn read_body<B>(body: B, max_bytes: usize) -> Result<Bytes, TrackerError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, max_bytes).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(TrackerError::PayloadTooLarge(max_bytes))
        }
        Err(err) => Err(TrackerError::RequestBody(err.to_string())),
    }
}

fn build_batch(
    parts: &Parts,
    body: &[u8],
    settings: &TrackerSettings,
) -> Result<RequestBatch, TrackerError> {
    let client = client_info(parts, settings);

    if parts.method == Method::POST && is_bulk_body(body, is_json_body(&parts.headers)) {
        return RequestBatch::from_bulk(body, client, &settings.bulk);
    }

    let mut params: Params = parts.uri.query().map(parse_query).unwrap_or_default();
    if is_form_body(&parts.headers) && !body.is_empty() {
        // GET parameters take precedence over POST ones.
        for (key, value) in parse_query(&String::from_utf8_lossy(body)) {
            params.entry(key).or_insert(value);
        }
    }

    Ok(RequestBatch::from_params(params, client))
}

fn content_type_essence(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let essence = content_type.split(';').next().unwrap_or_default();
    Some(essence.trim().to_ascii_lowercase())
}

fn is_json_body(headers: &HeaderMap) -> bool {
    content_type_essence(headers).is_some_and(|essence| essence == "application/json")
}

fn is_form_body(headers: &HeaderMap) -> bool {
    match content_type_essence(headers) {
        None => true,
        Some(essence) => essence == "application/x-www-form-urlencoded" || essence == "text/plain",
    }
}

fn client_info(parts: &Parts, settings: &TrackerSettings) -> ClientInfo {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let forwarded = if settings.trust_forwarded_for {
        header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok())
    } else {
        None
    };
    let peer = parts
        .extensions
        .get::<PeerAddr>()
        .map(|PeerAddr(addr)| addr.ip());

    ClientInfo {
        ip: forwarded.or(peer),
        user_agent: header(USER_AGENT.as_str()).map(str::to_string),
        language: header(ACCEPT_LANGUAGE.as_str()).map(str::to_string),
    }
}
