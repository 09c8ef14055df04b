//! The single response of a tracking call.

use crate::request_set::RequestBatch;
use crate::tracker::BatchOutcome;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use shared::http::full_body;

/// 1x1 transparent GIF.
pub const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Shown when a call carries nothing to track.
pub const INFO_HTML: &str = "<a href='/'>Beacon</a> is a free/libre web analytics service \
that lets you keep control of your data.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerResponse {
    Info,
    Pixel,
    Empty,
    BulkAck { tracked: u64, received: u64 },
}

impl TrackerResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            TrackerResponse::Empty => StatusCode::NO_CONTENT,
            _ => StatusCode::OK,
        }
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            TrackerResponse::Info => Some("text/html; charset=utf-8"),
            TrackerResponse::Pixel => Some("image/gif"),
            TrackerResponse::Empty => None,
            TrackerResponse::BulkAck { .. } => Some("application/json"),
        }
    }

    pub fn body(&self) -> Bytes {
        match self {
            TrackerResponse::Info => Bytes::from_static(INFO_HTML.as_bytes()),
            TrackerResponse::Pixel => Bytes::from_static(&PIXEL_GIF),
            TrackerResponse::Empty => Bytes::new(),
            TrackerResponse::BulkAck { tracked, received } => Bytes::from(
                serde_json::json!({
                    "status": "success",
                    "tracked": tracked,
                    "received": received,
                })
                .to_string(),
            ),
        }
    }

    pub fn into_http<E>(self) -> Response<BoxBody<Bytes, E>> {
        let mut response = Response::new(full_body(self.body()));
        *response.status_mut() = self.status();

        let headers = response.headers_mut();
        if let Some(content_type) = self.content_type() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        if self == TrackerResponse::Pixel {
            headers.insert(
                CACHE_CONTROL,
                HeaderValue::from_static("no-store, no-cache, must-revalidate"),
            );
        }
        response
    }
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    pub fn build(batch: &RequestBatch, outcome: &BatchOutcome) -> TrackerResponse {
        if batch.is_empty() {
            TrackerResponse::Info
        } else if batch.is_bulk() {
            TrackerResponse::BulkAck {
                tracked: outcome.logged,
                received: outcome.received,
            }
        } else if batch.suppress_image() {
            TrackerResponse::Empty
        } else {
            TrackerResponse::Pixel
        }
    }
}
