use crate::request::RequestError;
use crate::store::StoreError;
use hyper::StatusCode;
use site_cache::SiteId;
use thiserror::Error;

/// Result type alias for tracker operations
pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// Errors that can occur while tracking a batch
///
/// Per-request conditions are recoverable: the request is skipped and the
/// batch continues. Everything else aborts the run.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("unknown site {0}")]
    UnknownSite(SiteId),

    #[error("site {0} is disabled")]
    DisabledSite(SiteId),

    #[error("could not load site settings: {0}")]
    SiteSource(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(StoreError),

    #[error("invalid bulk payload: {0}")]
    InvalidBulkPayload(String),

    #[error("invalid token_auth")]
    Unauthorized,

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl TrackerError {
    /// Whether the error only concerns a single request of the batch.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TrackerError::InvalidRequest(_)
                | TrackerError::UnknownSite(_)
                | TrackerError::DisabledSite(_)
                | TrackerError::SiteSource(_)
                | TrackerError::Storage(_)
        )
    }

    /// Short label used when counting skipped requests.
    pub fn skip_reason(&self) -> &'static str {
        match self {
            TrackerError::InvalidRequest(_) => "invalid_request",
            TrackerError::UnknownSite(_) => "unknown_site",
            TrackerError::DisabledSite(_) => "disabled_site",
            TrackerError::SiteSource(_) => "site_source",
            TrackerError::Storage(_) | TrackerError::StorageUnavailable(_) => "storage",
            TrackerError::InvalidBulkPayload(_)
            | TrackerError::Unauthorized
            | TrackerError::RequestBody(_)
            | TrackerError::PayloadTooLarge(_) => "rejected",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            TrackerError::InvalidBulkPayload(_) | TrackerError::RequestBody(_) => {
                StatusCode::BAD_REQUEST
            }
            TrackerError::Unauthorized => StatusCode::UNAUTHORIZED,
            TrackerError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
