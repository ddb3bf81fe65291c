//! Error handling.

use axum::{
    extract::rejection::JsonRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};
use zune_inflate::errors::InflateDecodeErrors;

/// Failure taxonomy recorded against a failed build and reported to callers.
///
/// Callers use the kind to decide between "retry later" and "fix your request".
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The request was malformed or inconsistent with the source data.
    InvalidRequest,
    /// A source could not be read after the configured number of attempts.
    TransientIo,
    /// A source cannot be read at all (missing, forbidden).
    PermanentIo,
    /// The worker holding the build stopped heartbeating too many times.
    WorkerLost,
    /// The build exceeded its wall-clock ceiling.
    BuildTimeout,
    /// The backing store could not be reached.
    CacheStoreUnavailable,
}

impl FailureKind {
    /// Whether a caller may expect a later retry of the same request to succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::InvalidRequest | Self::PermanentIo)
    }
}

/// The recorded cause of a failed build.
#[derive(Clone, Debug, Deserialize, Error, Eq, PartialEq, Serialize)]
#[error("{kind}: {message}")]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors raised while reading source data.
///
/// The variant decides whether the fetcher retries.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FetchError {
    /// Network blip, stale file handle, timeout or tape still staging.
    #[error("transient I/O error reading {location}: {reason}")]
    Transient { location: String, reason: String },

    /// Missing object, permission denied or other non-recoverable condition.
    #[error("permanent I/O error reading {location}: {reason}")]
    Permanent { location: String, reason: String },
}

impl FetchError {
    pub fn transient(location: impl ToString, reason: impl ToString) -> Self {
        Self::Transient {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn permanent(location: impl ToString, reason: impl ToString) -> Self {
        Self::Permanent {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Data portal error type
///
/// This type encapsulates the various errors that may occur.
/// Each variant may result in a different API error response.
#[derive(Debug, Error)]
pub enum PortalError {
    /// Malformed materialization request
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Error deserialising the request body
    #[error("request data is not valid")]
    RequestDataJsonRejection(#[from] JsonRejection),

    /// Error validating request data (single error)
    #[error("request data is not valid")]
    RequestDataValidationSingle(#[from] validator::ValidationError),

    /// Error validating request data (multiple errors)
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Error reading source data
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Error decompressing data
    #[error("failed to decompress data from {location}")]
    DecompressionFlate2 {
        location: String,
        #[source]
        source: std::io::Error,
    },

    /// Error decompressing data
    #[error("failed to decompress data")]
    DecompressionZune(#[from] InflateDecodeErrors),

    /// The source does not hold the number of bytes its shape and dtype imply
    #[error("source {location} holds {actual} bytes, expected {expected}")]
    SourceSizeMismatch {
        location: String,
        expected: usize,
        actual: usize,
    },

    /// Error creating an ndarray view from a shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// A build failed with a recorded cause
    #[error("build {fingerprint} failed")]
    BuildFailed {
        fingerprint: String,
        #[source]
        cause: FailureCause,
    },

    /// The durable store could not be used
    #[error("cache store unavailable")]
    CacheStoreUnavailable(#[from] sled::Error),

    /// I/O error on the artifact directory tree
    #[error("cache store I/O error at {path}")]
    StorageIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A record in the durable store could not be (de)serialised
    #[error("corrupt record in cache store")]
    CorruptRecord(#[from] serde_json::Error),

    /// Fingerprint unknown to both the cache and the queue
    #[error("unknown fingerprint {fingerprint}")]
    NotFound { fingerprint: String },

    /// Requested chunk index outside the artifact
    #[error("chunk {index} out of range (artifact has {count} chunks)")]
    ChunkOutOfRange { index: usize, count: usize },

    /// The caller's wait for an in-progress chunk elapsed
    #[error("timed out waiting for chunk {index} of {fingerprint}")]
    ChunkWaitTimeout { fingerprint: String, index: usize },

    /// Per-identity concurrent build quota reached
    #[error("{identity} already has {limit} builds in flight")]
    QuotaExceeded { identity: String, limit: usize },

    /// The worker no longer owns the build it is working on
    #[error("lease on {fingerprint} lost")]
    LeaseLost { fingerprint: String },

    /// Insufficient memory to process request
    #[error("Insufficient memory to process request ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// A blocking or Rayon task panicked or was cancelled
    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),
}

impl PortalError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn storage_io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::StorageIo {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Classify the error within the failure taxonomy, if it belongs to it.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::InvalidRequest { .. }
            | Self::RequestDataJsonRejection(_)
            | Self::RequestDataValidationSingle(_)
            | Self::RequestDataValidation(_)
            | Self::DecompressionFlate2 { .. }
            | Self::DecompressionZune(_)
            | Self::SourceSizeMismatch { .. }
            | Self::ShapeInvalid(_)
            | Self::ChunkOutOfRange { .. }
            | Self::InsufficientMemory { .. } => Some(FailureKind::InvalidRequest),
            Self::Fetch(FetchError::Transient { .. }) | Self::ChunkWaitTimeout { .. } => {
                Some(FailureKind::TransientIo)
            }
            Self::Fetch(FetchError::Permanent { .. }) => Some(FailureKind::PermanentIo),
            Self::BuildFailed { cause, .. } => Some(cause.kind),
            Self::CacheStoreUnavailable(_) | Self::StorageIo { .. } | Self::CorruptRecord(_) => {
                Some(FailureKind::CacheStoreUnavailable)
            }
            Self::NotFound { .. }
            | Self::QuotaExceeded { .. }
            | Self::LeaseLost { .. }
            | Self::SemaphoreAcquireError(_)
            | Self::TryFromInt(_)
            | Self::Join(_) => None,
        }
    }

    /// Whether a worker must stop claiming jobs after this error.
    pub fn is_worker_fatal(&self) -> bool {
        self.failure_kind() == Some(FailureKind::CacheStoreUnavailable)
    }

    /// The cause to record against a build that ended with this error.
    pub fn to_cause(&self) -> FailureCause {
        let kind = self.failure_kind().unwrap_or(FailureKind::TransientIo);
        let mut message = self.to_string();
        let mut current = self.source();
        while let Some(source) = current {
            message.push_str(": ");
            message.push_str(&source.to_string());
            current = source.source();
        }
        FailureCause::new(kind, message)
    }
}

impl IntoResponse for PortalError {
    /// Convert from a `PortalError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Failure kind, when the error belongs to the failure taxonomy
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<FailureKind>,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new(error: &PortalError) -> Self {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody {
            message,
            kind: error.failure_kind(),
            caused_by,
        }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    fn new(status: StatusCode, error: &PortalError) -> Self {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }
}

impl From<PortalError> for ErrorResponse {
    /// Convert from a `PortalError` into an `ErrorResponse`.
    fn from(error: PortalError) -> Self {
        let status = match &error {
            PortalError::NotFound { .. } => StatusCode::NOT_FOUND,
            PortalError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,

            PortalError::LeaseLost { .. }
            | PortalError::SemaphoreAcquireError(_)
            | PortalError::TryFromInt(_)
            | PortalError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // Everything else is classified by its failure kind.
            _ => match error.failure_kind() {
                Some(FailureKind::InvalidRequest) | Some(FailureKind::PermanentIo) => {
                    StatusCode::BAD_REQUEST
                }
                Some(_) => StatusCode::SERVICE_UNAVAILABLE,
                None => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let response = Self::new(status, &error);

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::HeaderMap;

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    async fn test_portal_error(
        error: PortalError,
        status: StatusCode,
        message: &str,
        kind: Option<FailureKind>,
        caused_by: Option<Vec<&'static str>>,
    ) {
        let response = error.into_response();
        assert_eq!(status, response.status());
        let mut headers = HeaderMap::new();
        headers.insert(&header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(headers, *response.headers());
        let error_response: ErrorResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(message.to_string(), error_response.error.message);
        assert_eq!(kind, error_response.error.kind);
        // Map Vec items from str to String
        let caused_by = caused_by.map(|cb| cb.iter().map(|s| s.to_string()).collect());
        assert_eq!(caused_by, error_response.error.caused_by);
    }

    #[tokio::test]
    async fn invalid_request() {
        let error = PortalError::invalid("sources must not be empty");
        let message = "invalid request: sources must not be empty";
        let kind = Some(FailureKind::InvalidRequest);
        test_portal_error(error, StatusCode::BAD_REQUEST, message, kind, None).await;
    }

    #[tokio::test]
    async fn request_data_validation() {
        let mut validation_errors = validator::ValidationErrors::new();
        let validation_error = validator::ValidationError::new("foo");
        validation_errors.add("bar", validation_error);
        let error = PortalError::RequestDataValidation(validation_errors);
        let message = "request data is not valid";
        let kind = Some(FailureKind::InvalidRequest);
        let caused_by = Some(vec!["bar: Validation error: foo [{}]"]);
        test_portal_error(error, StatusCode::BAD_REQUEST, message, kind, caused_by).await;
    }

    #[tokio::test]
    async fn transient_fetch() {
        let error = PortalError::from(FetchError::transient("/a/b.nc", "stale file handle"));
        let message = "transient I/O error reading /a/b.nc: stale file handle";
        let kind = Some(FailureKind::TransientIo);
        test_portal_error(error, StatusCode::SERVICE_UNAVAILABLE, message, kind, None).await;
    }

    #[tokio::test]
    async fn permanent_fetch() {
        let error = PortalError::from(FetchError::permanent("/a/b.nc", "not found"));
        let message = "permanent I/O error reading /a/b.nc: not found";
        let kind = Some(FailureKind::PermanentIo);
        test_portal_error(error, StatusCode::BAD_REQUEST, message, kind, None).await;
    }

    #[tokio::test]
    async fn build_failed_worker_lost() {
        let error = PortalError::BuildFailed {
            fingerprint: "abc".to_string(),
            cause: FailureCause::new(FailureKind::WorkerLost, "lease expired 5 times"),
        };
        let message = "build abc failed";
        let kind = Some(FailureKind::WorkerLost);
        let caused_by = Some(vec!["worker_lost: lease expired 5 times"]);
        test_portal_error(error, StatusCode::SERVICE_UNAVAILABLE, message, kind, caused_by).await;
    }

    #[tokio::test]
    async fn build_failed_permanent() {
        let error = PortalError::BuildFailed {
            fingerprint: "abc".to_string(),
            cause: FailureCause::new(FailureKind::PermanentIo, "gone"),
        };
        let kind = Some(FailureKind::PermanentIo);
        let caused_by = Some(vec!["permanent_io: gone"]);
        test_portal_error(error, StatusCode::BAD_REQUEST, "build abc failed", kind, caused_by)
            .await;
    }

    #[tokio::test]
    async fn not_found() {
        let error = PortalError::NotFound {
            fingerprint: "abc".to_string(),
        };
        test_portal_error(error, StatusCode::NOT_FOUND, "unknown fingerprint abc", None, None)
            .await;
    }

    #[tokio::test]
    async fn quota_exceeded() {
        let error = PortalError::QuotaExceeded {
            identity: "janedoe".to_string(),
            limit: 2,
        };
        let message = "janedoe already has 2 builds in flight";
        test_portal_error(error, StatusCode::TOO_MANY_REQUESTS, message, None, None).await;
    }

    #[tokio::test]
    async fn storage_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let error = PortalError::storage_io("/cache/staging", io_error);
        let message = "cache store I/O error at /cache/staging";
        let kind = Some(FailureKind::CacheStoreUnavailable);
        let caused_by = Some(vec!["disk full"]);
        test_portal_error(error, StatusCode::SERVICE_UNAVAILABLE, message, kind, caused_by).await;
    }

    #[tokio::test]
    async fn semaphore_acquire_error() {
        let sem = tokio::sync::Semaphore::new(1);
        sem.close();
        let error = PortalError::SemaphoreAcquireError(sem.acquire().await.unwrap_err());
        let message = "error acquiring resources";
        let caused_by = Some(vec!["semaphore closed"]);
        test_portal_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None, caused_by)
            .await;
    }

    #[tokio::test]
    async fn shape_error() {
        let error =
            PortalError::ShapeInvalid(ShapeError::from_kind(ndarray::ErrorKind::OutOfBounds));
        let message = "failed to create array from shape";
        let kind = Some(FailureKind::InvalidRequest);
        let caused_by = Some(vec!["ShapeError/OutOfBounds: out of bounds indexing"]);
        test_portal_error(error, StatusCode::BAD_REQUEST, message, kind, caused_by).await;
    }

    #[test]
    fn to_cause_flattens_sources() {
        let io_error = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let cause = PortalError::storage_io("/cache", io_error).to_cause();
        assert_eq!(FailureKind::CacheStoreUnavailable, cause.kind);
        assert_eq!("cache store I/O error at /cache: disk full", cause.message);
    }

    #[test]
    fn worker_fatal() {
        let io_error = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(PortalError::storage_io("/cache", io_error).is_worker_fatal());
        assert!(!PortalError::from(FetchError::permanent("x", "y")).is_worker_fatal());
    }

    #[test]
    fn failure_kind_retryable() {
        assert!(!FailureKind::InvalidRequest.is_retryable());
        assert!(!FailureKind::PermanentIo.is_retryable());
        assert!(FailureKind::BuildTimeout.is_retryable());
        assert_eq!("worker_lost", FailureKind::WorkerLost.to_string());
    }
}
