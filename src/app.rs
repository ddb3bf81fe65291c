use crate::app_state::{AppState, SharedAppState};
use crate::cli::CommandLineArgs;
use crate::error::PortalError;
use crate::fingerprint::parse_fingerprint;
use crate::gateway::Submission;
use crate::job::JobState;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::models::MaterializationRequest;
use crate::validated_json::ValidatedJson;

use axum::{
    body::{Body, StreamBody},
    extract::{Path, Query, State},
    http::header,
    http::HeaderMap,
    http::Request,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower::Layer;
use tower::ServiceBuilder;
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tower_http::validate_request::ValidateRequestHeaderLayer;
use tracing::Level;

/// Caller identity, set by the authenticating proxy in front of the portal.
static HEADER_USER: header::HeaderName = header::HeaderName::from_static("x-portal-user");
/// Byte length of the chunks of a chunk stream.
static HEADER_CHUNK_BYTES: header::HeaderName =
    header::HeaderName::from_static("x-portal-chunk-bytes");

/// Suffix of Zarr store path segments.
const ZARR_SUFFIX: &str = ".zarr";

/// `x-portal-chunk-bytes` value: the length when every chunk has the same one, otherwise a JSON
/// array of lengths.
fn chunk_bytes_header(lengths: &[u64]) -> String {
    match lengths.split_first() {
        Some((first, rest)) if rest.iter().all(|len| len == first) => first.to_string(),
        _ => serde_json::Value::from(lengths.to_vec()).to_string(),
    }
}

/// Query parameters of a chunk range request.
#[derive(Debug, Default, Deserialize)]
struct ChunkQuery {
    start: Option<usize>,
    end: Option<usize>,
    /// Per-chunk wait bound in seconds
    timeout: Option<u64>,
}

/// Query parameters of a Zarr chunk request.
#[derive(Debug, Default, Deserialize)]
struct WaitQuery {
    timeout: Option<u64>,
}

impl IntoResponse for Submission {
    fn into_response(self) -> Response {
        let status = if self.status == JobState::Ready {
            StatusCode::OK
        } else {
            StatusCode::ACCEPTED
        };
        (status, Json(self)).into_response()
    }
}

/// Service type of the portal.
pub type Service = NormalizePath<Router>;

/// Returns a [axum::Router] with all portal routes.
pub fn router(state: SharedAppState) -> Router {
    fn v1() -> Router<SharedAppState> {
        Router::new()
            .route("/materialize", post(materialize))
            .route("/status/:fingerprint", get(status))
            .route("/chunks/:fingerprint", get(chunks))
            .route("/zarr/:store/:document", get(zarr_group))
            .route("/zarr/:store/:variable/:key", get(zarr_array))
            .layer(
                ServiceBuilder::new()
                    .layer(
                        TraceLayer::new_for_http()
                            .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                            .on_request(request_counter)
                            .on_response(record_response_metrics),
                    )
                    .layer(ValidateRequestHeaderLayer::custom(
                        // Validate that the proxy has identified the caller.
                        |request: &mut Request<Body>| {
                            if request.headers().contains_key(&HEADER_USER) {
                                Ok(())
                            } else {
                                Err(StatusCode::UNAUTHORIZED.into_response())
                            }
                        },
                    )),
            )
            .route("/metrics", get(metrics_handler))
    }

    Router::new()
        .nest("/api/data-portal/v1", v1())
        .with_state(state)
}

/// Returns the portal service.
pub fn service(state: SharedAppState) -> Service {
    NormalizePathLayer::trim_trailing_slash().layer(router(state))
}

/// Builds the application state from the command line arguments.
pub fn state(args: &CommandLineArgs) -> Result<SharedAppState, PortalError> {
    Ok(Arc::new(AppState::new(args)?))
}

fn identity(headers: &HeaderMap) -> Result<&str, PortalError> {
    headers
        .get(&HEADER_USER)
        .ok_or_else(|| PortalError::invalid("missing caller identity"))?
        .to_str()
        .map_err(|_| PortalError::invalid("caller identity is not valid text"))
}

/// Chunk wait bound of a request, capped by the configured maximum.
fn wait_timeout(state: &AppState, timeout: Option<u64>) -> Duration {
    let timeout = timeout
        .unwrap_or(state.args.chunk_wait_timeout)
        .min(state.args.max_chunk_wait_timeout);
    Duration::from_secs(timeout)
}

/// Strips the `.zarr` suffix of a store path segment.
fn store_fingerprint(store: &str) -> Result<String, PortalError> {
    let fingerprint = store
        .strip_suffix(ZARR_SUFFIX)
        .ok_or_else(|| PortalError::NotFound {
            fingerprint: store.to_string(),
        })?;
    parse_fingerprint(fingerprint)
}

/// Handler for materialization requests
///
/// Replies 200 when the artifact is ready and 202 while it is being built.
async fn materialize(
    State(state): State<SharedAppState>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<MaterializationRequest>,
) -> Result<Submission, PortalError> {
    let identity = identity(&headers)?;
    state.gateway.submit(&request, identity)
}

async fn status(
    State(state): State<SharedAppState>,
    Path(fingerprint): Path<String>,
) -> Result<impl IntoResponse, PortalError> {
    let fingerprint = parse_fingerprint(&fingerprint)?;
    Ok(Json(state.gateway.status(&fingerprint)?))
}

/// Handler for chunk range streams
///
/// The first chunk is awaited before the response starts, so a build that fails or times out
/// before producing it is answered with an error status. A later error aborts the body.
async fn chunks(
    State(state): State<SharedAppState>,
    Path(fingerprint): Path<String>,
    Query(query): Query<ChunkQuery>,
) -> Result<Response, PortalError> {
    let fingerprint = parse_fingerprint(&fingerprint)?;
    let timeout = wait_timeout(&state, query.timeout);
    let stream = state
        .gateway
        .open_stream(&fingerprint, query.start, query.end, timeout)?;
    let chunk_bytes = chunk_bytes_header(&stream.chunk_lengths);
    let mut chunks = Box::pin(stream.chunks);
    let first = chunks.next().await.transpose()?;
    let body = futures::stream::iter(first.map(Ok))
        .chain(chunks)
        .inspect_err(move |err| {
            tracing::warn!(%fingerprint, "chunk stream aborted: {}", err);
        });
    Ok((
        [
            (
                &header::CONTENT_TYPE,
                mime::APPLICATION_OCTET_STREAM.to_string(),
            ),
            (&HEADER_CHUNK_BYTES, chunk_bytes),
        ],
        StreamBody::new(body),
    )
        .into_response())
}

/// Handler for `.zmetadata`, `.zgroup` and `.zattrs` of a store
async fn zarr_group(
    State(state): State<SharedAppState>,
    Path((store, document)): Path<(String, String)>,
) -> Result<impl IntoResponse, PortalError> {
    let fingerprint = store_fingerprint(&store)?;
    Ok(Json(
        state.gateway.zarr_document(&fingerprint, None, &document)?,
    ))
}

/// Handler for array metadata and chunks of a store
async fn zarr_array(
    State(state): State<SharedAppState>,
    Path((store, variable, key)): Path<(String, String, String)>,
    Query(query): Query<WaitQuery>,
) -> Result<Response, PortalError> {
    let fingerprint = store_fingerprint(&store)?;
    if key.starts_with('.') {
        let document = state
            .gateway
            .zarr_document(&fingerprint, Some(&variable), &key)?;
        return Ok(Json(document).into_response());
    }
    let timeout = wait_timeout(&state, query.timeout);
    let chunk = state
        .gateway
        .zarr_chunk(&fingerprint, &variable, &key, timeout)
        .await?;
    Ok((
        [(
            &header::CONTENT_TYPE,
            mime::APPLICATION_OCTET_STREAM.to_string(),
        )],
        chunk,
    )
        .into_response())
}
