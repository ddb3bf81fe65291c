//! Request canonicalization and fingerprinting.
//!
//! Two requests that mean the same thing normalize to the same canonical request, and therefore
//! the same fingerprint. Canonicalization rules per field:
//!
//! * `sources`: trimmed and re-rendered through [Location]. Order is kept for
//!   [Aggregation::Concat] and sorted for [Aggregation::Independent].
//! * `byte_order`: defaults to little endian.
//! * `chunk_bytes`: defaults to the configured chunk size.
//! * `subset.variable`, `subset.time`: trimmed. An empty time is dropped.
//! * `subset.selection`: kept verbatim.

use crate::chunking::ChunkPlan;
use crate::error::PortalError;
use crate::models::{Aggregation, MaterializationRequest};
use crate::types::ByteOrder;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use url::Url;
use uuid::Uuid;
use validator::Validate;

/// A parsed source location.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Location {
    /// A local or SSH-mounted POSIX path
    Posix(PathBuf),
    /// A file in the tape archive, addressed by its archive path
    Tape(PathBuf),
    /// An object on an HTTP(S) server
    Http(Url),
    /// An object in an S3-compatible store. `endpoint` is `None` for the configured default.
    S3 {
        endpoint: Option<Url>,
        bucket: String,
        key: String,
    },
}

/// Collapses `.`, `..` and repeated separators of an absolute path without touching the
/// filesystem.
fn normalize_path(raw: &str, path: &Path) -> Result<PathBuf, PortalError> {
    if !path.is_absolute() {
        return Err(PortalError::invalid(format!("{raw}: path must be absolute")));
    }
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push("/"),
            Component::CurDir => (),
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
            Component::Prefix(_) => {
                return Err(PortalError::invalid(format!("{raw}: unsupported path")))
            }
        }
    }
    if normalized.file_name().is_none() {
        return Err(PortalError::invalid(format!("{raw}: path names no file")));
    }
    Ok(normalized)
}

fn split_bucket_key(raw: &str, path: &str) -> Result<(String, String), PortalError> {
    let path = path.trim_start_matches('/');
    match path.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(PortalError::invalid(format!(
            "{raw}: expected a bucket and an object key"
        ))),
    }
}

impl FromStr for Location {
    type Err = PortalError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.starts_with('/') {
            return Ok(Self::Posix(normalize_path(raw, Path::new(trimmed))?));
        }
        let url = Url::parse(trimmed)
            .map_err(|err| PortalError::invalid(format!("{raw}: unparseable location: {err}")))?;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| PortalError::invalid(format!("{raw}: not a local file URI")))?;
                Ok(Self::Posix(normalize_path(raw, &path)?))
            }
            "hsm" => {
                if url.host_str().is_some_and(|host| !host.is_empty()) {
                    return Err(PortalError::invalid(format!(
                        "{raw}: tape locations take no host, use hsm:///path"
                    )));
                }
                Ok(Self::Tape(normalize_path(raw, Path::new(url.path()))?))
            }
            "http" | "https" => {
                if url.host_str().is_none() {
                    return Err(PortalError::invalid(format!("{raw}: missing host")));
                }
                Ok(Self::Http(url))
            }
            "s3" => {
                let bucket = url.host_str().unwrap_or_default();
                let (bucket, key) = split_bucket_key(raw, &format!("{bucket}{}", url.path()))?;
                Ok(Self::S3 {
                    endpoint: None,
                    bucket,
                    key,
                })
            }
            "s3+http" | "s3+https" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| PortalError::invalid(format!("{raw}: missing host")))?;
                let scheme = url.scheme().trim_start_matches("s3+");
                let authority = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                let endpoint = Url::parse(&format!("{scheme}://{authority}"))
                    .map_err(|err| PortalError::invalid(format!("{raw}: {err}")))?;
                let (bucket, key) = split_bucket_key(raw, url.path())?;
                Ok(Self::S3 {
                    endpoint: Some(endpoint),
                    bucket,
                    key,
                })
            }
            scheme => Err(PortalError::invalid(format!(
                "{raw}: unsupported location scheme {scheme}"
            ))),
        }
    }
}

impl fmt::Display for Location {
    /// Renders the canonical form of the location.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Posix(path) => write!(f, "{}", path.display()),
            Self::Tape(path) => write!(f, "hsm://{}", path.display()),
            Self::Http(url) => write!(f, "{url}"),
            Self::S3 {
                endpoint: None,
                bucket,
                key,
            } => write!(f, "s3://{bucket}/{key}"),
            Self::S3 {
                endpoint: Some(endpoint),
                bucket,
                key,
            } => {
                let authority = match endpoint.port() {
                    Some(port) => format!("{}:{port}", endpoint.host_str().unwrap_or_default()),
                    None => endpoint.host_str().unwrap_or_default().to_string(),
                };
                write!(f, "s3+{}://{authority}/{bucket}/{key}", endpoint.scheme())
            }
        }
    }
}

impl Location {
    /// File name without its extension, used to name variables of independent requests.
    pub fn stem(&self) -> Option<String> {
        let name = match self {
            Self::Posix(path) | Self::Tape(path) => path.file_name()?.to_str()?.to_string(),
            Self::Http(url) => url.path_segments()?.last()?.to_string(),
            Self::S3 { key, .. } => key.rsplit('/').next()?.to_string(),
        };
        let stem = Path::new(&name).file_stem()?.to_str()?.to_string();
        (!stem.is_empty()).then_some(stem)
    }
}

/// A canonical request with its fingerprint and chunk plan.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NormalizedRequest {
    /// Hyphenated v5 UUID over the canonical request
    pub fingerprint: String,
    /// Canonical request, every defaulted field filled in
    pub request: MaterializationRequest,
    /// Deterministic output layout
    pub plan: ChunkPlan,
}

impl NormalizedRequest {
    /// Parsed locations of the canonical sources, in plan order.
    pub fn locations(&self) -> Result<Vec<Location>, PortalError> {
        self.request.sources.iter().map(|s| s.parse()).collect()
    }
}

/// Computes the fingerprint of a canonical request.
pub fn fingerprint(canonical: &MaterializationRequest) -> Result<String, PortalError> {
    let json = serde_json::to_vec(canonical)?;
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_URL, &json)
        .hyphenated()
        .to_string())
}

/// Parses a fingerprint from a path segment, returning its canonical spelling.
///
/// Anything that is not a UUID cannot name a build and is reported as unknown.
pub fn parse_fingerprint(raw: &str) -> Result<String, PortalError> {
    Uuid::parse_str(raw)
        .map(|uuid| uuid.hyphenated().to_string())
        .map_err(|_| PortalError::NotFound {
            fingerprint: raw.to_string(),
        })
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Canonicalizes a request and derives its fingerprint and chunk plan.
///
/// # Arguments
///
/// * `request`: The request as submitted
/// * `default_chunk_bytes`: Chunk size used when the request names none
pub fn normalize(
    request: &MaterializationRequest,
    default_chunk_bytes: usize,
) -> Result<NormalizedRequest, PortalError> {
    request.validate()?;

    let mut locations = request
        .sources
        .iter()
        .map(|source| source.parse::<Location>())
        .collect::<Result<Vec<_>, _>>()?;

    let variable = match &request.subset.variable {
        Some(_) => Some(
            trimmed(&request.subset.variable)
                .ok_or_else(|| PortalError::invalid("variable must not be blank"))?,
        ),
        None => None,
    };

    if request.aggregation == Aggregation::Independent {
        let mut named = locations
            .into_iter()
            .map(|location| {
                let stem = location.stem().ok_or_else(|| {
                    PortalError::invalid(format!("{location}: cannot derive a variable name"))
                })?;
                Ok((location.to_string(), stem, location))
            })
            .collect::<Result<Vec<_>, PortalError>>()?;
        named.sort_by(|a, b| a.0.cmp(&b.0));
        let mut stems: Vec<&str> = named.iter().map(|(_, stem, _)| stem.as_str()).collect();
        stems.sort_unstable();
        if let Some(pair) = stems.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(PortalError::invalid(format!(
                "duplicate variable name {}",
                pair[0]
            )));
        }
        if let Some(variable) = &variable {
            named.retain(|(_, stem, _)| stem == variable);
            if named.is_empty() {
                return Err(PortalError::invalid(format!(
                    "variable {variable} matches no source"
                )));
            }
        }
        locations = named.into_iter().map(|(_, _, location)| location).collect();
    }

    let canonical = MaterializationRequest {
        sources: locations.iter().map(Location::to_string).collect(),
        aggregation: request.aggregation,
        dtype: request.dtype,
        byte_order: Some(request.byte_order.unwrap_or(ByteOrder::Little)),
        shape: request.shape.clone(),
        compression: request.compression,
        subset: crate::models::Subset {
            variable,
            time: trimmed(&request.subset.time),
            selection: request.subset.selection.clone(),
        },
        format: request.format,
        chunk_bytes: Some(request.chunk_bytes.unwrap_or(default_chunk_bytes)),
    };

    let plan = ChunkPlan::new(&canonical, &locations)?;
    Ok(NormalizedRequest {
        fingerprint: fingerprint(&canonical)?,
        request: canonical,
        plan,
    })
}
