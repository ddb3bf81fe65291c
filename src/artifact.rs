//! Materialized artifacts: their on-disk layout and their Zarr v2 metadata.
//!
//! An artifact is a single data file holding every chunk of every variable back to back, in
//! the order of its [ChunkPlan]. The Zarr documents are rendered from the artifact record, so
//! nothing but chunk bytes is kept on disk.

use crate::chunking::{ChunkPlan, VariablePlan};
use crate::clock::Millis;
use crate::error::PortalError;
use crate::fingerprint::NormalizedRequest;
use crate::models::{Aggregation, DType};
use crate::types::ByteOrder;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

/// Name of the chunk data file of a build.
pub const DATA_FILE: &str = "data.bin";

const STAGING_DIR: &str = "staging";
const ARTIFACTS_DIR: &str = "artifacts";

/// A completed build of one fingerprint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Artifact {
    pub fingerprint: String,
    /// Build id of the build that produced it
    pub version: String,
    pub dtype: DType,
    pub byte_order: ByteOrder,
    /// Chunk layout, mapping chunk indices to byte ranges of the data file
    pub plan: ChunkPlan,
    /// Zarr group attributes
    pub attributes: Map<String, Value>,
    pub created_at: Millis,
    pub size_bytes: u64,
}

impl Artifact {
    /// Describes the artifact a build of `normalized` produces.
    pub fn new(normalized: &NormalizedRequest, version: &str, created_at: Millis) -> Self {
        let request = &normalized.request;
        let mut attributes = Map::new();
        attributes.insert("fingerprint".into(), json!(normalized.fingerprint));
        attributes.insert("sources".into(), json!(request.sources));
        attributes.insert("aggregation".into(), json!(request.aggregation));
        if let Some(time) = &request.subset.time {
            attributes.insert("time".into(), json!(time));
        }
        Self {
            fingerprint: normalized.fingerprint.clone(),
            version: version.to_string(),
            dtype: request.dtype,
            byte_order: request.byte_order.unwrap_or_default(),
            plan: normalized.plan.clone(),
            attributes,
            created_at,
            size_bytes: normalized.plan.total_bytes,
        }
    }

    /// Whether the leading axis of every variable concatenates sources in time.
    fn is_time_series(&self) -> bool {
        self.attributes.get("aggregation") == Some(&json!(Aggregation::Concat))
    }

    fn variable(&self, name: &str) -> Result<&VariablePlan, PortalError> {
        self.plan.variable(name).ok_or_else(|| PortalError::NotFound {
            fingerprint: format!("{}/{}", self.fingerprint, name),
        })
    }

    /// The `.zgroup` document.
    pub fn zgroup(&self) -> Value {
        json!({ "zarr_format": 2 })
    }

    /// The group's `.zattrs` document.
    pub fn zattrs(&self) -> Value {
        Value::Object(self.attributes.clone())
    }

    /// The `.zarray` document of a variable.
    pub fn zarray(&self, name: &str) -> Result<Value, PortalError> {
        let variable = self.variable(name)?;
        Ok(json!({
            "chunks": variable.chunk_shape,
            "compressor": null,
            "dtype": self.dtype.typestr(self.byte_order),
            "fill_value": null,
            "filters": null,
            "order": "C",
            "shape": variable.shape,
            "zarr_format": 2,
        }))
    }

    /// The `.zattrs` document of a variable.
    pub fn array_zattrs(&self, name: &str) -> Result<Value, PortalError> {
        let variable = self.variable(name)?;
        let dimensions: Vec<String> = (0..variable.shape.len())
            .map(|axis| {
                if axis == 0 && self.is_time_series() {
                    "time".to_string()
                } else {
                    format!("dim_{axis}")
                }
            })
            .collect();
        Ok(json!({ "_ARRAY_DIMENSIONS": dimensions }))
    }

    /// Consolidated metadata of the whole store.
    pub fn zmetadata(&self) -> Result<Value, PortalError> {
        let mut metadata = Map::new();
        metadata.insert(".zgroup".into(), self.zgroup());
        metadata.insert(".zattrs".into(), self.zattrs());
        for variable in &self.plan.variables {
            metadata.insert(format!("{}/.zarray", variable.name), self.zarray(&variable.name)?);
            metadata.insert(
                format!("{}/.zattrs", variable.name),
                self.array_zattrs(&variable.name)?,
            );
        }
        Ok(json!({
            "zarr_consolidated_format": 1,
            "metadata": metadata,
        }))
    }
}

/// Directory layout of the cache.
///
/// ```text
/// <root>/staging/<fingerprint>/<build id>/data.bin     in-progress builds
/// <root>/artifacts/<fingerprint>/<build id>/data.bin   completed builds
/// ```
#[derive(Clone, Debug)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn staging_dir(&self, fingerprint: &str, build_id: &str) -> PathBuf {
        self.staging_root().join(fingerprint).join(build_id)
    }

    pub fn staging_data(&self, fingerprint: &str, build_id: &str) -> PathBuf {
        self.staging_dir(fingerprint, build_id).join(DATA_FILE)
    }

    /// Directory holding every version of a fingerprint.
    pub fn fingerprint_dir(&self, fingerprint: &str) -> PathBuf {
        self.artifacts_root().join(fingerprint)
    }

    pub fn artifact_dir(&self, fingerprint: &str, version: &str) -> PathBuf {
        self.fingerprint_dir(fingerprint).join(version)
    }

    pub fn artifact_data(&self, fingerprint: &str, version: &str) -> PathBuf {
        self.artifact_dir(fingerprint, version).join(DATA_FILE)
    }

    /// Creates the staging and artifact roots.
    pub fn create(&self) -> Result<(), PortalError> {
        for dir in [self.staging_root(), self.artifacts_root()] {
            std::fs::create_dir_all(&dir).map_err(|err| PortalError::storage_io(&dir, err))?;
        }
        Ok(())
    }
}
