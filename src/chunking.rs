//! Deterministic chunk layout of a materialized artifact.
//!
//! Chunks are numbered globally across variables, in variable order. Every chunk of a variable
//! has the same byte length, and chunk `i` occupies bytes `[offset, offset + len)` of the
//! artifact's data file.

use crate::array;
use crate::error::PortalError;
use crate::fingerprint::Location;
use crate::models::{Aggregation, MaterializationRequest};

use serde::{Deserialize, Serialize};

/// Name of the single variable of a concatenation without an explicit name.
pub const DEFAULT_VARIABLE: &str = "data";

/// Byte range of a chunk within an artifact's data file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChunkRange {
    pub offset: u64,
    pub len: u64,
}

/// Layout of one output variable.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VariablePlan {
    /// Variable name
    pub name: String,
    /// Indices into the canonical sources feeding this variable, in order
    pub sources: Vec<usize>,
    /// Shape of one source after selection
    pub source_shape: Vec<usize>,
    /// Shape of the variable
    pub shape: Vec<usize>,
    /// Shape of one chunk
    pub chunk_shape: Vec<usize>,
    /// Global index of the variable's first chunk
    pub first_chunk: usize,
    /// Number of chunks
    pub chunk_count: usize,
    /// Length of every chunk in bytes
    pub chunk_len: u64,
    /// Offset of the first chunk in the data file
    pub data_offset: u64,
}

impl VariablePlan {
    /// Bytes in one row (one index of the leading axis).
    pub fn row_bytes(&self, element_size: usize) -> usize {
        self.shape[1..].iter().product::<usize>() * element_size
    }

    /// Zarr v2 key of a chunk, local to this variable.
    pub fn chunk_key(&self, local: usize) -> String {
        let mut key = local.to_string();
        for _ in 1..self.shape.len() {
            key.push_str(".0");
        }
        key
    }

    /// Parses a Zarr v2 chunk key into a local chunk index.
    pub fn parse_chunk_key(&self, key: &str) -> Option<usize> {
        let mut parts = key.split('.');
        let local: usize = parts.next()?.parse().ok()?;
        let mut rest = 0;
        for part in parts {
            if part != "0" {
                return None;
            }
            rest += 1;
        }
        (rest + 1 == self.shape.len() && local < self.chunk_count).then_some(local)
    }
}

fn too_large() -> PortalError {
    PortalError::invalid("shape too large")
}

/// Byte length of an array of `shape`, rejecting shapes whose size does not fit in memory.
pub fn byte_len(shape: &[usize], element_size: usize) -> Result<usize, PortalError> {
    shape
        .iter()
        .try_fold(element_size, |len, dim| len.checked_mul(*dim))
        .filter(|len| isize::try_from(*len).is_ok())
        .ok_or_else(too_large)
}

/// Layout of a whole artifact.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChunkPlan {
    pub variables: Vec<VariablePlan>,
    pub element_size: usize,
    pub total_chunks: usize,
    pub total_bytes: u64,
}

impl ChunkPlan {
    /// Derives the plan of a canonical request.
    ///
    /// # Arguments
    ///
    /// * `request`: Canonical request, `chunk_bytes` filled in
    /// * `locations`: Parsed canonical sources
    pub fn new(request: &MaterializationRequest, locations: &[Location]) -> Result<Self, PortalError> {
        let element_size = request.dtype.size_of();
        byte_len(&request.shape, element_size)?;
        let source_shape = array::selected_shape(&request.shape, &request.subset.selection);
        if source_shape.iter().any(|len| *len == 0) {
            return Err(PortalError::invalid("selection selects no elements"));
        }
        let chunk_bytes = request
            .chunk_bytes
            .ok_or_else(|| PortalError::invalid("chunk size missing from canonical request"))?;

        let groups: Vec<(String, Vec<usize>)> = match request.aggregation {
            Aggregation::Concat => vec![(
                request
                    .subset
                    .variable
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VARIABLE.to_string()),
                (0..locations.len()).collect(),
            )],
            Aggregation::Independent => locations
                .iter()
                .enumerate()
                .map(|(i, location)| {
                    location
                        .stem()
                        .map(|stem| (stem, vec![i]))
                        .ok_or_else(|| PortalError::invalid(format!("{location}: no variable name")))
                })
                .collect::<Result<_, _>>()?,
        };

        let mut variables = Vec::with_capacity(groups.len());
        let mut first_chunk = 0;
        let mut data_offset = 0;
        for (name, sources) in groups {
            let mut shape = source_shape.clone();
            shape[0] = shape[0].checked_mul(sources.len()).ok_or_else(too_large)?;
            byte_len(&shape, element_size)?;
            let row_bytes = byte_len(&source_shape[1..], element_size)?;
            let rows = (chunk_bytes / row_bytes).clamp(1, shape[0]);
            let mut chunk_shape = shape.clone();
            chunk_shape[0] = rows;
            let chunk_count = shape[0].div_ceil(rows);
            let chunk_len = u64::try_from(rows * row_bytes)?;
            variables.push(VariablePlan {
                name,
                sources,
                source_shape: source_shape.clone(),
                shape,
                chunk_shape,
                first_chunk,
                chunk_count,
                chunk_len,
                data_offset,
            });
            first_chunk += chunk_count;
            data_offset = u64::try_from(chunk_count)?
                .checked_mul(chunk_len)
                .and_then(|len| data_offset.checked_add(len))
                .ok_or_else(too_large)?;
        }
        Ok(Self {
            variables,
            element_size,
            total_chunks: first_chunk,
            total_bytes: data_offset,
        })
    }

    /// Maps a global chunk index to its variable and local index.
    pub fn locate(&self, global: usize) -> Option<(&VariablePlan, usize)> {
        self.variables
            .iter()
            .find(|v| global >= v.first_chunk && global < v.first_chunk + v.chunk_count)
            .map(|v| (v, global - v.first_chunk))
    }

    /// Byte range of a global chunk.
    pub fn range(&self, global: usize) -> Result<ChunkRange, PortalError> {
        let (variable, local) = self.locate(global).ok_or(PortalError::ChunkOutOfRange {
            index: global,
            count: self.total_chunks,
        })?;
        Ok(ChunkRange {
            offset: variable.data_offset + variable.chunk_len * u64::try_from(local)?,
            len: variable.chunk_len,
        })
    }

    pub fn variable(&self, name: &str) -> Option<&VariablePlan> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Maps a variable name and Zarr chunk key to a global chunk index.
    pub fn global_index(&self, variable: &str, key: &str) -> Option<usize> {
        let variable = self.variable(variable)?;
        variable
            .parse_chunk_key(key)
            .map(|local| variable.first_chunk + local)
    }
}
