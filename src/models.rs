//! Materialization request types and their validation.

use crate::types::ByteOrder;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use validator::{Validate, ValidationError};

/// Supported numerical data types
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// [i32]
    Int32,
    /// [i64]
    Int64,
    /// [u32]
    Uint32,
    /// [u64]
    Uint64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Int32 => std::mem::size_of::<i32>(),
            Self::Int64 => std::mem::size_of::<i64>(),
            Self::Uint32 => std::mem::size_of::<u32>(),
            Self::Uint64 => std::mem::size_of::<u64>(),
            Self::Float32 => std::mem::size_of::<f32>(),
            Self::Float64 => std::mem::size_of::<f64>(),
        }
    }

    /// Returns the NumPy/Zarr type string, e.g. `<f4`.
    pub fn typestr(self, byte_order: ByteOrder) -> String {
        let kind = match self {
            Self::Int32 | Self::Int64 => 'i',
            Self::Uint32 | Self::Uint64 => 'u',
            Self::Float32 | Self::Float64 => 'f',
        };
        format!("{}{}{}", byte_order.typestr_prefix(), kind, self.size_of())
    }
}

/// A slice of a single dimension of an array
///
/// The API uses NumPy slice semantics:
///
/// When start or end is negative:
/// * positive_start = start + length
/// * positive_end = end + length
/// Start and end are clamped:
/// * positive_start = min(positive_start, 0)
/// * positive_end + max(positive_end, length)
/// When the stride is positive:
/// * positive_start <= i < positive_end
/// When the stride is negative:
/// * positive_end <= i < positive_start
// NOTE: In serde, structs can be deserialised from sequences or maps. This allows us to support
// the [<start>, <end>, <stride>] API, with the convenience of named fields.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_slice"))]
pub struct Slice {
    /// Start of the slice
    pub start: isize,
    /// End of the slice
    pub end: isize,
    /// Stride size
    pub stride: isize,
}

impl Slice {
    /// Return a new Slice object.
    pub fn new(start: isize, end: isize, stride: isize) -> Self {
        Slice { start, end, stride }
    }
}

/// Compression algorithm applied to each source as a whole
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "id")]
pub enum Compression {
    /// Gzip
    Gzip,
    /// Zlib
    Zlib,
}

/// How the sources of a request combine into output variables.
///
/// This is also the source ordering policy used for fingerprinting.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Aggregation {
    /// Sources are concatenated along the leading (time) axis into one variable.
    /// Source order is significant.
    #[default]
    Concat,
    /// Every source becomes its own variable, named after the file stem.
    /// Source order is not significant.
    Independent,
}

/// Output format of a materialized artifact
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    /// Zarr v2 with consolidated metadata
    #[default]
    Zarr,
}

/// Subset parameters of a request.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Subset {
    /// Output variable name (concat) or the variable to keep (independent)
    #[validate(length(min = 1, message = "variable must not be empty"))]
    pub variable: Option<String>,
    /// Time facet resolved upstream by the catalogue
    pub time: Option<String>,
    /// Index selection applied to every source array
    #[validate]
    #[validate(length(min = 1, message = "selection length must be greater than 0"))]
    pub selection: Option<Vec<Slice>>,
}

/// A request to materialize a set of located files as a chunked array store
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "validate_request"))]
pub struct MaterializationRequest {
    /// Resolved source locations
    #[validate(length(min = 1, message = "sources must not be empty"))]
    pub sources: Vec<String>,
    /// Source ordering and combination policy
    #[serde(default)]
    pub aggregation: Aggregation,
    /// Data type of every source
    pub dtype: DType,
    /// Byte order of every source
    pub byte_order: Option<ByteOrder>,
    /// Shape of every source array
    #[validate(
        length(min = 1, message = "shape length must be greater than 0"),
        custom = "validate_shape"
    )]
    pub shape: Vec<usize>,
    /// Compression applied to each source
    pub compression: Option<Compression>,
    /// Subset parameters
    #[serde(default)]
    #[validate]
    pub subset: Subset,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Target chunk size in bytes
    #[validate(range(min = 1, message = "chunk_bytes must be greater than 0"))]
    pub chunk_bytes: Option<usize>,
}

/// Validate an array shape
fn validate_shape(shape: &[usize]) -> Result<(), ValidationError> {
    if shape.iter().any(|index| *index == 0) {
        return Err(ValidationError::new("shape indices must be greater than 0"));
    }
    Ok(())
}

/// Validate an array slice
fn validate_slice(slice: &Slice) -> Result<(), ValidationError> {
    if slice.stride == 0 {
        let mut error = ValidationError::new("Selection stride must not be equal to zero");
        error.add_param("stride".into(), &slice.stride);
        return Err(error);
    }
    Ok(())
}

/// Validate that a shape and selection are consistent
fn validate_shape_selection(shape: &[usize], selection: &[Slice]) -> Result<(), ValidationError> {
    if shape.len() != selection.len() {
        let mut error = ValidationError::new("Shape and selection must have the same length");
        error.add_param("shape".into(), &shape.len());
        error.add_param("selection".into(), &selection.len());
        return Err(error);
    }
    Ok(())
}

/// Validate request data
fn validate_request(request: &MaterializationRequest) -> Result<(), ValidationError> {
    if let Some(selection) = &request.subset.selection {
        validate_shape_selection(&request.shape, selection)?;
    }
    if request.sources.iter().any(|source| source.trim().is_empty()) {
        return Err(ValidationError::new("sources must not contain empty locations"));
    }
    Ok(())
}
