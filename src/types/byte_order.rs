use serde::{Deserialize, Serialize};

/// Byte order / endianness of the source data.
///
/// Data is never byte-swapped: the order is carried into the Zarr `dtype` string.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Big Endian
    Big,
    /// Little Endian
    #[default]
    Little,
}

impl ByteOrder {
    /// Returns the NumPy type string prefix for this byte order.
    pub fn typestr_prefix(self) -> char {
        match self {
            Self::Big => '>',
            Self::Little => '<',
        }
    }
}
