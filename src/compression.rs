//! Decompression of whole source files.

use crate::error::PortalError;
use crate::models;

use axum::body::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;
use zune_inflate::{DeflateDecoder, DeflateOptions};

/// Decompresses some Bytes and returns the uncompressed data.
///
/// # Arguments
///
/// * `compression`: Compression algorithm
/// * `location`: Location the data was read from, for error reporting
/// * `data`: Compressed data [Bytes](axum::body::Bytes)
pub fn decompress(
    compression: models::Compression,
    location: &str,
    data: &Bytes,
) -> Result<Bytes, PortalError> {
    match compression {
        models::Compression::Gzip => decompress_flate2_gzip(location, data),
        models::Compression::Zlib => decompress_zune_zlib(data),
    }
}

fn decompress_flate2_gzip(location: &str, data: &Bytes) -> Result<Bytes, PortalError> {
    let mut decoder = GzDecoder::<&[u8]>::new(data);
    let mut buf = Vec::with_capacity(data.len());
    decoder
        .read_to_end(&mut buf)
        .map_err(|source| PortalError::DecompressionFlate2 {
            location: location.to_string(),
            source,
        })?;
    Ok(buf.into())
}

fn decompress_zune_zlib(data: &Bytes) -> Result<Bytes, PortalError> {
    let options = DeflateOptions::default().set_size_hint(data.len());
    let mut decoder = DeflateDecoder::new_with_options(data, options);
    let data = decoder.decode_zlib()?;
    Ok(data.into())
}
