use crate::error::FetchError;
use crate::fetcher::SourceReader;
use crate::fingerprint::{normalize, Location, NormalizedRequest};
use crate::gateway::GatewayConfig;
use crate::models::*;
use crate::queue::QueueConfig;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Create a MaterializationRequest object with only required fields set.
pub(crate) fn get_test_request() -> MaterializationRequest {
    MaterializationRequest {
        sources: vec!["/a/ta_2016.nc".to_string()],
        aggregation: Aggregation::Concat,
        dtype: DType::Float32,
        byte_order: None,
        shape: vec![4, 3],
        compression: None,
        subset: Subset::default(),
        format: OutputFormat::Zarr,
        chunk_bytes: None,
    }
}

/// Normalizes the test request with a single source.
pub(crate) fn normalized(source: &str) -> NormalizedRequest {
    let mut request = get_test_request();
    request.sources = vec![source.to_string()];
    normalize(&request, 24).unwrap()
}

pub(crate) fn queue_config() -> QueueConfig {
    QueueConfig {
        lease_timeout: Duration::from_secs(30),
        max_attempts: 3,
        build_timeout: Duration::from_secs(120),
        job_ttl: Duration::from_secs(3600),
        max_builds_per_identity: None,
    }
}

pub(crate) fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        default_chunk_bytes: 24,
        poll_interval: Duration::from_millis(100),
        manifest_cache_size: 16,
        manifest_cache_ttl: Duration::from_secs(60),
    }
}

/// Little endian float32 bytes of `values`.
pub(crate) fn f32_bytes(values: impl IntoIterator<Item = f32>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[derive(Debug, Default)]
struct FlakyState {
    files: HashMap<String, Vec<u8>>,
    /// (location, offset) → (remaining failures, transient)
    failures: HashMap<(String, u64), (usize, bool)>,
    reads: HashMap<(String, u64), usize>,
}

/// In-memory [SourceReader] with scripted failures.
#[derive(Debug, Default)]
pub(crate) struct FlakyReader {
    state: Mutex<FlakyState>,
}

impl FlakyReader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, location: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(location.to_string(), data.to_vec());
    }

    /// Fails the next `times` reads at `offset`.
    pub(crate) fn fail_reads_at(&self, location: &str, offset: u64, times: usize, transient: bool) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .insert((location.to_string(), offset), (times, transient));
    }

    /// Number of reads attempted at `offset`.
    pub(crate) fn reads_at(&self, location: &str, offset: u64) -> usize {
        let state = self.state.lock().unwrap();
        state
            .reads
            .get(&(location.to_string(), offset))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceReader for FlakyReader {
    async fn size(&self, location: &Location) -> Result<u64, FetchError> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&location.to_string())
            .map(|data| data.len() as u64)
            .ok_or_else(|| FetchError::permanent(location, "No such file or directory"))
    }

    async fn read(&self, location: &Location, offset: u64, len: u64) -> Result<Bytes, FetchError> {
        let mut state = self.state.lock().unwrap();
        let key = (location.to_string(), offset);
        *state.reads.entry(key.clone()).or_default() += 1;
        if let Some((remaining, transient)) = state.failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(if *transient {
                    FetchError::transient(location, "Stale file handle")
                } else {
                    FetchError::permanent(location, "Permission denied")
                });
            }
        }
        let data = state
            .files
            .get(&location.to_string())
            .ok_or_else(|| FetchError::permanent(location, "No such file or directory"))?;
        let start = offset as usize;
        let end = (start + len as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }
}
