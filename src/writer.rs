//! Chunked store writer.
//!
//! A build appends the chunks of its artifact, in plan order, to a data file in a staging
//! directory private to the build. After each chunk the build's availability watermark is
//! advanced in the store, fenced by the build's lease, so readers can stream chunks while the
//! build is still running. Only a complete data file is renamed into the artifact tree; any
//! failure removes the staging directory.

use crate::artifact::{Artifact, CacheLayout};
use crate::array;
use crate::chunking::{self, VariablePlan};
use crate::clock::SharedClock;
use crate::compression;
use crate::error::{FetchError, PortalError};
use crate::fetcher::SourceBlock;
use crate::fingerprint::NormalizedRequest;
use crate::job::{BuildJob, BuildProgress, Lease};
use crate::metrics::CHUNKS_WRITTEN;
use crate::models::MaterializationRequest;
use crate::resource_manager::ResourceManager;
use crate::store::{tx_decode, tx_encode, Store};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sled::transaction::abort;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Packs selected rows into fixed-size chunks of one variable.
struct ChunkPacker {
    chunk_len: usize,
    buffer: Vec<u8>,
}

impl ChunkPacker {
    fn new(variable: &VariablePlan) -> Result<Self, PortalError> {
        let chunk_len = usize::try_from(variable.chunk_len)?;
        Ok(Self {
            chunk_len,
            buffer: Vec::with_capacity(chunk_len),
        })
    }

    /// Adds rows, returning every chunk they complete.
    fn push(&mut self, mut rows: &[u8]) -> Vec<Vec<u8>> {
        let mut chunks = vec![];
        while !rows.is_empty() {
            let take = (self.chunk_len - self.buffer.len()).min(rows.len());
            self.buffer.extend_from_slice(&rows[..take]);
            rows = &rows[take..];
            if self.buffer.len() == self.chunk_len {
                chunks.push(std::mem::replace(
                    &mut self.buffer,
                    Vec::with_capacity(self.chunk_len),
                ));
            }
        }
        chunks
    }

    /// Zero-pads and returns the final, partial chunk, if any.
    fn finish(mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        self.buffer.resize(self.chunk_len, 0);
        Some(self.buffer)
    }
}

/// Decompresses a whole source, checks its size and applies the selection.
fn prepare_source(
    request: &MaterializationRequest,
    location: &str,
    raw: Bytes,
) -> Result<Vec<u8>, PortalError> {
    let data = match request.compression {
        Some(compression) => compression::decompress(compression, location, &raw)?,
        None => raw,
    };
    let element_size = request.dtype.size_of();
    let expected = chunking::byte_len(&request.shape, element_size)?;
    if data.len() != expected {
        return Err(PortalError::SourceSizeMismatch {
            location: location.to_string(),
            expected,
            actual: data.len(),
        });
    }
    array::select_bytes(&data, &request.shape, element_size, &request.subset.selection)
}

/// Removes a directory tree, treating a missing directory as removed.
pub(crate) async fn remove_dir(path: &Path) -> Result<(), PortalError> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(PortalError::storage_io(path, err)),
        _ => Ok(()),
    }
}

/// Writes builds into the cache directory.
#[derive(Clone, Debug)]
pub struct Writer {
    layout: CacheLayout,
    store: Store,
    resource_manager: Arc<ResourceManager>,
    clock: SharedClock,
    use_rayon: bool,
}

impl Writer {
    pub fn new(
        layout: CacheLayout,
        store: Store,
        resource_manager: Arc<ResourceManager>,
        clock: SharedClock,
        use_rayon: bool,
    ) -> Self {
        Self {
            layout,
            store,
            resource_manager,
            clock,
            use_rayon,
        }
    }

    /// Writes the artifact of a held build from the blocks of its sources.
    ///
    /// # Arguments
    ///
    /// * `lease`: Lease on the build
    /// * `normalized`: The normalized request being built
    /// * `blocks`: Blocks of every source, in canonical source order
    #[tracing::instrument(
        level = "DEBUG",
        skip(self, lease, normalized, blocks),
        fields(fingerprint = %lease.fingerprint, build_id = %lease.build_id)
    )]
    pub async fn write<S>(
        &self,
        lease: &Lease,
        normalized: &NormalizedRequest,
        blocks: S,
    ) -> Result<Artifact, PortalError>
    where
        S: Stream<Item = Result<SourceBlock, PortalError>> + Send,
    {
        let staging = self.layout.staging_dir(&lease.fingerprint, &lease.build_id);
        match self.write_staged(lease, normalized, blocks, &staging).await {
            Ok(artifact) => Ok(artifact),
            Err(err) => {
                if let Err(cleanup) = remove_dir(&staging).await {
                    tracing::error!("failed to remove staging directory: {}", cleanup);
                }
                Err(err)
            }
        }
    }

    async fn write_staged<S>(
        &self,
        lease: &Lease,
        normalized: &NormalizedRequest,
        blocks: S,
        staging: &Path,
    ) -> Result<Artifact, PortalError>
    where
        S: Stream<Item = Result<SourceBlock, PortalError>> + Send,
    {
        let mut blocks = std::pin::pin!(blocks);
        let plan = &normalized.plan;
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|err| PortalError::storage_io(staging, err))?;
        let path = self.layout.staging_data(&lease.fingerprint, &lease.build_id);
        let mut file = File::create(&path)
            .await
            .map_err(|err| PortalError::storage_io(&path, err))?;
        let mut written = 0;
        self.advance(lease, written)?;

        for variable in &plan.variables {
            let mut packer = ChunkPacker::new(variable)?;
            for &source in &variable.sources {
                let rows = self
                    .load_source(&normalized.request, source, &mut blocks)
                    .await?;
                for chunk in packer.push(&rows) {
                    self.append(lease, &mut file, &path, &chunk, &mut written)
                        .await?;
                }
            }
            if let Some(chunk) = packer.finish() {
                self.append(lease, &mut file, &path, &chunk, &mut written)
                    .await?;
            }
        }
        if written != plan.total_chunks {
            return Err(PortalError::invalid(format!(
                "build produced {} of {} chunks",
                written, plan.total_chunks
            )));
        }
        file.sync_all()
            .await
            .map_err(|err| PortalError::storage_io(&path, err))?;
        drop(file);

        let target = self
            .layout
            .artifact_dir(&lease.fingerprint, &lease.build_id);
        let parent = self.layout.fingerprint_dir(&lease.fingerprint);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|err| PortalError::storage_io(&parent, err))?;
        tokio::fs::rename(staging, &target)
            .await
            .map_err(|err| PortalError::storage_io(&target, err))?;
        // Leaves the fingerprint's staging directory in place if other builds still use it.
        if let Some(staging_parent) = staging.parent() {
            let _ = tokio::fs::remove_dir(staging_parent).await;
        }
        tracing::info!(chunks = written, bytes = plan.total_bytes, "wrote artifact");
        Ok(Artifact::new(
            normalized,
            &lease.build_id,
            self.clock.now_millis(),
        ))
    }

    /// Gathers one whole source from the block stream and turns it into selected rows.
    async fn load_source<S>(
        &self,
        request: &MaterializationRequest,
        source: usize,
        blocks: &mut S,
    ) -> Result<Vec<u8>, PortalError>
    where
        S: Stream<Item = Result<SourceBlock, PortalError>> + Unpin,
    {
        let location = &request.sources[source];
        let expected = chunking::byte_len(&request.shape, request.dtype.size_of())?;
        let _memory = self.resource_manager.memory(expected).await?;

        let mut raw = Vec::with_capacity(expected);
        loop {
            let block = blocks.next().await.ok_or_else(|| {
                FetchError::transient(location, "source stream ended early")
            })??;
            if block.source != source || block.offset != raw.len() as u64 {
                return Err(FetchError::transient(
                    location,
                    format!("unexpected block {}@{}", block.source, block.offset),
                )
                .into());
            }
            raw.extend_from_slice(&block.data);
            if block.last {
                break;
            }
        }

        let _task = self.resource_manager.task().await?;
        let request = request.clone();
        let location = location.clone();
        let work = move || prepare_source(&request, &location, raw.into());
        if self.use_rayon {
            tokio_rayon::spawn(work).await
        } else {
            tokio::task::spawn_blocking(work).await?
        }
    }

    /// Appends a chunk and advances the watermark past it.
    async fn append(
        &self,
        lease: &Lease,
        file: &mut File,
        path: &Path,
        chunk: &[u8],
        written: &mut usize,
    ) -> Result<(), PortalError> {
        file.write_all(chunk)
            .await
            .map_err(|err| PortalError::storage_io(path, err))?;
        file.flush()
            .await
            .map_err(|err| PortalError::storage_io(path, err))?;
        self.advance(lease, *written + 1)?;
        *written += 1;
        CHUNKS_WRITTEN.inc();
        Ok(())
    }

    /// Sets the build's watermark to `written` chunks.
    ///
    /// Fails with [PortalError::LeaseLost] unless the lease still holds the job and the
    /// watermark belongs to this build and only moves forward.
    fn advance(&self, lease: &Lease, written: usize) -> Result<(), PortalError> {
        let key = lease.fingerprint.as_bytes();
        let lost = || PortalError::LeaseLost {
            fingerprint: lease.fingerprint.clone(),
        };
        self.store.transaction(|tx| {
            let held = match tx.jobs.get(key)? {
                Some(bytes) => tx_decode::<BuildJob>(&bytes)?.is_held_by(lease),
                None => false,
            };
            if !held {
                return abort(lost());
            }
            if let Some(bytes) = tx.progress.get(key)? {
                let current: BuildProgress = tx_decode(&bytes)?;
                if current.build_id != lease.build_id || current.written > written {
                    return abort(lost());
                }
            }
            let progress = BuildProgress {
                build_id: lease.build_id.clone(),
                written,
            };
            tx.progress.insert(key, tx_encode(&progress)?)?;
            Ok(())
        })
    }
}
