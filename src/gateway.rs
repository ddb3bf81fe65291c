//! Streaming gateway.
//!
//! Turns requests into builds and serves artifacts, ready or in progress, chunk by chunk. A
//! read of a chunk that a running build has not written yet waits for the build's watermark
//! to pass it, woken by store subscriptions rather than polling.

use crate::artifact::Artifact;
use crate::cache::{Lookup, MaterializationCache, StreamGuard};
use crate::chunking::{ChunkPlan, ChunkRange};
use crate::clock;
use crate::error::{FailureCause, PortalError};
use crate::fingerprint::{normalize, NormalizedRequest};
use crate::job::{BuildJob, BuildProgress, JobState};
use crate::models::MaterializationRequest;
use crate::queue::JobQueue;
use crate::store::{self, Store};

use bytes::Bytes;
use cached::{Cached, TimedSizedCache};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, SeekFrom};
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Gateway tunables.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Chunk size of requests that name none
    pub default_chunk_bytes: usize,
    /// Upper bound on the time between re-checks of a build's progress
    pub poll_interval: Duration,
    /// Number of Zarr manifests kept in memory
    pub manifest_cache_size: usize,
    /// Lifetime of a cached Zarr manifest
    pub manifest_cache_ttl: Duration,
}

/// Reply to a submitted request.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Submission {
    pub fingerprint: String,
    pub status: JobState,
    /// Number of chunks of the artifact
    pub chunks: usize,
}

/// State of a fingerprint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatusReport {
    pub fingerprint: String,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureCause>,
    pub chunks: usize,
    /// Chunks readable now
    pub chunks_available: usize,
}

/// A chunk stream and the layout of the chunks it yields.
pub struct ChunkStream<S> {
    /// Byte length of each chunk, in stream order
    pub chunk_lengths: Vec<u64>,
    pub chunks: S,
}

/// Where a chunk can be read from right now.
enum ChunkSource {
    Ready(Bytes),
    /// Not written yet by the running build
    Pending,
}

/// Reads `range` of a data file, or `None` if the file is gone.
async fn read_chunk(path: &Path, range: ChunkRange) -> Result<Option<Bytes>, PortalError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(PortalError::storage_io(path, err)),
    };
    let storage_io = |err| PortalError::storage_io(path, err);
    file.seek(SeekFrom::Start(range.offset))
        .await
        .map_err(storage_io)?;
    let mut buf = vec![0; usize::try_from(range.len)?];
    file.read_exact(&mut buf).await.map_err(storage_io)?;
    Ok(Some(buf.into()))
}

/// Position of an open chunk stream.
struct ChunkCursor {
    gateway: Gateway,
    fingerprint: String,
    next: usize,
    end: usize,
    timeout: Duration,
    guard: Option<StreamGuard>,
    done: bool,
}

#[derive(Clone)]
pub struct Gateway {
    store: Store,
    queue: JobQueue,
    cache: MaterializationCache,
    config: GatewayConfig,
    manifests: Arc<Mutex<TimedSizedCache<String, Arc<Artifact>>>>,
}

impl Gateway {
    pub fn new(queue: JobQueue, cache: MaterializationCache, config: GatewayConfig) -> Self {
        let manifests = TimedSizedCache::with_size_and_lifespan(
            config.manifest_cache_size.max(1),
            config.manifest_cache_ttl.as_secs(),
        );
        Self {
            store: queue.store().clone(),
            queue,
            cache,
            config,
            manifests: Arc::new(Mutex::new(manifests)),
        }
    }

    pub fn normalize(&self, request: &MaterializationRequest) -> Result<NormalizedRequest, PortalError> {
        normalize(request, self.config.default_chunk_bytes)
    }

    /// Submits a request, starting a build unless its artifact is ready or already being built.
    ///
    /// # Arguments
    ///
    /// * `request`: The request as submitted
    /// * `identity`: Caller identity the build is charged to
    #[tracing::instrument(level = "DEBUG", skip(self, request))]
    pub fn submit(
        &self,
        request: &MaterializationRequest,
        identity: &str,
    ) -> Result<Submission, PortalError> {
        let normalized = self.normalize(request)?;
        let fingerprint = normalized.fingerprint.clone();
        let chunks = normalized.plan.total_chunks;
        let status = match self.cache.lookup(&fingerprint)? {
            Lookup::Hit(_) => {
                self.cache.touch(&fingerprint)?;
                JobState::Ready
            }
            Lookup::InProgress(job) => job.state,
            Lookup::Miss => self.queue.enqueue(&normalized, identity)?.job().state,
        };
        tracing::debug!(%fingerprint, %status, "submitted");
        Ok(Submission {
            fingerprint,
            status,
            chunks,
        })
    }

    fn job(&self, fingerprint: &str) -> Result<Option<BuildJob>, PortalError> {
        self.queue.job(fingerprint)
    }

    fn progress(&self, fingerprint: &str) -> Result<Option<BuildProgress>, PortalError> {
        Ok(
            store::get::<BuildProgress>(&self.store.progress, fingerprint.as_bytes())?
                .map(|(_, progress)| progress),
        )
    }

    /// Chunks written so far by the current build of `job`.
    fn written(&self, job: &BuildJob) -> Result<usize, PortalError> {
        Ok(match (self.progress(job.fingerprint())?, &job.build_id) {
            (Some(progress), Some(build_id)) if &progress.build_id == build_id => progress.written,
            _ => 0,
        })
    }

    fn not_found(fingerprint: &str) -> PortalError {
        PortalError::NotFound {
            fingerprint: fingerprint.to_string(),
        }
    }

    /// Reports the state of a fingerprint.
    pub fn status(&self, fingerprint: &str) -> Result<StatusReport, PortalError> {
        if let Some(entry) = self.cache.entry(fingerprint)? {
            let chunks = entry.artifact.plan.total_chunks;
            return Ok(StatusReport {
                fingerprint: fingerprint.to_string(),
                status: JobState::Ready,
                reason: None,
                chunks,
                chunks_available: chunks,
            });
        }
        let job = self
            .job(fingerprint)?
            .ok_or_else(|| Self::not_found(fingerprint))?;
        if job.state == JobState::Ready {
            // Evicted.
            return Err(Self::not_found(fingerprint));
        }
        Ok(StatusReport {
            fingerprint: fingerprint.to_string(),
            status: job.state,
            reason: job.failure.clone(),
            chunks: job.normalized.plan.total_chunks,
            chunks_available: self.written(&job)?,
        })
    }

    /// Plan of a fingerprint that is ready or being built.
    fn plan(&self, fingerprint: &str) -> Result<ChunkPlan, PortalError> {
        Ok(self.manifest(fingerprint)?.plan.clone())
    }

    /// Describes the artifact of a fingerprint, ready or being built.
    pub fn manifest(&self, fingerprint: &str) -> Result<Arc<Artifact>, PortalError> {
        if let Some(artifact) = self
            .manifests
            .lock()
            .ok()
            .and_then(|mut manifests| manifests.cache_get(&fingerprint.to_string()).cloned())
        {
            return Ok(artifact);
        }
        match self.cache.lookup(fingerprint)? {
            Lookup::Hit(entry) => {
                // Only installed artifacts are memoised; a running build may still fail.
                let artifact = Arc::new(entry.artifact);
                if let Ok(mut manifests) = self.manifests.lock() {
                    manifests.cache_set(fingerprint.to_string(), artifact.clone());
                }
                Ok(artifact)
            }
            Lookup::InProgress(job) => Ok(Arc::new(Artifact::new(
                &job.normalized,
                job.build_id.as_deref().unwrap_or_default(),
                job.created_at,
            ))),
            Lookup::Miss => match self.job(fingerprint)? {
                Some(job) if job.state == JobState::Failed => Err(Self::build_failed(&job)),
                _ => Err(Self::not_found(fingerprint)),
            },
        }
    }

    fn build_failed(job: &BuildJob) -> PortalError {
        PortalError::BuildFailed {
            fingerprint: job.fingerprint().to_string(),
            cause: job.failure.clone().unwrap_or_else(|| {
                FailureCause::new(crate::error::FailureKind::WorkerLost, "no cause recorded")
            }),
        }
    }

    /// Returns a Zarr metadata document of a fingerprint's store.
    ///
    /// # Arguments
    ///
    /// * `fingerprint`: The fingerprint
    /// * `variable`: Array name, or `None` for group documents
    /// * `document`: `.zmetadata`, `.zgroup`, `.zattrs` or `.zarray`
    pub fn zarr_document(
        &self,
        fingerprint: &str,
        variable: Option<&str>,
        document: &str,
    ) -> Result<Value, PortalError> {
        let artifact = self.manifest(fingerprint)?;
        let unknown = || PortalError::NotFound {
            fingerprint: format!("{}/{}", fingerprint, document),
        };
        match (variable, document) {
            (None, ".zmetadata") => artifact.zmetadata(),
            (None, ".zgroup") => Ok(artifact.zgroup()),
            (None, ".zattrs") => Ok(artifact.zattrs()),
            (Some(variable), ".zarray") => artifact.zarray(variable),
            (Some(variable), ".zattrs") => artifact.array_zattrs(variable),
            _ => Err(unknown()),
        }
    }

    /// Reads one Zarr chunk, waiting up to `timeout` for a running build to write it.
    pub async fn zarr_chunk(
        &self,
        fingerprint: &str,
        variable: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Bytes, PortalError> {
        let index = self
            .plan(fingerprint)?
            .global_index(variable, key)
            .ok_or_else(|| PortalError::NotFound {
                fingerprint: format!("{}/{}/{}", fingerprint, variable, key),
            })?;
        let mut cursor = self.cursor(fingerprint, index..index + 1, timeout);
        self.next_chunk(&mut cursor).await
    }

    fn cursor(&self, fingerprint: &str, range: Range<usize>, timeout: Duration) -> ChunkCursor {
        ChunkCursor {
            gateway: self.clone(),
            fingerprint: fingerprint.to_string(),
            next: range.start,
            end: range.end,
            timeout,
            guard: None,
            done: false,
        }
    }

    /// Opens a lazy stream of a range of chunks of a fingerprint.
    ///
    /// Chunks are yielded in order. Each chunk of a running build is waited for up to
    /// `timeout`; a build failure ends the stream with the recorded cause.
    ///
    /// # Arguments
    ///
    /// * `fingerprint`: The fingerprint
    /// * `start`: First chunk, default 0
    /// * `end`: End of the range (exclusive), default the number of chunks
    /// * `timeout`: Per-chunk wait bound
    pub fn open_stream(
        &self,
        fingerprint: &str,
        start: Option<usize>,
        end: Option<usize>,
        timeout: Duration,
    ) -> Result<ChunkStream<impl Stream<Item = Result<Bytes, PortalError>> + Send + 'static>, PortalError>
    {
        let plan = self.plan(fingerprint)?;
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(plan.total_chunks);
        if end > plan.total_chunks || start > end {
            return Err(PortalError::ChunkOutOfRange {
                index: end.max(start),
                count: plan.total_chunks,
            });
        }
        let chunk_lengths = (start..end)
            .map(|index| plan.range(index).map(|range| range.len))
            .collect::<Result<_, _>>()?;
        let cursor = self.cursor(fingerprint, start..end, timeout);
        let chunks = stream::unfold(cursor, |mut cursor| async move {
            if cursor.done || cursor.next >= cursor.end {
                return None;
            }
            let gateway = cursor.gateway.clone();
            let result = gateway.next_chunk(&mut cursor).await;
            cursor.done = result.is_err();
            Some((result, cursor))
        });
        Ok(ChunkStream {
            chunk_lengths,
            chunks,
        })
    }

    /// Reads the cursor's next chunk, waiting for it if necessary.
    async fn next_chunk(&self, cursor: &mut ChunkCursor) -> Result<Bytes, PortalError> {
        let index = cursor.next;
        let deadline = clock::deadline(cursor.timeout);
        loop {
            let changed = store::changed(
                &[&self.store.jobs, &self.store.entries, &self.store.progress],
                cursor.fingerprint.as_bytes(),
            );
            if let ChunkSource::Ready(bytes) = self.try_chunk(cursor, index).await? {
                cursor.next += 1;
                return Ok(bytes);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PortalError::ChunkWaitTimeout {
                    fingerprint: cursor.fingerprint.clone(),
                    index,
                });
            }
            let recheck = deadline.min(clock::deadline(self.config.poll_interval));
            tokio::select! {
                _ = changed => (),
                _ = tokio::time::sleep_until(recheck) => (),
            }
        }
    }

    /// Reads a chunk if it is available now.
    async fn try_chunk(&self, cursor: &mut ChunkCursor, index: usize) -> Result<ChunkSource, PortalError> {
        let fingerprint = cursor.fingerprint.as_str();
        let entry = if cursor.guard.is_some() {
            self.cache.entry(fingerprint)?
        } else {
            match self.cache.acquire_stream(fingerprint) {
                Ok((entry, guard)) => {
                    cursor.guard = Some(guard);
                    Some(entry)
                }
                Err(PortalError::NotFound { .. }) => None,
                Err(err) => return Err(err),
            }
        };
        if let Some(entry) = entry {
            let artifact = &entry.artifact;
            let path = self
                .cache
                .layout()
                .artifact_data(fingerprint, &artifact.version);
            return match read_chunk(&path, artifact.plan.range(index)?).await? {
                Some(bytes) => Ok(ChunkSource::Ready(bytes)),
                // Superseded between reading the entry and opening the file.
                None => Ok(ChunkSource::Pending),
            };
        }

        let job = self
            .job(fingerprint)?
            .ok_or_else(|| Self::not_found(fingerprint))?;
        match job.state {
            JobState::Failed => Err(Self::build_failed(&job)),
            JobState::Ready => Err(Self::not_found(fingerprint)),
            JobState::Queued | JobState::Claimed | JobState::Building => {
                let Some(build_id) = job.build_id.as_deref() else {
                    return Ok(ChunkSource::Pending);
                };
                if self.written(&job)? <= index {
                    return Ok(ChunkSource::Pending);
                }
                let layout = self.cache.layout();
                let range = job.normalized.plan.range(index)?;
                if let Some(bytes) = read_chunk(&layout.staging_data(fingerprint, build_id), range).await? {
                    return Ok(ChunkSource::Ready(bytes));
                }
                // Complete builds are renamed into the artifact tree before they are installed.
                Ok(match read_chunk(&layout.artifact_data(fingerprint, build_id), range).await? {
                    Some(bytes) => ChunkSource::Ready(bytes),
                    None => ChunkSource::Pending,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CacheLayout;
    use crate::clock::ManualClock;
    use crate::error::{FailureKind, FetchError};
    use crate::fetcher::SourceBlock;
    use crate::job::Lease;
    use crate::resource_manager::ResourceManager;
    use crate::test_utils;
    use crate::writer::Writer;

    use futures::{StreamExt, TryStreamExt};

    struct Env {
        _dir: tempfile::TempDir,
        queue: JobQueue,
        cache: MaterializationCache,
        writer: Writer,
        gateway: Gateway,
    }

    fn env() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::temporary().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let layout = CacheLayout::new(dir.path());
        layout.create().unwrap();
        let queue = JobQueue::new(store.clone(), clock.clone(), test_utils::queue_config());
        let cache = MaterializationCache::new(
            store.clone(),
            layout.clone(),
            clock.clone(),
            Duration::from_secs(600),
        );
        let writer = Writer::new(
            layout,
            store,
            Arc::new(ResourceManager::new(None, None, None)),
            clock,
            false,
        );
        let gateway = Gateway::new(queue.clone(), cache.clone(), test_utils::gateway_config());
        Env {
            _dir: dir,
            queue,
            cache,
            writer,
            gateway,
        }
    }

    impl Env {
        fn start(&self) -> Lease {
            let lease = self.queue.claim("w1").unwrap().unwrap();
            self.queue.start(&lease).unwrap();
            lease
        }

        async fn build(&self, normalized: &NormalizedRequest, data: Vec<u8>) {
            let lease = self.start();
            let blocks = stream::iter(vec![Ok(SourceBlock {
                source: 0,
                offset: 0,
                data: data.into(),
                last: true,
            })]);
            let artifact = self.writer.write(&lease, normalized, blocks).await.unwrap();
            self.cache.install(&lease, artifact).unwrap();
        }
    }

    fn floats() -> Vec<u8> {
        test_utils::f32_bytes((0..12u16).map(f32::from))
    }

    #[tokio::test]
    async fn submit_then_stream_ready_artifact() {
        let env = env();
        let request = test_utils::get_test_request();
        let submission = env.gateway.submit(&request, "alice").unwrap();
        assert_eq!(JobState::Queued, submission.status);
        assert_eq!(2, submission.chunks);
        let normalized = env.gateway.normalize(&request).unwrap();
        assert_eq!(normalized.fingerprint, submission.fingerprint);

        env.build(&normalized, floats()).await;
        let again = env.gateway.submit(&request, "bob").unwrap();
        assert_eq!(JobState::Ready, again.status);

        let stream = env
            .gateway
            .open_stream(&submission.fingerprint, None, None, Duration::from_secs(1))
            .unwrap();
        assert_eq!(vec![24, 24], stream.chunk_lengths);
        let chunks: Vec<Bytes> = stream.chunks.try_collect().await.unwrap();
        assert_eq!(floats(), chunks.concat());
        // The stream released its reference when it was dropped.
        assert_eq!(
            0,
            env.cache.entry(&submission.fingerprint).unwrap().unwrap().streams
        );
    }

    #[tokio::test]
    async fn in_progress_chunks_follow_the_watermark() {
        let env = env();
        let request = test_utils::get_test_request();
        let submission = env.gateway.submit(&request, "alice").unwrap();
        let normalized = env.gateway.normalize(&request).unwrap();
        let lease = env.start();

        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<SourceBlock, PortalError>>();
        let writer = env.writer.clone();
        let build = {
            let lease = lease.clone();
            let normalized = normalized.clone();
            tokio::spawn(async move { writer.write(&lease, &normalized, rx).await })
        };

        let mut stream = env
            .gateway
            .open_stream(&submission.fingerprint, None, None, Duration::from_secs(5))
            .unwrap()
            .chunks
            .boxed();
        // Nothing is available until the first source has been written.
        let status = env.gateway.status(&submission.fingerprint).unwrap();
        assert_eq!((JobState::Building, 0), (status.status, status.chunks_available));

        tx.unbounded_send(Ok(SourceBlock {
            source: 0,
            offset: 0,
            data: floats().into(),
            last: true,
        }))
        .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&floats()[..24], &first[..]);

        let artifact = build.await.unwrap().unwrap();
        env.cache.install(&lease, artifact).unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(&floats()[24..], &second[..]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn waiting_for_a_chunk_times_out() {
        let env = env();
        let request = test_utils::get_test_request();
        let submission = env.gateway.submit(&request, "alice").unwrap();
        env.start();
        let mut stream = env
            .gateway
            .open_stream(&submission.fingerprint, Some(1), None, Duration::from_millis(50))
            .unwrap()
            .chunks
            .boxed();
        match stream.next().await.unwrap().unwrap_err() {
            PortalError::ChunkWaitTimeout { index, .. } => assert_eq!(1, index),
            err => panic!("unexpected error {}", err),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failure_ends_the_stream_with_its_cause() {
        let env = env();
        let request = test_utils::get_test_request();
        let submission = env.gateway.submit(&request, "alice").unwrap();
        let lease = env.start();
        let mut stream = env
            .gateway
            .open_stream(&submission.fingerprint, None, None, Duration::from_secs(5))
            .unwrap()
            .chunks
            .boxed();
        let cause = PortalError::from(FetchError::permanent("/a/ta_2016.nc", "Permission denied"))
            .to_cause();
        let queue = env.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue.fail(&lease, cause).unwrap();
        });
        match stream.next().await.unwrap().unwrap_err() {
            PortalError::BuildFailed { cause, .. } => assert_eq!(FailureKind::PermanentIo, cause.kind),
            err => panic!("unexpected error {}", err),
        }
        let status = env.gateway.status(&submission.fingerprint).unwrap();
        assert_eq!(JobState::Failed, status.status);
        assert_eq!(FailureKind::PermanentIo, status.reason.unwrap().kind);

        // Resubmitting starts over.
        let submission = env.gateway.submit(&request, "alice").unwrap();
        assert_eq!(JobState::Queued, submission.status);
    }

    #[tokio::test]
    async fn two_callers_read_identical_chunks() {
        let env = env();
        let request = test_utils::get_test_request();
        let first = env.gateway.submit(&request, "alice").unwrap();
        let second = env.gateway.submit(&request, "bob").unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(1, env.queue.store().queue.len());

        let open = || {
            env.gateway
                .open_stream(&first.fingerprint, None, None, Duration::from_secs(5))
                .unwrap()
                .chunks
                .try_collect::<Vec<Bytes>>()
        };
        let (a, b, ()) = tokio::join!(open(), open(), async {
            let normalized = env.gateway.normalize(&request).unwrap();
            env.build(&normalized, floats()).await;
        });
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn zarr_access() {
        let env = env();
        let request = test_utils::get_test_request();
        let submission = env.gateway.submit(&request, "alice").unwrap();
        let fingerprint = submission.fingerprint.as_str();
        // Metadata is served before the build finishes.
        let zarray = env.gateway.zarr_document(fingerprint, Some("data"), ".zarray").unwrap();
        assert_eq!(serde_json::json!([2, 3]), zarray["chunks"]);

        let normalized = env.gateway.normalize(&request).unwrap();
        env.build(&normalized, floats()).await;
        let chunk = env
            .gateway
            .zarr_chunk(fingerprint, "data", "1.0", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&floats()[24..], &chunk[..]);
        assert!(matches!(
            env.gateway
                .zarr_chunk(fingerprint, "data", "2.0", Duration::from_secs(1))
                .await
                .unwrap_err(),
            PortalError::NotFound { .. }
        ));
        assert!(matches!(
            env.gateway.zarr_document(fingerprint, None, ".zarray").unwrap_err(),
            PortalError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn unbounded_wait_timeout() {
        let env = env();
        let request = test_utils::get_test_request();
        let submission = env.gateway.submit(&request, "alice").unwrap();
        let normalized = env.gateway.normalize(&request).unwrap();
        env.build(&normalized, floats()).await;
        let chunks: Vec<Bytes> = env
            .gateway
            .open_stream(&submission.fingerprint, None, None, Duration::from_secs(u64::MAX))
            .unwrap()
            .chunks
            .try_collect()
            .await
            .unwrap();
        assert_eq!(floats(), chunks.concat());
        let chunk = env
            .gateway
            .zarr_chunk(&submission.fingerprint, "data", "0.0", Duration::MAX)
            .await
            .unwrap();
        assert_eq!(&floats()[..24], &chunk[..]);
    }

    #[tokio::test]
    async fn metadata_of_a_failed_build() {
        let env = env();
        let request = test_utils::get_test_request();
        let submission = env.gateway.submit(&request, "alice").unwrap();
        let fingerprint = submission.fingerprint.as_str();
        env.gateway.zarr_document(fingerprint, None, ".zmetadata").unwrap();

        let lease = env.start();
        env.queue
            .fail(&lease, FailureCause::new(FailureKind::PermanentIo, "gone"))
            .unwrap();
        match env.gateway.zarr_document(fingerprint, None, ".zmetadata").unwrap_err() {
            PortalError::BuildFailed { cause, .. } => assert_eq!(FailureKind::PermanentIo, cause.kind),
            err => panic!("unexpected error {}", err),
        }
        assert!(matches!(
            env.gateway.manifest(fingerprint).unwrap_err(),
            PortalError::BuildFailed { .. }
        ));
    }

    #[test]
    fn unknown_fingerprint() {
        let env = env();
        assert!(matches!(
            env.gateway.status("00000000-0000-0000-0000-000000000000").unwrap_err(),
            PortalError::NotFound { .. }
        ));
        assert!(matches!(
            env.gateway
                .open_stream("00000000-0000-0000-0000-000000000000", None, None, Duration::ZERO)
                .err()
                .unwrap(),
            PortalError::NotFound { .. }
        ));
    }

    #[test]
    fn range_is_checked() {
        let env = env();
        let submission = env
            .gateway
            .submit(&test_utils::get_test_request(), "alice")
            .unwrap();
        assert!(matches!(
            env.gateway
                .open_stream(&submission.fingerprint, Some(1), Some(3), Duration::ZERO)
                .err()
                .unwrap(),
            PortalError::ChunkOutOfRange { index: 3, count: 2 }
        ));
    }
}
