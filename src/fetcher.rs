//! Remote data fetcher.
//!
//! [Fetcher::fetch] turns a list of locations into a lazy stream of [SourceBlock]s, reading
//! each source in fixed-size blocks. A transient failure is retried with exponential backoff
//! from the last confirmed offset, so a blip late in a large file does not restart the file.

use crate::error::{FetchError, PortalError};
use crate::fingerprint::Location;
use crate::http_client::HttpClient;
use crate::metrics::FETCH_RETRIES;
use crate::posix::{self, TapeArchive};
use crate::resource_manager::ResourceManager;
use crate::s3_client::{S3ClientMap, S3Credentials};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A block of one source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceBlock {
    /// Index of the source in the request
    pub source: usize,
    /// Offset of the block within the source
    pub offset: u64,
    pub data: Bytes,
    /// Whether this is the source's final block
    pub last: bool,
}

/// Sized, ranged reads of one kind of location.
#[async_trait]
pub trait SourceReader: Send + Sync + std::fmt::Debug {
    /// Returns the size of the source in bytes.
    async fn size(&self, location: &Location) -> Result<u64, FetchError>;

    /// Reads `len` bytes starting at `offset`.
    async fn read(&self, location: &Location, offset: u64, len: u64) -> Result<Bytes, FetchError>;
}

/// Reader settings for every location scheme.
#[derive(Clone, Debug, Default)]
pub struct ReaderConfig {
    /// Tape archive, if tape locations are served
    pub tape: Option<TapeArchive>,
    /// Endpoint of `s3://` locations
    pub s3_endpoint: Option<Url>,
    pub s3_credentials: Option<S3Credentials>,
    /// Timeout of a single HTTP request
    pub http_timeout: Duration,
}

/// Dispatches reads on the location scheme.
#[derive(Debug)]
pub struct LocationReader {
    config: ReaderConfig,
    http: HttpClient,
    s3_clients: S3ClientMap,
}

impl LocationReader {
    pub fn new(config: ReaderConfig) -> Self {
        Self {
            http: HttpClient::new(config.http_timeout),
            s3_clients: S3ClientMap::new(),
            config,
        }
    }

    /// Maps tape locations to their online copy.
    async fn local_path(&self, location: &Location) -> Result<Option<std::path::PathBuf>, FetchError> {
        match location {
            Location::Posix(path) => Ok(Some(path.clone())),
            Location::Tape(path) => match &self.config.tape {
                Some(tape) => Ok(Some(tape.resolve(&location.to_string(), path).await?)),
                None => Err(FetchError::permanent(location, "tape archive not configured")),
            },
            _ => Ok(None),
        }
    }

    async fn s3_client(&self, location: &Location, endpoint: &Option<Url>) -> Result<crate::s3_client::S3Client, FetchError> {
        let endpoint = endpoint
            .as_ref()
            .or(self.config.s3_endpoint.as_ref())
            .ok_or_else(|| FetchError::permanent(location, "no default S3 endpoint configured"))?;
        let credentials = self
            .config
            .s3_credentials
            .clone()
            .unwrap_or(S3Credentials::None);
        Ok(self.s3_clients.get(endpoint, credentials).await)
    }
}

#[async_trait]
impl SourceReader for LocationReader {
    async fn size(&self, location: &Location) -> Result<u64, FetchError> {
        let rendered = location.to_string();
        if let Some(path) = self.local_path(location).await? {
            return posix::file_size(&rendered, &path).await;
        }
        match location {
            Location::Http(url) => self.http.object_size(url).await,
            Location::S3 {
                endpoint,
                bucket,
                key,
            } => {
                let client = self.s3_client(location, endpoint).await?;
                client.object_size(&rendered, bucket, key).await
            }
            _ => Err(FetchError::permanent(location, "unsupported location")),
        }
    }

    async fn read(&self, location: &Location, offset: u64, len: u64) -> Result<Bytes, FetchError> {
        let rendered = location.to_string();
        if let Some(path) = self.local_path(location).await? {
            return posix::read_range(&rendered, &path, offset, len).await;
        }
        match location {
            Location::Http(url) => self.http.download_range(url, offset, len).await,
            Location::S3 {
                endpoint,
                bucket,
                key,
            } => {
                let client = self.s3_client(location, endpoint).await?;
                client
                    .download_range(&rendered, bucket, key, offset, len)
                    .await
            }
            _ => Err(FetchError::permanent(location, "unsupported location")),
        }
    }
}

/// Retry settings of the fetcher.
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Attempts per read before a transient error becomes final
    pub max_attempts: u32,
    /// Delay before the first retry, doubled for each further retry
    pub backoff_base: Duration,
    /// Maximum delay between retries
    pub backoff_max: Duration,
    /// Size of the blocks read from a source
    pub block_size: u64,
}

impl FetchConfig {
    /// Delay after the `attempt`th consecutive failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Reads sources with retry and backoff.
#[derive(Clone, Debug)]
pub struct Fetcher {
    reader: Arc<dyn SourceReader>,
    resource_manager: Arc<ResourceManager>,
    config: FetchConfig,
}

/// Position of a fetch stream.
struct Cursor {
    fetcher: Fetcher,
    locations: Vec<Location>,
    source: usize,
    offset: u64,
    size: Option<u64>,
    failed: bool,
}

impl Fetcher {
    pub fn new(
        reader: Arc<dyn SourceReader>,
        resource_manager: Arc<ResourceManager>,
        config: FetchConfig,
    ) -> Self {
        Self {
            reader,
            resource_manager,
            config,
        }
    }

    /// Runs `op` until it succeeds, fails permanently or runs out of attempts.
    async fn with_retry<T, F, Fut>(&self, location: &Location, what: &str, op: F) -> Result<T, PortalError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            let remote = matches!(location, Location::Http(_) | Location::S3 { .. });
            let permit = if remote {
                self.resource_manager.remote_connection().await?
            } else {
                None
            };
            let result = op().await;
            drop(permit);
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(
                        %location,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        ?delay,
                        "{} failed, retrying: {}",
                        what,
                        err
                    );
                    FETCH_RETRIES.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!(%location, attempt, "{} failed: {}", what, err);
                    return Err(err.into());
                }
            }
        }
    }

    /// Reads the next block of the cursor's current source.
    async fn next_block(&self, cursor: &mut Cursor) -> Result<SourceBlock, PortalError> {
        let location = cursor.locations[cursor.source].clone();
        let location = &location;
        let size = match cursor.size {
            Some(size) => size,
            None => {
                let size = self
                    .with_retry(location, "size", || self.reader.size(location))
                    .await?;
                cursor.size = Some(size);
                size
            }
        };
        let offset = cursor.offset;
        let len = self.config.block_size.max(1).min(size - offset);
        let data = if len == 0 {
            Bytes::new()
        } else {
            self.with_retry(location, "read", || self.reader.read(location, offset, len))
                .await?
        };
        if data.len() as u64 != len {
            return Err(FetchError::transient(
                location,
                format!("short read at {}: {} of {} bytes", offset, data.len(), len),
            )
            .into());
        }
        let block = SourceBlock {
            source: cursor.source,
            offset,
            data,
            last: offset + len == size,
        };
        if block.last {
            cursor.source += 1;
            cursor.offset = 0;
            cursor.size = None;
        } else {
            cursor.offset += len;
        }
        Ok(block)
    }

    /// Returns a lazy stream of the blocks of `locations`, in order.
    ///
    /// The stream ends after the first error.
    pub fn fetch(
        &self,
        locations: Vec<Location>,
    ) -> impl Stream<Item = Result<SourceBlock, PortalError>> + Send + 'static {
        let cursor = Cursor {
            fetcher: self.clone(),
            locations,
            source: 0,
            offset: 0,
            size: None,
            failed: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            if cursor.failed || cursor.source >= cursor.locations.len() {
                return None;
            }
            let fetcher = cursor.fetcher.clone();
            let result = fetcher.next_block(&mut cursor).await;
            cursor.failed = result.is_err();
            Some((result, cursor))
        })
    }
}
