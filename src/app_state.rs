use crate::artifact::CacheLayout;
use crate::cache::MaterializationCache;
use crate::cli::CommandLineArgs;
use crate::clock::{SharedClock, SystemClock};
use crate::error::PortalError;
use crate::fetcher::{FetchConfig, Fetcher, LocationReader, ReaderConfig};
use crate::gateway::{Gateway, GatewayConfig};
use crate::posix::TapeArchive;
use crate::queue::{JobQueue, QueueConfig};
use crate::resource_manager::ResourceManager;
use crate::s3_client::S3Credentials;
use crate::store::Store;
use crate::worker::{Sweeper, Worker, WorkerConfig, WorkerPool};
use crate::writer::Writer;

use expanduser::expanduser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Expands `~` in a configured path.
fn expand(path: &str) -> Result<PathBuf, PortalError> {
    expanduser(path).map_err(|err| PortalError::storage_io(path, err))
}

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Streaming gateway.
    pub gateway: Gateway,

    queue: JobQueue,
    cache: MaterializationCache,
    fetcher: Fetcher,
    writer: Writer,
}

impl AppState {
    /// Opens the store and cache directory and wires up every component.
    ///
    /// Stream counts left behind by a previous process are reset, since none of its streams
    /// survived it.
    pub fn new(args: &CommandLineArgs) -> Result<Self, PortalError> {
        let clock: SharedClock = Arc::new(SystemClock);
        let store = Store::open(&expand(&args.store_path)?)?;
        let layout = CacheLayout::new(expand(&args.cache_dir)?);
        layout.create()?;

        let task_limit = args
            .thread_limit
            .or_else(|| Some(num_cpus::get().saturating_sub(1).max(1)));
        let resource_manager = Arc::new(ResourceManager::new(
            args.connection_limit,
            args.memory_limit,
            task_limit,
        ));

        let tape = match (&args.tape_online_root, &args.tape_request_dir) {
            (Some(online_root), Some(request_dir)) => Some(TapeArchive {
                online_root: expand(online_root)?,
                request_dir: expand(request_dir)?,
            }),
            _ => None,
        };
        let s3_credentials = match (&args.s3_access_key, &args.s3_secret_key) {
            (Some(access_key), Some(secret_key)) => {
                Some(S3Credentials::access_key(access_key, secret_key))
            }
            _ => None,
        };
        let reader = LocationReader::new(ReaderConfig {
            tape,
            s3_endpoint: args.s3_endpoint.clone(),
            s3_credentials,
            http_timeout: Duration::from_secs(args.http_timeout),
        });
        let fetcher = Fetcher::new(
            Arc::new(reader),
            resource_manager.clone(),
            FetchConfig {
                max_attempts: args.fetch_attempts.max(1),
                backoff_base: Duration::from_millis(args.fetch_backoff_base),
                backoff_max: Duration::from_millis(args.fetch_backoff_max),
                block_size: args.fetch_block_size.max(1),
            },
        );

        let queue = JobQueue::new(
            store.clone(),
            clock.clone(),
            QueueConfig {
                lease_timeout: Duration::from_secs(args.lease_timeout),
                max_attempts: args.max_attempts.max(1),
                build_timeout: Duration::from_secs(args.build_timeout),
                job_ttl: Duration::from_secs(args.job_ttl),
                max_builds_per_identity: args.max_builds_per_identity,
            },
        );
        let cache = MaterializationCache::new(
            store.clone(),
            layout.clone(),
            clock.clone(),
            Duration::from_secs(args.cache_ttl),
        );
        let reset = cache.reset_stream_counts()?;
        if reset > 0 {
            tracing::info!(entries = reset, "reset stale stream counts");
        }
        let writer = Writer::new(layout, store, resource_manager, clock, args.use_rayon);
        let gateway = Gateway::new(
            queue.clone(),
            cache.clone(),
            GatewayConfig {
                default_chunk_bytes: args.default_chunk_size.max(1),
                poll_interval: args.poll_interval(),
                manifest_cache_size: args.manifest_cache_size,
                manifest_cache_ttl: Duration::from_secs(60),
            },
        );

        Ok(Self {
            args: args.clone(),
            gateway,
            queue,
            cache,
            fetcher,
            writer,
        })
    }

    /// Spawns the build workers and the sweeper.
    pub fn start_workers(&self) -> WorkerPool {
        let config = WorkerConfig {
            heartbeat_interval: Duration::from_secs(self.args.heartbeat_interval.max(1)),
            poll_interval: self.args.poll_interval(),
        };
        let workers = (0..self.args.worker_count())
            .map(|i| {
                Worker::new(
                    format!("worker-{i}"),
                    self.queue.clone(),
                    self.cache.clone(),
                    self.fetcher.clone(),
                    self.writer.clone(),
                    config.clone(),
                )
            })
            .collect();
        let sweeper = Sweeper::new(
            self.queue.clone(),
            self.cache.clone(),
            Duration::from_secs(self.args.sweep_interval.max(1)),
        );
        tracing::info!(workers = self.args.worker_count(), "starting build workers");
        WorkerPool::start(workers, sweeper)
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
