//! Command Line Interface (CLI) arguments.

use byte_unit::Byte;
use clap::Parser;
use std::time::Duration;
use url::Url;

/// Parses a human readable size such as `4MiB` into bytes.
fn parse_size(value: &str) -> Result<u64, String> {
    Byte::parse_str(value, /* ignore case */ true)
        .map(|byte| byte.as_u64())
        .map_err(|err| format!("invalid size {:?}: {}", value, err))
}

fn parse_size_usize(value: &str) -> Result<usize, String> {
    let bytes = parse_size(value)?;
    usize::try_from(bytes).map_err(|_| format!("size {:?} is too large", value))
}

/// Data portal command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the portal should listen
    #[arg(long, default_value = "0.0.0.0", env = "DATA_PORTAL_HOST")]
    pub host: String,
    /// The port to which the portal should bind
    #[arg(long, default_value_t = 8080, env = "DATA_PORTAL_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "DATA_PORTAL_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/data-portal/certs/cert.pem",
        env = "DATA_PORTAL_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/data-portal/certs/key.pem",
        env = "DATA_PORTAL_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "DATA_PORTAL_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "DATA_PORTAL_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for execution of CPU-bound tasks.
    #[arg(long, default_value_t = false, env = "DATA_PORTAL_USE_RAYON")]
    pub use_rayon: bool,
    /// Directory of the job and cache database
    #[arg(
        long,
        default_value = "~/.local/share/data-portal/store",
        env = "DATA_PORTAL_STORE_PATH"
    )]
    pub store_path: String,
    /// Directory holding staged builds and materialized artifacts
    #[arg(
        long,
        default_value = "~/.cache/data-portal",
        env = "DATA_PORTAL_CACHE_DIR"
    )]
    pub cache_dir: String,
    /// Number of build workers. Defaults to one less than the number of CPUs.
    #[arg(long, env = "DATA_PORTAL_WORKERS")]
    pub workers: Option<usize>,
    /// Time in seconds an unused artifact is kept
    #[arg(long, default_value_t = 86400, env = "DATA_PORTAL_CACHE_TTL")]
    pub cache_ttl: u64,
    /// Time in seconds between maintenance sweeps
    #[arg(long, default_value_t = 30, env = "DATA_PORTAL_SWEEP_INTERVAL")]
    pub sweep_interval: u64,
    /// Time in seconds a build lease stays valid without a heartbeat
    #[arg(long, default_value_t = 60, env = "DATA_PORTAL_LEASE_TIMEOUT")]
    pub lease_timeout: u64,
    /// Time in seconds between lease renewals of a running build
    #[arg(long, default_value_t = 10, env = "DATA_PORTAL_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval: u64,
    /// Claims of a job before an expired lease fails it
    #[arg(long, default_value_t = 3, env = "DATA_PORTAL_MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Wall-clock ceiling of a build in seconds
    #[arg(long, default_value_t = 3600, env = "DATA_PORTAL_BUILD_TIMEOUT")]
    pub build_timeout: u64,
    /// Time in seconds finished job records are kept
    #[arg(long, default_value_t = 86400, env = "DATA_PORTAL_JOB_TTL")]
    pub job_ttl: u64,
    /// Attempts per source read before a transient error fails the build
    #[arg(long, default_value_t = 5, env = "DATA_PORTAL_FETCH_ATTEMPTS")]
    pub fetch_attempts: u32,
    /// Delay in milliseconds before the first fetch retry
    #[arg(long, default_value_t = 500, env = "DATA_PORTAL_FETCH_BACKOFF_BASE")]
    pub fetch_backoff_base: u64,
    /// Maximum delay in milliseconds between fetch retries
    #[arg(long, default_value_t = 30000, env = "DATA_PORTAL_FETCH_BACKOFF_MAX")]
    pub fetch_backoff_max: u64,
    /// Size of the blocks read from sources, e.g. 8MiB
    #[arg(long, default_value = "8MiB", value_parser = parse_size, env = "DATA_PORTAL_FETCH_BLOCK_SIZE")]
    pub fetch_block_size: u64,
    /// Timeout in seconds of a single HTTP request to a source
    #[arg(long, default_value_t = 300, env = "DATA_PORTAL_HTTP_TIMEOUT")]
    pub http_timeout: u64,
    /// Chunk size of requests that do not name one, e.g. 4MiB
    #[arg(long, default_value = "4MiB", value_parser = parse_size_usize, env = "DATA_PORTAL_DEFAULT_CHUNK_SIZE")]
    pub default_chunk_size: usize,
    /// Memory limit for source data held by builds, e.g. 1GiB
    #[arg(long, value_parser = parse_size_usize, env = "DATA_PORTAL_MEMORY_LIMIT")]
    pub memory_limit: Option<usize>,
    /// Maximum number of simultaneous connections to HTTP and S3 sources
    #[arg(long, env = "DATA_PORTAL_CONNECTION_LIMIT")]
    pub connection_limit: Option<usize>,
    /// Maximum number of CPU-bound tasks. Defaults to one less than the number of CPUs.
    #[arg(long, env = "DATA_PORTAL_THREAD_LIMIT")]
    pub thread_limit: Option<usize>,
    /// Concurrent builds allowed per caller identity
    #[arg(long, env = "DATA_PORTAL_MAX_BUILDS_PER_IDENTITY")]
    pub max_builds_per_identity: Option<usize>,
    /// Directory where the tape archive exposes recalled files
    #[arg(long, env = "DATA_PORTAL_TAPE_ONLINE_ROOT")]
    pub tape_online_root: Option<String>,
    /// Directory into which tape recall requests are dropped
    #[arg(long, env = "DATA_PORTAL_TAPE_REQUEST_DIR")]
    pub tape_request_dir: Option<String>,
    /// Endpoint of `s3://` sources
    #[arg(long, env = "DATA_PORTAL_S3_ENDPOINT")]
    pub s3_endpoint: Option<Url>,
    /// Access key of `s3://` sources
    #[arg(long, env = "DATA_PORTAL_S3_ACCESS_KEY")]
    pub s3_access_key: Option<String>,
    /// Secret key of `s3://` sources
    #[arg(long, env = "DATA_PORTAL_S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,
    /// Upper bound in milliseconds on the time between state re-checks of waiting readers and
    /// idle workers
    #[arg(long, default_value_t = 1000, env = "DATA_PORTAL_POLL_INTERVAL")]
    pub poll_interval: u64,
    /// Default time in seconds a chunk read waits for a running build
    #[arg(long, default_value_t = 60, env = "DATA_PORTAL_CHUNK_WAIT_TIMEOUT")]
    pub chunk_wait_timeout: u64,
    /// Upper bound in seconds on the wait timeout a chunk read may ask for
    #[arg(long, default_value_t = 3600, env = "DATA_PORTAL_MAX_CHUNK_WAIT_TIMEOUT")]
    pub max_chunk_wait_timeout: u64,
    /// Number of Zarr manifests kept in memory
    #[arg(long, default_value_t = 1024, env = "DATA_PORTAL_MANIFEST_CACHE_SIZE")]
    pub manifest_cache_size: usize,
}

impl CommandLineArgs {
    /// Number of build workers to run.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CommandLineArgs::parse_from(["data-portal"]);
        assert_eq!(8080, args.port);
        assert_eq!(8 * 1024 * 1024, args.fetch_block_size);
        assert_eq!(4 * 1024 * 1024, args.default_chunk_size);
        assert_eq!(None, args.memory_limit);
        assert!(args.worker_count() >= 1);
    }

    #[test]
    fn human_sizes() {
        let args = CommandLineArgs::parse_from([
            "data-portal",
            "--memory-limit",
            "1GiB",
            "--default-chunk-size",
            "24",
            "--workers",
            "0",
        ]);
        assert_eq!(Some(1 << 30), args.memory_limit);
        assert_eq!(24, args.default_chunk_size);
        assert_eq!(1, args.worker_count());
    }

    #[test]
    fn invalid_size() {
        assert!(CommandLineArgs::try_parse_from(["data-portal", "--memory-limit", "lots"]).is_err());
    }
}
