//! Build workers and the periodic sweeper.
//!
//! Each [Worker] claims one job at a time, streams its sources through the [Fetcher] into the
//! [Writer] while heartbeating its lease, and installs the result. The [Sweeper] reclaims
//! expired leases, times out overlong builds and evicts idle artifacts.

use crate::cache::{CacheSweep, MaterializationCache};
use crate::error::PortalError;
use crate::fetcher::Fetcher;
use crate::job::Lease;
use crate::metrics::ACTIVE_BUILDS;
use crate::queue::{JobQueue, QueueSweep};
use crate::store;
use crate::writer::Writer;

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Worker tunables.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Time between lease renewals, well below the lease timeout
    pub heartbeat_interval: Duration,
    /// Upper bound on idle time between claim attempts, and between store health checks
    pub poll_interval: Duration,
}

/// A build worker.
#[derive(Clone, Debug)]
pub struct Worker {
    id: String,
    queue: JobQueue,
    cache: MaterializationCache,
    fetcher: Fetcher,
    writer: Writer,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: JobQueue,
        cache: MaterializationCache,
        fetcher: Fetcher,
        writer: Writer,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            cache,
            fetcher,
            writer,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claims and builds jobs until `shutdown` turns true.
    ///
    /// After an error that makes the store unusable the worker stops claiming until the store
    /// answers a health check again.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.id, "worker started");
        while !*shutdown.borrow() {
            // Subscribe before claiming so that a job queued in between wakes us.
            let queued = store::changed(&[&self.queue.store().queue], b"");
            let idle = match self.run_once().await {
                Ok(claimed) => !claimed,
                Err(err) if err.is_worker_fatal() => {
                    tracing::error!(worker = %self.id, "store unavailable, pausing: {}", err);
                    self.wait_for_store(&mut shutdown).await;
                    false
                }
                Err(err) => {
                    tracing::error!(worker = %self.id, "worker error: {}", err);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = queued => (),
                    _ = tokio::time::sleep(self.config.poll_interval) => (),
                    // A dropped pool stops its workers too.
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
            }
        }
        tracing::info!(worker = %self.id, "worker stopped");
    }

    /// Waits until the store accepts writes again, or shutdown.
    async fn wait_for_store(&self, shutdown: &mut watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => (),
                _ = shutdown.changed() => return,
            }
            match self.queue.store().ping() {
                Ok(()) => {
                    tracing::info!(worker = %self.id, "store available, resuming");
                    return;
                }
                Err(err) => tracing::warn!(worker = %self.id, "store health check failed: {}", err),
            }
        }
    }

    /// Claims and builds one job. Returns whether a job was claimed.
    ///
    /// Build failures are recorded against the job and are not errors of the worker; only
    /// worker-fatal errors are returned.
    pub async fn run_once(&self) -> Result<bool, PortalError> {
        let Some(lease) = self.queue.claim(&self.id)? else {
            return Ok(false);
        };
        ACTIVE_BUILDS.inc();
        let result = self.build(&lease).await;
        ACTIVE_BUILDS.dec();
        match result {
            Ok(()) => Ok(true),
            Err(err @ PortalError::LeaseLost { .. }) => {
                tracing::warn!(worker = %self.id, "abandoning build: {}", err);
                Ok(true)
            }
            Err(err) if err.is_worker_fatal() => {
                // Left for lease reclaim if the store cannot take the release either.
                if let Err(release) = self.queue.release(&lease) {
                    tracing::warn!(worker = %self.id, "failed to release build: {}", release);
                }
                Err(err)
            }
            Err(err) => {
                let cause = err.to_cause();
                tracing::warn!(worker = %self.id, fingerprint = %lease.fingerprint, "build failed: {}", cause);
                match self.queue.fail(&lease, cause) {
                    Ok(()) => Ok(true),
                    Err(err @ PortalError::LeaseLost { .. }) => {
                        tracing::warn!(worker = %self.id, "{}", err);
                        Ok(true)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    #[tracing::instrument(
        level = "DEBUG",
        skip(self, lease),
        fields(worker = %self.id, fingerprint = %lease.fingerprint, attempt = lease.attempt)
    )]
    async fn build(&self, lease: &Lease) -> Result<(), PortalError> {
        let job = self.queue.start(lease)?;
        let normalized = job.normalized;
        let blocks = self.fetcher.fetch(normalized.locations()?);
        let artifact = tokio::select! {
            artifact = self.writer.write(lease, &normalized, blocks) => artifact?,
            err = self.heartbeat(lease) => return Err(err),
        };
        self.cache.install(lease, artifact)?;
        Ok(())
    }

    /// Renews the lease until renewal fails, returning the failure.
    async fn heartbeat(&self, lease: &Lease) -> PortalError {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            if let Err(err) = self.queue.heartbeat(lease) {
                return err;
            }
        }
    }
}

/// Periodic maintenance of the queue and the cache.
#[derive(Clone, Debug)]
pub struct Sweeper {
    queue: JobQueue,
    cache: MaterializationCache,
    interval: Duration,
}

impl Sweeper {
    pub fn new(queue: JobQueue, cache: MaterializationCache, interval: Duration) -> Self {
        Self {
            queue,
            cache,
            interval,
        }
    }

    /// Sweeps the queue, then the cache.
    pub async fn sweep_once(&self) -> Result<(QueueSweep, CacheSweep), PortalError> {
        let queue = self.queue.sweep()?;
        let cache = self.cache.sweep().await?;
        if queue != QueueSweep::default() || cache != CacheSweep::default() {
            tracing::info!(?queue, ?cache, "sweep");
        }
        Ok((queue, cache))
    }

    /// Sweeps every interval until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => (),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(err) = self.sweep_once().await {
                tracing::error!("sweep failed: {}", err);
            }
        }
    }
}

/// The running workers and sweeper.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns every worker and the sweeper on the runtime.
    pub fn start(workers: Vec<Worker>, sweeper: Sweeper) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let mut handles: Vec<_> = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(receiver.clone())))
            .collect();
        handles.push(tokio::spawn(sweeper.run(receiver)));
        Self { shutdown, handles }
    }

    /// Stops claiming new jobs and waits for running builds to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!("worker task failed: {}", err);
            }
        }
    }
}
