//! Materialization cache and state tracker.
//!
//! A [CacheEntry] per fingerprint points at the current [Artifact] version and counts the
//! streams reading it. Entries are installed atomically with their job's transition to
//! `ready`, refreshed on access and evicted by [MaterializationCache::sweep] once they are
//! both expired and idle.

use crate::artifact::{Artifact, CacheLayout};
use crate::clock::{self, after, Millis, SharedClock};
use crate::error::PortalError;
use crate::job::{BuildJob, JobState, Lease};
use crate::metrics::{BUILDS, CACHE_LOOKUPS, EVICTIONS};
use crate::queue::release_quota;
use crate::store::{self, tx_decode, tx_encode, Store};
use crate::writer::remove_dir;

use serde::{Deserialize, Serialize};
use sled::transaction::abort;
use sled::Tree;
use std::path::Path;
use std::time::Duration;
use strum_macros::Display;

/// A ready artifact and its bookkeeping.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub artifact: Artifact,
    /// Streams currently reading the artifact
    pub streams: u64,
    pub expires_at: Millis,
    pub last_accessed_at: Millis,
}

/// Result of [MaterializationCache::lookup].
#[derive(Clone, Debug, Display, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Lookup {
    Hit(CacheEntry),
    InProgress(BuildJob),
    Miss,
}

/// Counts of the work done by one [MaterializationCache::sweep].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheSweep {
    /// Expired, idle entries removed
    pub evicted: usize,
    /// Expired entries kept because streams are still reading them
    pub draining: usize,
    /// Artifact versions no entry or build refers to
    pub collected: usize,
    /// Staging directories of builds that are no longer running
    pub staging_removed: usize,
}

/// Applies `update` to an entry with compare-and-swap, retrying on concurrent changes.
///
/// Returns `None` if there is no entry.
fn update_entry<F>(tree: &Tree, fingerprint: &str, update: F) -> Result<Option<CacheEntry>, PortalError>
where
    F: Fn(&mut CacheEntry),
{
    loop {
        let Some((bytes, mut entry)) = store::get::<CacheEntry>(tree, fingerprint.as_bytes())? else {
            return Ok(None);
        };
        update(&mut entry);
        if store::compare_and_swap(tree, fingerprint.as_bytes(), Some(&bytes), Some(&entry))? {
            return Ok(Some(entry));
        }
    }
}

/// Holds a stream reference on a cache entry. Dropping it releases the reference.
#[derive(Debug)]
pub struct StreamGuard {
    entries: Tree,
    fingerprint: String,
    clock: SharedClock,
    ttl: Duration,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let now = self.clock.now_millis();
        let ttl = self.ttl;
        let released = update_entry(&self.entries, &self.fingerprint, |entry| {
            entry.streams = entry.streams.saturating_sub(1);
            entry.last_accessed_at = now;
            entry.expires_at = entry.expires_at.max(after(now, ttl));
        });
        if let Err(err) = released {
            tracing::error!(fingerprint = %self.fingerprint, "failed to release stream: {}", err);
        }
    }
}

#[derive(Clone, Debug)]
pub struct MaterializationCache {
    store: Store,
    layout: CacheLayout,
    clock: SharedClock,
    ttl: Duration,
}

impl MaterializationCache {
    /// # Arguments
    ///
    /// * `ttl`: Time an entry is kept after its last access
    pub fn new(store: Store, layout: CacheLayout, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            store,
            layout,
            clock,
            ttl,
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn entry(&self, fingerprint: &str) -> Result<Option<CacheEntry>, PortalError> {
        Ok(store::get::<CacheEntry>(&self.store.entries, fingerprint.as_bytes())?
            .map(|(_, entry)| entry))
    }

    fn lookup_inner(&self, fingerprint: &str) -> Result<Lookup, PortalError> {
        if let Some(entry) = self.entry(fingerprint)? {
            return Ok(Lookup::Hit(entry));
        }
        match store::get::<BuildJob>(&self.store.jobs, fingerprint.as_bytes())? {
            Some((_, job)) if !job.state.is_terminal() => Ok(Lookup::InProgress(job)),
            _ => Ok(Lookup::Miss),
        }
    }

    /// Finds the ready artifact or the running build of a fingerprint.
    pub fn lookup(&self, fingerprint: &str) -> Result<Lookup, PortalError> {
        let lookup = self.lookup_inner(fingerprint)?;
        CACHE_LOOKUPS.with_label_values(&[&lookup.to_string()]).inc();
        Ok(lookup)
    }

    /// Installs the artifact of a build and marks the build `ready`, in one transaction.
    ///
    /// Fails with [PortalError::LeaseLost] unless `lease` still holds the job in `building`.
    /// An existing entry is superseded but keeps its stream count.
    #[tracing::instrument(level = "DEBUG", skip(self, lease, artifact), fields(fingerprint = %lease.fingerprint))]
    pub fn install(&self, lease: &Lease, artifact: Artifact) -> Result<CacheEntry, PortalError> {
        let key = lease.fingerprint.as_bytes();
        let now = self.clock.now_millis();
        let expires_at = after(now, self.ttl);
        let lost = || PortalError::LeaseLost {
            fingerprint: lease.fingerprint.clone(),
        };
        let entry = self.store.transaction(|tx| {
            let Some(bytes) = tx.jobs.get(key)? else {
                return abort(lost());
            };
            let mut job: BuildJob = tx_decode(&bytes)?;
            if job.state != JobState::Building || !job.is_held_by(lease) {
                return abort(lost());
            }
            let streams = match tx.entries.get(key)? {
                Some(bytes) => tx_decode::<CacheEntry>(&bytes)?.streams,
                None => 0,
            };
            let entry = CacheEntry {
                fingerprint: lease.fingerprint.clone(),
                artifact: artifact.clone(),
                streams,
                expires_at,
                last_accessed_at: now,
            };
            job.state = JobState::Ready;
            job.owner = None;
            job.lease_expires_at = None;
            job.failure = None;
            job.updated_at = now;
            tx.jobs.insert(key, tx_encode(&job)?)?;
            tx.entries.insert(key, tx_encode(&entry)?)?;
            tx.progress.remove(key)?;
            release_quota(tx, &job.identity)?;
            Ok(entry)
        })?;
        BUILDS.with_label_values(&["ready"]).inc();
        tracing::info!(version = %entry.artifact.version, "installed artifact");
        Ok(entry)
    }

    /// Refreshes the expiry and last access time of an entry.
    pub fn touch(&self, fingerprint: &str) -> Result<Option<CacheEntry>, PortalError> {
        let now = self.clock.now_millis();
        let ttl = self.ttl;
        update_entry(&self.store.entries, fingerprint, |entry| {
            entry.last_accessed_at = now;
            entry.expires_at = entry.expires_at.max(after(now, ttl));
        })
    }

    /// Registers a stream on an entry, returning the entry and a guard that releases it.
    pub fn acquire_stream(&self, fingerprint: &str) -> Result<(CacheEntry, StreamGuard), PortalError> {
        let now = self.clock.now_millis();
        let ttl = self.ttl;
        let entry = update_entry(&self.store.entries, fingerprint, |entry| {
            entry.streams += 1;
            entry.last_accessed_at = now;
            entry.expires_at = entry.expires_at.max(after(now, ttl));
        })?
        .ok_or_else(|| PortalError::NotFound {
            fingerprint: fingerprint.to_string(),
        })?;
        let guard = StreamGuard {
            entries: self.store.entries.clone(),
            fingerprint: fingerprint.to_string(),
            clock: self.clock.clone(),
            ttl,
        };
        Ok((entry, guard))
    }

    /// Waits until a fingerprint is no longer being built, or `timeout` elapses.
    ///
    /// Returns the latest lookup either way. Store subscriptions wake the wait; `poll` bounds
    /// the time between re-checks.
    pub async fn wait(
        &self,
        fingerprint: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Lookup, PortalError> {
        let deadline = clock::deadline(timeout);
        loop {
            let changed = store::changed(
                &[&self.store.jobs, &self.store.entries],
                fingerprint.as_bytes(),
            );
            let lookup = self.lookup_inner(fingerprint)?;
            if !matches!(lookup, Lookup::InProgress(_)) || tokio::time::Instant::now() >= deadline {
                return Ok(lookup);
            }
            let recheck = deadline.min(clock::deadline(poll));
            tokio::select! {
                _ = changed => (),
                _ = tokio::time::sleep_until(recheck) => (),
            }
        }
    }

    /// Evicts expired idle entries and removes artifact versions and staging directories that
    /// nothing refers to.
    pub async fn sweep(&self) -> Result<CacheSweep, PortalError> {
        let now = self.clock.now_millis();
        let mut report = CacheSweep::default();

        let entries = self
            .store
            .entries
            .iter()
            .collect::<Result<Vec<_>, _>>()?;
        for (key, bytes) in entries {
            let entry: CacheEntry = match store::decode(&bytes) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&key), "skipping cache entry: {}", err);
                    continue;
                }
            };
            if entry.expires_at > now {
                continue;
            }
            if entry.streams > 0 {
                report.draining += 1;
                continue;
            }
            if store::compare_and_swap::<CacheEntry>(&self.store.entries, &key, Some(&bytes), None)? {
                let dir = self
                    .layout
                    .artifact_dir(&entry.fingerprint, &entry.artifact.version);
                remove_dir(&dir).await?;
                let _ = tokio::fs::remove_dir(self.layout.fingerprint_dir(&entry.fingerprint)).await;
                tracing::info!(fingerprint = %entry.fingerprint, "evicted artifact");
                EVICTIONS.inc();
                report.evicted += 1;
            }
        }

        report.collected = self
            .collect(&self.layout.artifacts_root(), |fingerprint, version| {
                self.version_in_use(fingerprint, version)
            })
            .await?;
        report.staging_removed = self
            .collect(&self.layout.staging_root(), |fingerprint, build_id| {
                self.build_running(fingerprint, build_id)
            })
            .await?;
        Ok(report)
    }

    /// Whether a worker holds a build of `fingerprint` under `build_id`.
    fn build_running(&self, fingerprint: &str, build_id: &str) -> Result<bool, PortalError> {
        Ok(
            match store::get::<BuildJob>(&self.store.jobs, fingerprint.as_bytes())? {
                Some((_, job)) => {
                    matches!(job.state, JobState::Claimed | JobState::Building)
                        && job.build_id.as_deref() == Some(build_id)
                }
                None => false,
            },
        )
    }

    /// Whether an artifact version may still be read or is about to be installed.
    fn version_in_use(&self, fingerprint: &str, version: &str) -> Result<bool, PortalError> {
        if let Some(entry) = self.entry(fingerprint)? {
            // Superseded versions stay while streams may be reading them.
            if entry.artifact.version == version || entry.streams > 0 {
                return Ok(true);
            }
        }
        self.build_running(fingerprint, version)
    }

    /// Removes `<root>/<fingerprint>/<build id>` directories for which `in_use` is false.
    async fn collect<F>(&self, root: &Path, in_use: F) -> Result<usize, PortalError>
    where
        F: Fn(&str, &str) -> Result<bool, PortalError>,
    {
        let mut removed = 0;
        for (fingerprint, fingerprint_dir) in list_dirs(root).await? {
            for (build_id, dir) in list_dirs(&fingerprint_dir).await? {
                if !in_use(&fingerprint, &build_id)? {
                    remove_dir(&dir).await?;
                    tracing::info!(%fingerprint, %build_id, dir = %dir.display(), "removed unreferenced build");
                    removed += 1;
                }
            }
            let _ = tokio::fs::remove_dir(&fingerprint_dir).await;
        }
        Ok(removed)
    }

    /// Clears every stream count. Streams do not survive a restart.
    pub fn reset_stream_counts(&self) -> Result<usize, PortalError> {
        let mut reset = 0;
        for key in self.store.entries.iter().keys() {
            let key = key?;
            let fingerprint = String::from_utf8_lossy(&key).into_owned();
            let updated = update_entry(&self.store.entries, &fingerprint, |entry| entry.streams = 0)?;
            if updated.is_some() {
                reset += 1;
            }
        }
        Ok(reset)
    }
}

/// Lists the subdirectories of `dir` by name. A missing directory has none.
async fn list_dirs(dir: &Path) -> Result<Vec<(String, std::path::PathBuf)>, PortalError> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(PortalError::storage_io(dir, err)),
    };
    let mut dirs = vec![];
    while let Some(item) = read_dir
        .next_entry()
        .await
        .map_err(|err| PortalError::storage_io(dir, err))?
    {
        let is_dir = item
            .file_type()
            .await
            .map_err(|err| PortalError::storage_io(item.path(), err))?
            .is_dir();
        if let (true, Some(name)) = (is_dir, item.file_name().to_str()) {
            dirs.push((name.to_string(), item.path()));
        }
    }
    Ok(dirs)
}
