//! Job queue coordinator.
//!
//! Jobs are keyed by fingerprint in the `jobs` tree and ordered by a sequence number in the
//! `queue` tree. Each transition re-reads the job, checks the caller's lease and commits only if
//! the stored record is unchanged, so two workers can never both believe they own a build.

use crate::clock::{after, Millis, SharedClock};
use crate::error::{FailureCause, FailureKind, PortalError};
use crate::fingerprint::NormalizedRequest;
use crate::job::{BuildJob, JobState, Lease};
use crate::metrics::BUILDS;
use crate::store::{self, decode_count, tx_decode, tx_encode, Store, TxTrees};

use sled::transaction::{abort, ConflictableTransactionResult};
use sled::IVec;
use std::time::Duration;
use uuid::Uuid;

/// Queue tunables.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Time a claim stays valid without a heartbeat
    pub lease_timeout: Duration,
    /// Claims allowed before an expired lease fails the job
    pub max_attempts: u32,
    /// Wall-clock ceiling of a build
    pub build_timeout: Duration,
    /// Time terminal job records are kept
    pub job_ttl: Duration,
    /// Concurrent builds allowed per identity
    pub max_builds_per_identity: Option<usize>,
}

/// Result of [JobQueue::enqueue].
#[derive(Clone, Debug, PartialEq)]
pub enum Enqueued {
    /// A new job was queued
    Created(BuildJob),
    /// A non-terminal job for the fingerprint already existed
    Existing(BuildJob),
}

impl Enqueued {
    pub fn job(&self) -> &BuildJob {
        match self {
            Self::Created(job) | Self::Existing(job) => job,
        }
    }
}

/// Counts of the transitions made by one [JobQueue::sweep].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueueSweep {
    pub requeued: usize,
    pub lost: usize,
    pub timed_out: usize,
    pub purged: usize,
}

/// Side effects committed together with a job record.
#[derive(Clone, Copy, Debug)]
enum Effect {
    Update,
    Claim,
    Requeue,
    Terminate,
    Purge,
}

/// Returns a build slot to an identity inside a transaction.
pub(crate) fn release_quota(
    tx: &TxTrees,
    identity: &str,
) -> ConflictableTransactionResult<(), PortalError> {
    let count = decode_count(tx.quota.get(identity.as_bytes())?);
    if count <= 1 {
        tx.quota.remove(identity.as_bytes())?;
    } else {
        tx.quota
            .insert(identity.as_bytes(), &(count - 1).to_be_bytes()[..])?;
    }
    Ok(())
}

/// Build slots currently charged to an identity.
pub fn builds_in_flight(store: &Store, identity: &str) -> Result<u64, PortalError> {
    Ok(decode_count(store.quota.get(identity.as_bytes())?))
}

#[derive(Clone, Debug)]
pub struct JobQueue {
    store: Store,
    clock: SharedClock,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Store, clock: SharedClock, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Reads the job of a fingerprint.
    pub fn job(&self, fingerprint: &str) -> Result<Option<BuildJob>, PortalError> {
        Ok(store::get::<BuildJob>(&self.store.jobs, fingerprint.as_bytes())?.map(|(_, job)| job))
    }

    /// Writes `job` in place of `expected` with its side effects, if the record is unchanged.
    fn commit(&self, expected: &IVec, job: &BuildJob, effect: Effect) -> Result<bool, PortalError> {
        let key = job.fingerprint().as_bytes();
        let seq = job.queue_seq.to_be_bytes();
        self.store.transaction(|tx| {
            if tx.jobs.get(key)?.as_ref() != Some(expected) {
                return Ok(false);
            }
            match effect {
                Effect::Update => (),
                Effect::Claim => {
                    tx.queue.remove(&seq[..])?;
                    tx.progress.remove(key)?;
                }
                Effect::Requeue => {
                    tx.queue.insert(&seq[..], key)?;
                    tx.progress.remove(key)?;
                }
                Effect::Terminate => {
                    release_quota(tx, &job.identity)?;
                    tx.progress.remove(key)?;
                }
                Effect::Purge => {
                    tx.jobs.remove(key)?;
                    tx.progress.remove(key)?;
                    return Ok(true);
                }
            }
            tx.jobs.insert(key, tx_encode(job)?)?;
            Ok(true)
        })
    }

    /// Applies `update` to a job held by `lease`, retrying on concurrent changes.
    fn update_held<F>(&self, lease: &Lease, effect: Effect, update: F) -> Result<BuildJob, PortalError>
    where
        F: Fn(&mut BuildJob, Millis),
    {
        loop {
            let lost = || PortalError::LeaseLost {
                fingerprint: lease.fingerprint.clone(),
            };
            let (bytes, mut job) =
                store::get::<BuildJob>(&self.store.jobs, lease.fingerprint.as_bytes())?
                    .ok_or_else(lost)?;
            if !job.is_held_by(lease) {
                return Err(lost());
            }
            update(&mut job, self.clock.now_millis());
            if self.commit(&bytes, &job, effect)? {
                return Ok(job);
            }
        }
    }

    /// Queues a build for a normalized request unless one is already in flight.
    ///
    /// Never blocks. The identity's build quota is charged only when a job is created.
    ///
    /// # Arguments
    ///
    /// * `normalized`: The normalized request
    /// * `identity`: Identity to charge the build to
    #[tracing::instrument(level = "DEBUG", skip(self, normalized), fields(fingerprint = %normalized.fingerprint))]
    pub fn enqueue(
        &self,
        normalized: &NormalizedRequest,
        identity: &str,
    ) -> Result<Enqueued, PortalError> {
        let seq = self.store.next_sequence()?;
        let now = self.clock.now_millis();
        let key = normalized.fingerprint.as_bytes();
        let limit = self.config.max_builds_per_identity;
        let enqueued = self.store.transaction(|tx| {
            if let Some(bytes) = tx.jobs.get(key)? {
                let job: BuildJob = tx_decode(&bytes)?;
                if !job.state.is_terminal() {
                    return Ok(Enqueued::Existing(job));
                }
            }
            let count = decode_count(tx.quota.get(identity.as_bytes())?);
            if let Some(limit) = limit {
                if count >= limit as u64 {
                    return abort(PortalError::QuotaExceeded {
                        identity: identity.to_string(),
                        limit,
                    });
                }
            }
            tx.quota
                .insert(identity.as_bytes(), &(count + 1).to_be_bytes()[..])?;
            let job = BuildJob::queued(normalized.clone(), identity, seq, now);
            tx.jobs.insert(key, tx_encode(&job)?)?;
            tx.queue.insert(&seq.to_be_bytes()[..], key)?;
            tx.progress.remove(key)?;
            Ok(Enqueued::Created(job))
        })?;
        if let Enqueued::Created(_) = enqueued {
            tracing::info!(identity, seq, "queued build");
        }
        Ok(enqueued)
    }

    /// Claims the oldest queued job for `worker`.
    ///
    /// The job gets a fresh build id, its attempt count is incremented and its lease starts.
    pub fn claim(&self, worker: &str) -> Result<Option<Lease>, PortalError> {
        for entry in self.store.queue.iter() {
            let (seq_key, fingerprint) = entry?;
            let seq = <[u8; 8]>::try_from(seq_key.as_ref())
                .ok()
                .map(u64::from_be_bytes);
            let current = store::get::<BuildJob>(&self.store.jobs, &fingerprint)?;
            let (bytes, mut job) = match current {
                Some((bytes, job)) if job.state == JobState::Queued && Some(job.queue_seq) == seq => {
                    (bytes, job)
                }
                _ => {
                    // Nothing queued behind this entry any more.
                    let _ = self.store.queue.compare_and_swap(
                        &seq_key,
                        Some(&fingerprint),
                        None as Option<&[u8]>,
                    )?;
                    continue;
                }
            };
            let now = self.clock.now_millis();
            let build_id = Uuid::new_v4().hyphenated().to_string();
            job.state = JobState::Claimed;
            job.owner = Some(worker.to_string());
            job.build_id = Some(build_id.clone());
            job.attempts += 1;
            job.last_heartbeat_at = Some(now);
            job.lease_expires_at = Some(after(now, self.config.lease_timeout));
            job.building_since = None;
            job.failure = None;
            job.updated_at = now;
            if self.commit(&bytes, &job, Effect::Claim)? {
                tracing::info!(
                    fingerprint = job.fingerprint(),
                    worker,
                    %build_id,
                    attempt = job.attempts,
                    "claimed build"
                );
                return Ok(Some(Lease {
                    fingerprint: job.normalized.fingerprint,
                    worker: worker.to_string(),
                    build_id,
                    attempt: job.attempts,
                }));
            }
        }
        Ok(None)
    }

    /// Moves a claimed job to `building`.
    pub fn start(&self, lease: &Lease) -> Result<BuildJob, PortalError> {
        let lease_timeout = self.config.lease_timeout;
        self.update_held(lease, Effect::Update, |job, now| {
            job.state = JobState::Building;
            job.building_since.get_or_insert(now);
            job.last_heartbeat_at = Some(now);
            job.lease_expires_at = Some(after(now, lease_timeout));
            job.updated_at = now;
        })
    }

    /// Extends the lease of a held job.
    pub fn heartbeat(&self, lease: &Lease) -> Result<(), PortalError> {
        let lease_timeout = self.config.lease_timeout;
        self.update_held(lease, Effect::Update, |job, now| {
            job.last_heartbeat_at = Some(now);
            job.lease_expires_at = Some(after(now, lease_timeout));
        })?;
        Ok(())
    }

    /// Marks a held job as failed with `cause`.
    #[tracing::instrument(level = "DEBUG", skip(self, lease), fields(fingerprint = %lease.fingerprint))]
    pub fn fail(&self, lease: &Lease, cause: FailureCause) -> Result<(), PortalError> {
        let kind = cause.kind;
        self.update_held(lease, Effect::Terminate, |job, now| job.fail(cause.clone(), now))?;
        BUILDS.with_label_values(&[&kind.to_string()]).inc();
        Ok(())
    }

    /// Gives a held job back to the queue at its original position.
    ///
    /// The attempt taken by the claim is returned too: a released build did not fail.
    pub fn release(&self, lease: &Lease) -> Result<(), PortalError> {
        self.update_held(lease, Effect::Requeue, |job, now| {
            job.requeue(now);
            job.attempts = job.attempts.saturating_sub(1);
        })?;
        tracing::info!(fingerprint = %lease.fingerprint, "released build");
        Ok(())
    }

    /// Reclaims expired leases, times out overlong builds and purges old terminal records.
    pub fn sweep(&self) -> Result<QueueSweep, PortalError> {
        let now = self.clock.now_millis();
        let mut report = QueueSweep::default();
        for item in self.store.jobs.iter() {
            let (key, bytes) = item?;
            let mut job: BuildJob = match store::decode(&bytes) {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&key), "skipping job record: {}", err);
                    continue;
                }
            };
            let timed_out = job.state == JobState::Building
                && job
                    .building_since
                    .is_some_and(|since| after(since, self.config.build_timeout) <= now);
            let expired = matches!(job.state, JobState::Claimed | JobState::Building)
                && job.lease_expires_at.is_some_and(|deadline| deadline <= now);
            if timed_out {
                let message = format!("build exceeded {:?}", self.config.build_timeout);
                job.fail(FailureCause::new(FailureKind::BuildTimeout, message), now);
                if self.commit(&bytes, &job, Effect::Terminate)? {
                    tracing::warn!(fingerprint = job.fingerprint(), "build timed out");
                    BUILDS.with_label_values(&[&FailureKind::BuildTimeout.to_string()]).inc();
                    report.timed_out += 1;
                }
            } else if expired && job.attempts >= self.config.max_attempts {
                let message = format!("lease expired on attempt {}", job.attempts);
                job.fail(FailureCause::new(FailureKind::WorkerLost, message), now);
                if self.commit(&bytes, &job, Effect::Terminate)? {
                    tracing::warn!(fingerprint = job.fingerprint(), "worker lost, giving up");
                    BUILDS.with_label_values(&[&FailureKind::WorkerLost.to_string()]).inc();
                    report.lost += 1;
                }
            } else if expired {
                job.requeue(now);
                if self.commit(&bytes, &job, Effect::Requeue)? {
                    tracing::warn!(
                        fingerprint = job.fingerprint(),
                        attempts = job.attempts,
                        "lease expired, requeued"
                    );
                    report.requeued += 1;
                }
            } else if job.state.is_terminal() && after(job.updated_at, self.config.job_ttl) <= now {
                if self.commit(&bytes, &job, Effect::Purge)? {
                    report.purged += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_utils;

    use std::sync::Arc;

    fn queue_with(clock: Arc<ManualClock>, config: QueueConfig) -> JobQueue {
        JobQueue::new(Store::temporary().unwrap(), clock, config)
    }

    fn queue() -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (queue_with(clock.clone(), test_utils::queue_config()), clock)
    }

    #[test]
    fn enqueue_is_idempotent_while_in_flight() {
        let (queue, _) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        let created = queue.enqueue(&normalized, "alice").unwrap();
        assert!(matches!(created, Enqueued::Created(_)));
        let existing = queue.enqueue(&normalized, "bob").unwrap();
        assert_eq!(Enqueued::Existing(created.job().clone()), existing);
        assert_eq!(1, queue.store().queue.len());
        assert_eq!(1, builds_in_flight(queue.store(), "alice").unwrap());
        assert_eq!(0, builds_in_flight(queue.store(), "bob").unwrap());
    }

    #[test]
    fn claim_is_fifo() {
        let (queue, _) = queue();
        let first = test_utils::normalized("/a/1.nc");
        let second = test_utils::normalized("/a/2.nc");
        queue.enqueue(&first, "alice").unwrap();
        queue.enqueue(&second, "alice").unwrap();
        let lease = queue.claim("w1").unwrap().unwrap();
        assert_eq!(first.fingerprint, lease.fingerprint);
        assert_eq!(1, lease.attempt);
        let lease = queue.claim("w2").unwrap().unwrap();
        assert_eq!(second.fingerprint, lease.fingerprint);
        assert!(queue.claim("w3").unwrap().is_none());
        let job = queue.job(&first.fingerprint).unwrap().unwrap();
        assert_eq!(JobState::Claimed, job.state);
        assert_eq!(Some("w1".to_string()), job.owner);
    }

    #[test]
    fn quota_applies_on_creation_only() {
        let clock = Arc::new(ManualClock::new(0));
        let mut config = test_utils::queue_config();
        config.max_builds_per_identity = Some(1);
        let queue = queue_with(clock, config);
        let first = test_utils::normalized("/a/1.nc");
        queue.enqueue(&first, "alice").unwrap();
        // Joining an existing build is free.
        assert!(matches!(
            queue.enqueue(&first, "alice").unwrap(),
            Enqueued::Existing(_)
        ));
        match queue
            .enqueue(&test_utils::normalized("/a/2.nc"), "alice")
            .unwrap_err()
        {
            PortalError::QuotaExceeded { identity, limit } => {
                assert_eq!(("alice", 1), (identity.as_str(), limit))
            }
            err => panic!("unexpected error {}", err),
        }
        // Finishing the first build frees the slot.
        let lease = queue.claim("w1").unwrap().unwrap();
        queue
            .fail(&lease, FailureCause::new(FailureKind::PermanentIo, "gone"))
            .unwrap();
        assert_eq!(0, builds_in_flight(queue.store(), "alice").unwrap());
        queue
            .enqueue(&test_utils::normalized("/a/2.nc"), "alice")
            .unwrap();
    }

    #[test]
    fn failed_job_is_replaced_on_resubmit() {
        let (queue, _) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        queue.enqueue(&normalized, "alice").unwrap();
        let lease = queue.claim("w1").unwrap().unwrap();
        queue.start(&lease).unwrap();
        let cause = FailureCause::new(FailureKind::PermanentIo, "not found");
        queue.fail(&lease, cause.clone()).unwrap();
        let failed = queue.job(&normalized.fingerprint).unwrap().unwrap();
        assert_eq!(JobState::Failed, failed.state);
        assert_eq!(Some(cause), failed.failure);

        let fresh = queue.enqueue(&normalized, "alice").unwrap();
        assert!(matches!(fresh, Enqueued::Created(_)));
        assert_eq!(JobState::Queued, fresh.job().state);
        assert_eq!(0, fresh.job().attempts);
        assert_eq!(None, fresh.job().failure);
    }

    #[test]
    fn stale_lease_is_fenced() {
        let (queue, _) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        queue.enqueue(&normalized, "alice").unwrap();
        let lease = queue.claim("w1").unwrap().unwrap();
        let mut stale = lease.clone();
        stale.build_id = "other".to_string();
        assert!(matches!(
            queue.heartbeat(&stale).unwrap_err(),
            PortalError::LeaseLost { .. }
        ));
        assert!(matches!(
            queue.fail(&stale, FailureCause::new(FailureKind::TransientIo, "x")).unwrap_err(),
            PortalError::LeaseLost { .. }
        ));
        queue.heartbeat(&lease).unwrap();
    }

    #[test]
    fn heartbeat_extends_lease() {
        let (queue, clock) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        queue.enqueue(&normalized, "alice").unwrap();
        let lease = queue.claim("w1").unwrap().unwrap();
        queue.start(&lease).unwrap();
        clock.advance(Duration::from_secs(20));
        queue.heartbeat(&lease).unwrap();
        clock.advance(Duration::from_secs(20));
        assert_eq!(QueueSweep::default(), queue.sweep().unwrap());
        assert_eq!(
            JobState::Building,
            queue.job(&normalized.fingerprint).unwrap().unwrap().state
        );
    }

    #[test]
    fn expired_lease_is_requeued_then_lost() {
        let (queue, clock) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        let other = test_utils::normalized("/a/2.nc");
        queue.enqueue(&normalized, "alice").unwrap();
        queue.enqueue(&other, "alice").unwrap();
        let max_attempts = queue.config().max_attempts;
        for attempt in 1..=max_attempts {
            let lease = queue.claim("w1").unwrap().unwrap();
            // The requeued job keeps its place ahead of later submissions.
            assert_eq!(normalized.fingerprint, lease.fingerprint);
            assert_eq!(attempt, lease.attempt);
            clock.advance(Duration::from_secs(31));
            let report = queue.sweep().unwrap();
            if attempt < max_attempts {
                assert_eq!(1, report.requeued);
                assert!(matches!(
                    queue.heartbeat(&lease).unwrap_err(),
                    PortalError::LeaseLost { .. }
                ));
            } else {
                assert_eq!(1, report.lost);
            }
        }
        let job = queue.job(&normalized.fingerprint).unwrap().unwrap();
        assert_eq!(JobState::Failed, job.state);
        assert_eq!(FailureKind::WorkerLost, job.failure.unwrap().kind);
        assert_eq!(max_attempts, job.attempts);
        assert_eq!(other.fingerprint, queue.claim("w1").unwrap().unwrap().fingerprint);
    }

    #[test]
    fn building_past_ceiling_times_out() {
        let (queue, clock) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        queue.enqueue(&normalized, "alice").unwrap();
        let lease = queue.claim("w1").unwrap().unwrap();
        queue.start(&lease).unwrap();
        for _ in 0..20 {
            clock.advance(Duration::from_secs(10));
            queue.heartbeat(&lease).unwrap();
        }
        let report = queue.sweep().unwrap();
        assert_eq!(1, report.timed_out);
        let job = queue.job(&normalized.fingerprint).unwrap().unwrap();
        assert_eq!(FailureKind::BuildTimeout, job.failure.unwrap().kind);
        assert!(matches!(
            queue.heartbeat(&lease).unwrap_err(),
            PortalError::LeaseLost { .. }
        ));
    }

    #[test]
    fn release_keeps_position() {
        let (queue, _) = queue();
        let first = test_utils::normalized("/a/1.nc");
        queue.enqueue(&first, "alice").unwrap();
        queue.enqueue(&test_utils::normalized("/a/2.nc"), "alice").unwrap();
        let lease = queue.claim("w1").unwrap().unwrap();
        queue.release(&lease).unwrap();
        let again = queue.claim("w2").unwrap().unwrap();
        assert_eq!(first.fingerprint, again.fingerprint);
        // A release does not use up an attempt.
        assert_eq!(1, again.attempt);
        assert_ne!(lease.build_id, again.build_id);
    }

    fn set_progress(queue: &JobQueue, lease: &Lease, written: usize) {
        let progress = crate::job::BuildProgress {
            build_id: lease.build_id.clone(),
            written,
        };
        queue
            .store()
            .progress
            .insert(lease.fingerprint.as_bytes(), store::encode(&progress).unwrap())
            .unwrap();
    }

    #[test]
    fn requeue_drops_the_watermark() {
        let (queue, clock) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        let key = normalized.fingerprint.as_bytes();
        queue.enqueue(&normalized, "alice").unwrap();

        let lease = queue.claim("w1").unwrap().unwrap();
        queue.start(&lease).unwrap();
        set_progress(&queue, &lease, 1);
        queue.release(&lease).unwrap();
        assert!(queue.store().progress.get(key).unwrap().is_none());
        let job = queue.job(&normalized.fingerprint).unwrap().unwrap();
        assert_eq!((JobState::Queued, None, 0), (job.state, job.build_id, job.attempts));

        let lease = queue.claim("w1").unwrap().unwrap();
        queue.start(&lease).unwrap();
        set_progress(&queue, &lease, 1);
        clock.advance(Duration::from_secs(31));
        assert_eq!(1, queue.sweep().unwrap().requeued);
        assert!(queue.store().progress.get(key).unwrap().is_none());
        let job = queue.job(&normalized.fingerprint).unwrap().unwrap();
        assert_eq!((JobState::Queued, None, 1), (job.state, job.build_id, job.attempts));
    }

    #[test]
    fn terminal_records_are_purged() {
        let (queue, clock) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        queue.enqueue(&normalized, "alice").unwrap();
        let lease = queue.claim("w1").unwrap().unwrap();
        queue
            .fail(&lease, FailureCause::new(FailureKind::PermanentIo, "gone"))
            .unwrap();
        assert_eq!(0, queue.sweep().unwrap().purged);
        clock.advance(Duration::from_secs(3601));
        assert_eq!(1, queue.sweep().unwrap().purged);
        assert!(queue.job(&normalized.fingerprint).unwrap().is_none());
    }

    #[test]
    fn concurrent_enqueue_creates_one_job() {
        let (queue, _) = queue();
        let normalized = test_utils::normalized("/a/1.nc");
        let created: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| queue.enqueue(&normalized, "alice").unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|enqueued| matches!(enqueued, Enqueued::Created(_)))
                .count()
        });
        assert_eq!(1, created);
        assert_eq!(1, queue.store().queue.len());
    }
}
