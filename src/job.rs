//! Build job records.

use crate::clock::Millis;
use crate::error::FailureCause;
use crate::fingerprint::NormalizedRequest;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Lifecycle state of a build job.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Claimed,
    Building,
    Ready,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// A build of one fingerprint.
///
/// At most one non-terminal job exists per fingerprint, stored under the fingerprint key.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BuildJob {
    pub normalized: NormalizedRequest,
    pub state: JobState,
    /// Worker currently holding the lease
    pub owner: Option<String>,
    /// Namespace of the current attempt, fresh on every claim
    pub build_id: Option<String>,
    /// Number of claims so far
    pub attempts: u32,
    pub created_at: Millis,
    pub updated_at: Millis,
    pub last_heartbeat_at: Option<Millis>,
    pub lease_expires_at: Option<Millis>,
    pub building_since: Option<Millis>,
    /// Position in the queue, kept across requeues
    pub queue_seq: u64,
    pub failure: Option<FailureCause>,
    /// Identity the build is charged to
    pub identity: String,
}

impl BuildJob {
    pub fn queued(normalized: NormalizedRequest, identity: &str, queue_seq: u64, now: Millis) -> Self {
        Self {
            normalized,
            state: JobState::Queued,
            owner: None,
            build_id: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: None,
            lease_expires_at: None,
            building_since: None,
            queue_seq,
            failure: None,
            identity: identity.to_string(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.normalized.fingerprint
    }

    /// Whether `lease` still owns this job.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        matches!(self.state, JobState::Claimed | JobState::Building)
            && self.owner.as_deref() == Some(lease.worker.as_str())
            && self.build_id.as_deref() == Some(lease.build_id.as_str())
    }

    /// Puts the job back in the queue at its original position.
    pub(crate) fn requeue(&mut self, now: Millis) {
        self.state = JobState::Queued;
        self.owner = None;
        self.build_id = None;
        self.lease_expires_at = None;
        self.building_since = None;
        self.updated_at = now;
    }

    pub(crate) fn fail(&mut self, cause: FailureCause, now: Millis) {
        self.state = JobState::Failed;
        self.owner = None;
        self.lease_expires_at = None;
        self.failure = Some(cause);
        self.updated_at = now;
    }
}

/// Proof that a worker holds a claimed job. Every worker-side write is fenced on it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lease {
    pub fingerprint: String,
    pub worker: String,
    pub build_id: String,
    pub attempt: u32,
}

/// Availability watermark of an in-progress build.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BuildProgress {
    pub build_id: String,
    /// Number of chunks durably written, in order
    pub written: usize,
}
