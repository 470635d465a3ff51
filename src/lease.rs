//! Job lease tracker — per-job deadlines and the exactly-once resolution gate.
//!
//! Each activated job is registered with the absolute deadline the engine
//! gave it. The completion pipeline claims a job by moving it from `Leased`
//! to `Resolving`; only one claim per job can ever succeed. Released keys are
//! remembered for a while so late duplicates are still recognised.
//!
//! Every registration gets a fresh generation. A job the engine reclaimed and
//! handed out again supersedes the earlier activation; releasing through a
//! stale claim or generation leaves the newer entry alone.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::JobKey;

/// How many released keys are remembered for duplicate detection.
pub const RELEASED_HISTORY: usize = 4096;

/// Time left on a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// The lease is still valid for this long.
    Left(Duration),
    /// The deadline passed this long ago.
    Expired { overdue: Duration },
}

impl Remaining {
    pub fn is_expired(&self) -> bool {
        matches!(self, Remaining::Expired { .. })
    }

    /// Remaining time, zero once expired.
    pub fn as_duration(&self) -> Duration {
        match self {
            Remaining::Left(d) => *d,
            Remaining::Expired { .. } => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Leased,
    Resolving,
}

/// Why a job could not be claimed for resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    /// Already resolving, or resolved and released.
    AlreadyClaimed,
    /// Never registered (or forgotten long ago).
    Unknown,
}

/// Identifies one activation of a job within a tracker.
pub type Generation = u64;

/// Proof that the caller owns the resolution of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveClaim {
    pub job_key: JobKey,
    pub deadline: DateTime<Utc>,
    pub generation: Generation,
}

#[derive(Debug)]
struct LeaseEntry {
    deadline: DateTime<Utc>,
    state: LeaseState,
    generation: Generation,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<JobKey, LeaseEntry>,
    next_generation: Generation,
    released: HashSet<JobKey>,
    released_order: VecDeque<JobKey>,
}

/// Tracks the lease of every in-flight job of one worker.
#[derive(Debug, Default)]
pub struct LeaseTracker {
    inner: Mutex<Inner>,
}

impl LeaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a job and return the generation of this activation.
    ///
    /// Re-registering a key (the engine handed the job out again after
    /// reclaiming it) replaces the earlier entry with a `Leased` one, even
    /// when an earlier submission is still resolving.
    pub fn register(&self, job_key: JobKey, deadline: DateTime<Utc>) -> Generation {
        let mut inner = self.lock();
        if inner.released.remove(&job_key) {
            inner.released_order.retain(|k| *k != job_key);
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let previous = inner.entries.insert(
            job_key,
            LeaseEntry {
                deadline,
                state: LeaseState::Leased,
                generation,
            },
        );
        if matches!(previous, Some(LeaseEntry { state: LeaseState::Resolving, .. })) {
            tracing::debug!(
                job_key,
                "LeaseTracker: job re-activated while an earlier outcome is resolving"
            );
        }
        generation
    }

    /// Time left on the lease at the current wall-clock time.
    pub fn remaining(&self, job_key: JobKey) -> Option<Remaining> {
        self.remaining_at(job_key, Utc::now())
    }

    /// Time left on the lease as seen at `now`.
    pub fn remaining_at(&self, job_key: JobKey, now: DateTime<Utc>) -> Option<Remaining> {
        let inner = self.lock();
        inner
            .entries
            .get(&job_key)
            .map(|entry| remaining_between(entry.deadline, now))
    }

    pub fn state(&self, job_key: JobKey) -> Option<LeaseState> {
        self.lock().entries.get(&job_key).map(|e| e.state)
    }

    /// Atomically move a job from `Leased` to `Resolving`.
    pub fn begin_resolving(&self, job_key: JobKey) -> Result<ResolveClaim, ClaimError> {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&job_key) {
            return match entry.state {
                LeaseState::Leased => {
                    entry.state = LeaseState::Resolving;
                    Ok(ResolveClaim {
                        job_key,
                        deadline: entry.deadline,
                        generation: entry.generation,
                    })
                }
                LeaseState::Resolving => Err(ClaimError::AlreadyClaimed),
            };
        }
        if inner.released.contains(&job_key) {
            Err(ClaimError::AlreadyClaimed)
        } else {
            Err(ClaimError::Unknown)
        }
    }

    /// Stop tracking a job. Unknown or already released keys are a no-op.
    pub fn release(&self, job_key: JobKey) {
        self.release_matching(job_key, None);
    }

    /// Release the entry `claim` was taken on. A no-op if the job has been
    /// registered again since.
    pub fn release_claim(&self, claim: &ResolveClaim) {
        self.release_matching(claim.job_key, Some(claim.generation));
    }

    /// Release one activation of a job. A no-op if the job has been
    /// registered again since.
    pub fn release_generation(&self, job_key: JobKey, generation: Generation) {
        self.release_matching(job_key, Some(generation));
    }

    fn release_matching(&self, job_key: JobKey, generation: Option<Generation>) {
        let mut inner = self.lock();
        let matches = match (inner.entries.get(&job_key), generation) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(entry), Some(generation)) => entry.generation == generation,
        };
        if !matches {
            return;
        }
        inner.entries.remove(&job_key);
        if inner.released.insert(job_key) {
            inner.released_order.push_back(job_key);
        }
        while inner.released_order.len() > RELEASED_HISTORY {
            if let Some(old) = inner.released_order.pop_front() {
                inner.released.remove(&old);
            }
        }
    }

    /// Number of jobs currently tracked (leased or resolving).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys whose deadline has passed at `now`, still tracked.
    pub fn expired_keys(&self, now: DateTime<Utc>) -> Vec<JobKey> {
        let inner = self.lock();
        let mut keys: Vec<JobKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        keys.sort_unstable();
        keys
    }
}

/// Signed distance from `now` to `deadline`.
pub fn remaining_between(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Remaining {
    let delta = deadline.signed_duration_since(now);
    if delta > chrono::Duration::zero() {
        Remaining::Left(delta.to_std().unwrap_or(Duration::ZERO))
    } else {
        Remaining::Expired {
            overdue: (-delta).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_remaining_left_and_expired() {
        let tracker = LeaseTracker::new();
        tracker.register(1, at(10_000));

        assert_eq!(
            tracker.remaining_at(1, at(4_000)),
            Some(Remaining::Left(Duration::from_secs(6)))
        );
        assert_eq!(
            tracker.remaining_at(1, at(12_500)),
            Some(Remaining::Expired {
                overdue: Duration::from_millis(2_500)
            })
        );
        assert!(tracker.remaining_at(1, at(10_000)).unwrap().is_expired());
    }

    #[test]
    fn test_remaining_unknown_key() {
        let tracker = LeaseTracker::new();
        assert_eq!(tracker.remaining(99), None);
    }

    #[test]
    fn test_begin_resolving_only_once() {
        let tracker = LeaseTracker::new();
        tracker.register(7, at(10_000));

        let claim = tracker.begin_resolving(7).unwrap();
        assert_eq!(claim.job_key, 7);
        assert_eq!(tracker.state(7), Some(LeaseState::Resolving));
        assert_eq!(tracker.begin_resolving(7), Err(ClaimError::AlreadyClaimed));

        tracker.release(7);
        assert_eq!(tracker.begin_resolving(7), Err(ClaimError::AlreadyClaimed));
        assert_eq!(tracker.begin_resolving(8), Err(ClaimError::Unknown));
    }

    #[test]
    fn test_release_is_idempotent() {
        let tracker = LeaseTracker::new();
        tracker.register(1, at(10_000));
        tracker.release(1);
        tracker.release(1);
        tracker.release(12345);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_reregister_after_reclaim() {
        let tracker = LeaseTracker::new();
        tracker.register(1, at(10_000));
        tracker.release(1);
        tracker.register(1, at(20_000));
        assert!(tracker.begin_resolving(1).is_ok());
    }

    #[test]
    fn test_stale_claim_release_keeps_new_activation() {
        let tracker = LeaseTracker::new();
        tracker.register(1, at(10_000));
        let stale = tracker.begin_resolving(1).unwrap();

        // Reclaimed by the engine and handed to this worker again.
        let fresh = tracker.register(1, at(20_000));
        assert_ne!(fresh, stale.generation);
        assert_eq!(tracker.state(1), Some(LeaseState::Leased));

        tracker.release_claim(&stale);
        assert_eq!(tracker.len(), 1);
        let claim = tracker.begin_resolving(1).unwrap();
        assert_eq!(claim.generation, fresh);
        assert_eq!(claim.deadline, at(20_000));

        tracker.release_claim(&claim);
        assert!(tracker.is_empty());
        assert_eq!(tracker.begin_resolving(1), Err(ClaimError::AlreadyClaimed));
    }

    #[test]
    fn test_release_generation_ignores_superseded() {
        let tracker = LeaseTracker::new();
        let first = tracker.register(3, at(10_000));
        let second = tracker.register(3, at(20_000));

        tracker.release_generation(3, first);
        assert_eq!(tracker.remaining_at(3, at(15_000)), Some(Remaining::Left(Duration::from_secs(5))));
        tracker.release_generation(3, second);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_released_history_is_bounded() {
        let tracker = LeaseTracker::new();
        for key in 0..(RELEASED_HISTORY as i64 + 10) {
            tracker.register(key, at(10_000));
            tracker.release(key);
        }
        // Oldest keys have been forgotten.
        assert_eq!(tracker.begin_resolving(0), Err(ClaimError::Unknown));
        assert_eq!(
            tracker.begin_resolving(RELEASED_HISTORY as i64 + 9),
            Err(ClaimError::AlreadyClaimed)
        );
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let tracker = std::sync::Arc::new(LeaseTracker::new());
        tracker.register(5, at(10_000));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.begin_resolving(5).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_expired_keys() {
        let tracker = LeaseTracker::new();
        tracker.register(1, at(1_000));
        tracker.register(2, at(5_000));
        tracker.register(3, at(2_000));
        assert_eq!(tracker.expired_keys(at(3_000)), vec![1, 3]);
    }
}
