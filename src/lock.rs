use crate::options::LockOptions;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Milliseconds since the unix epoch for `when`, the unit every persisted timestamp in
/// this crate is expressed in.
pub(crate) fn millis_since_epoch(when: OffsetDateTime) -> i64 {
    (when.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Returns `true` if a record last written at `last_updated_time_in_ms` with
/// `lease_duration_in_ms` has passed its lease expiration as of `now`.
pub(crate) fn lease_expired(last_updated_time_in_ms: i64, lease_duration_in_ms: i64, now: OffsetDateTime) -> bool {
    millis_since_epoch(now) > last_updated_time_in_ms + lease_duration_in_ms
}

/// The mutable part of a [`Lock`]: the tentative/committed version token, write time,
/// and acquisition flag. Kept behind a plain `std::sync::Mutex` since every mutation is
/// a handful of field writes and never spans an `.await`.
#[derive(Debug, Default)]
struct LockState {
    record_version_number: Option<Uuid>,
    last_updated_time_in_ms: Option<i64>,
    is_acquired: bool,
}

/// In-memory representation of a lock, mirroring the persisted record plus local-only
/// acquisition state.
///
/// Cheaply `Clone`: the mutable state and the prolongation cancellation token are
/// shared via `Arc` between the handle returned from [`crate::LockClient::lock`], the
/// coordinator's registry entry, and the background renewal task, so any of the three
/// observes the same `is_acquired`/version/time at all times.
///
/// Created by [`crate::LockClient::lock`] from caller input and mutated through the
/// acquisition state machine; never constructed directly by user code.
#[derive(Debug, Clone)]
pub struct Lock {
    pub(crate) lock_group: Arc<str>,
    pub(crate) lock_id: Arc<str>,
    pub(crate) owner_name: Arc<str>,
    pub(crate) lease_duration_in_ms: i64,
    pub(crate) additional_attributes: Arc<Value>,
    pub(crate) prolong_lease_enabled: bool,
    pub(crate) prolong_every: Duration,
    pub(crate) trust_local_time: bool,
    pub(crate) wait_duration: Option<Duration>,
    pub(crate) max_retry_count: Option<u32>,
    state: Arc<Mutex<LockState>>,
    pub(crate) cancellation: CancellationToken,
    /// Serializes the two writers that can touch this handle's backend record once
    /// acquired: the background renewal loop and `release_lock`/`release_all_locks`.
    /// Held across the check-then-write span of each, never across the renewal sleep.
    pub(crate) write_guard: Arc<AsyncMutex<()>>,
}

impl Lock {
    /// Builds a tentative handle from caller input. Does not touch the backend;
    /// callers must run [`LockOptions::validate`] first.
    pub(crate) fn create(lock_group: String, lock_id: String, owner_name: String, opts: &LockOptions) -> Self {
        Self {
            lock_group: lock_group.into(),
            lock_id: lock_id.into(),
            owner_name: owner_name.into(),
            lease_duration_in_ms: opts.lease_duration.as_millis() as i64,
            additional_attributes: Arc::new(opts.additional_attributes.clone()),
            prolong_lease_enabled: opts.prolong_lease_enabled,
            prolong_every: opts.prolong_every,
            trust_local_time: opts.trust_local_time,
            wait_duration: opts.wait_duration,
            max_retry_count: opts.max_retry_count,
            state: Arc::new(Mutex::new(LockState::default())),
            cancellation: CancellationToken::new(),
            write_guard: Arc::new(AsyncMutex::new(())),
        }
    }

    /// `"{lock_group}|{lock_id}"`, the key used in logs and the coordinator's registry.
    pub fn unique_lock_identifier(&self) -> String {
        format!("{}|{}", self.lock_group, self.lock_id)
    }

    pub fn lock_group(&self) -> &str {
        &self.lock_group
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().is_acquired
    }

    pub fn record_version_number(&self) -> Option<Uuid> {
        self.state.lock().unwrap().record_version_number
    }

    pub(crate) fn last_updated_time_in_ms(&self) -> Option<i64> {
        self.state.lock().unwrap().last_updated_time_in_ms
    }

    /// Returns `false` if the handle has never been written; else whether `now` has
    /// passed `last_updated_time_in_ms + lease_duration_in_ms`.
    pub(crate) fn lease_expiration_time_passed(&self, now: OffsetDateTime) -> bool {
        match self.last_updated_time_in_ms() {
            None => false,
            Some(last_updated) => lease_expired(last_updated, self.lease_duration_in_ms, now),
        }
    }

    /// Stamps a tentative version/time ahead of a create/steal/renew write attempt.
    pub(crate) fn attempt_locking(&self, version: Uuid, when: OffsetDateTime) {
        let mut state = self.state.lock().unwrap();
        state.record_version_number = Some(version);
        state.last_updated_time_in_ms = Some(millis_since_epoch(when));
    }

    /// Clears a tentative version/time after a conditional write was rejected.
    pub(crate) fn reset_locking_attempt(&self) {
        let mut state = self.state.lock().unwrap();
        state.record_version_number = None;
        state.last_updated_time_in_ms = None;
    }

    /// Commits the tentative attempt: the handle is now the registered owner.
    pub(crate) fn acquired(&self) {
        self.state.lock().unwrap().is_acquired = true;
    }

    /// Records a successful renewal write.
    pub(crate) fn prolonged(&self, version: Uuid, when: OffsetDateTime) {
        self.attempt_locking(version, when);
    }

    /// Terminates the handle: clears `is_acquired` and cancels any scheduled renewal.
    /// Idempotent — calling this on an already-released handle is a no-op.
    pub(crate) fn released(&self) {
        self.state.lock().unwrap().is_acquired = false;
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LockOptions;
    use std::time::Duration as StdDuration;

    fn fresh_lock() -> Lock {
        let opts = LockOptions::default().lease_duration(StdDuration::from_millis(1000));
        Lock::create("g".into(), "i".into(), "owner-a".into(), &opts)
    }

    #[test]
    fn never_written_handle_has_not_expired() {
        let lock = fresh_lock();
        assert!(!lock.lease_expiration_time_passed(OffsetDateTime::now_utc()));
    }

    #[test]
    fn attempt_locking_then_acquired_sets_state() {
        let lock = fresh_lock();
        let v = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        lock.attempt_locking(v, now);
        assert_eq!(lock.record_version_number(), Some(v));
        assert!(!lock.is_acquired());
        lock.acquired();
        assert!(lock.is_acquired());
    }

    #[test]
    fn reset_locking_attempt_clears_tentative_state() {
        let lock = fresh_lock();
        lock.attempt_locking(Uuid::new_v4(), OffsetDateTime::now_utc());
        lock.reset_locking_attempt();
        assert_eq!(lock.record_version_number(), None);
        assert_eq!(lock.last_updated_time_in_ms(), None);
    }

    #[test]
    fn released_clears_acquired_and_cancels_token() {
        let lock = fresh_lock();
        lock.attempt_locking(Uuid::new_v4(), OffsetDateTime::now_utc());
        lock.acquired();
        let cloned = lock.clone();
        lock.released();
        assert!(!lock.is_acquired());
        assert!(!cloned.is_acquired());
        assert!(cloned.cancellation.is_cancelled());
    }

    #[test]
    fn lease_expiration_detected_after_duration_elapses() {
        let lock = fresh_lock();
        let written_at = OffsetDateTime::now_utc() - StdDuration::from_millis(2000);
        lock.attempt_locking(Uuid::new_v4(), written_at);
        assert!(lock.lease_expiration_time_passed(OffsetDateTime::now_utc()));
    }

    #[test]
    fn unique_lock_identifier_joins_group_and_id() {
        let lock = fresh_lock();
        assert_eq!(lock.unique_lock_identifier(), "g|i");
    }
}
