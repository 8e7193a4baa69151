use crate::error::Error;
use crate::lock::Lock;
use crate::log::{LogEvent, LogHook, Severity};
use crate::options::LockOptions;
use crate::store::{LockStore, RecordAttributes};
use crate::table::TableDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

type Registry = Arc<Mutex<HashMap<String, Lock>>>;

/// Coordinates lock acquisition, renewal and release against a [`LockStore`].
///
/// One `owner_name` (a UUID generated at construction) is stamped on every write this
/// instance makes; it gates the renew and delete predicates. Cheaply `Clone` — every
/// field is `Arc`-backed, which is what lets the background prolongation task hold its
/// own handle to the registry and store without borrowing from the `LockClient` that
/// spawned it.
#[derive(Clone)]
pub struct LockClient {
    owner_name: Arc<str>,
    store: Arc<dyn LockStore>,
    table: Arc<TableDescriptor>,
    log_hook: Option<LogHook>,
    registry: Registry,
}

impl std::fmt::Debug for LockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockClient")
            .field("owner_name", &self.owner_name)
            .field("table", &self.table.table_name)
            .finish_non_exhaustive()
    }
}

impl LockClient {
    /// Returns a new [`crate::LockClientBuilder`].
    pub fn builder() -> crate::builder::LockClientBuilder {
        <_>::default()
    }

    pub(crate) fn new(store: Arc<dyn LockStore>, table: Arc<TableDescriptor>, log_hook: Option<LogHook>) -> Self {
        Self {
            owner_name: Uuid::new_v4().to_string().into(),
            store,
            table,
            log_hook,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// This instance's owner identity, stamped on every write it makes.
    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    fn emit(&self, severity: Severity, lock_id: Option<String>, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info => info!("{message}"),
            Severity::Warn => warn!("{message}"),
            Severity::Error => error!("{message}"),
        }
        if let Some(hook) = &self.log_hook {
            hook(LogEvent::new(severity, message, lock_id));
        }
    }

    /// Acquires a named lock, retrying per the ACQUIRE/CREATE_NEW/WAIT_THEN_STEAL/STEAL
    /// state machine. `lock_group` and `lock_id` together form the composite key;
    /// neither may be empty.
    #[instrument(skip(self, opts), fields(lock_group, lock_id))]
    pub async fn lock(
        &self,
        lock_group: impl Into<String>,
        lock_id: impl Into<String>,
        opts: LockOptions,
    ) -> Result<Lock, Error> {
        opts.validate()?;
        let lock_group = lock_group.into();
        let lock_id = lock_id.into();
        if lock_group.is_empty() || lock_id.is_empty() {
            return Err(Error::lock_options("lock_group and lock_id must be non-empty"));
        }
        tracing::Span::current().record("lock_group", &lock_group.as_str());
        tracing::Span::current().record("lock_id", &lock_id.as_str());

        let handle = Lock::create(lock_group, lock_id, self.owner_name.to_string(), &opts);
        self.emit(
            Severity::Info,
            Some(handle.unique_lock_identifier()),
            format!("acquiring {}", handle.unique_lock_identifier()),
        );
        self.acquire(handle, 0).await
    }

    async fn acquire(&self, handle: Lock, mut retry_count: u32) -> Result<Lock, Error> {
        'acquire: loop {
            if handle.is_acquired() {
                return Err(Error::lock_not_granted(format!(
                    "{} is already acquired by this handle",
                    handle.unique_lock_identifier()
                )));
            }
            if let Some(max) = handle.max_retry_count {
                if retry_count > max {
                    return Err(Error::lock_not_granted(format!(
                        "exhausted retries acquiring {}",
                        handle.unique_lock_identifier()
                    )));
                }
            }
            retry_count += 1;

            let observed = self.store.get_lock(&handle.lock_group, &handle.lock_id).await?;

            let existing = match observed {
                None => {
                    if self.try_create(&handle).await? {
                        return self.commit(handle).await;
                    }
                    continue 'acquire;
                }
                Some(existing) => existing,
            };

            let now = OffsetDateTime::now_utc();
            if handle.trust_local_time && existing.lease_expiration_time_passed(now) {
                if self.try_steal(&handle, &existing).await? {
                    return self.commit(handle).await;
                }
                continue 'acquire;
            }

            if handle.trust_local_time {
                tokio::time::sleep(handle.wait_duration.unwrap_or_default()).await;
                continue 'acquire;
            }

            tokio::time::sleep(StdDuration::from_millis(existing.lease_duration_in_ms.max(0) as u64)).await;
            if self.try_steal(&handle, &existing).await? {
                return self.commit(handle).await;
            }
            continue 'acquire;
        }
    }

    /// Attempts a conditional create. `Ok(true)` on success, `Ok(false)` if the record
    /// appeared concurrently (the caller re-reads and re-selects a path).
    async fn try_create(&self, handle: &Lock) -> Result<bool, Error> {
        handle.attempt_locking(Uuid::new_v4(), OffsetDateTime::now_utc());
        match self.store.create_new_lock(handle).await {
            Ok(()) => Ok(true),
            Err(Error::ConditionalCheckFailed) => {
                handle.reset_locking_attempt();
                self.emit(
                    Severity::Info,
                    Some(handle.unique_lock_identifier()),
                    format!("create raced for {}, re-reading", handle.unique_lock_identifier()),
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Attempts a conditional steal against the last-observed `existing` record.
    /// `Ok(true)` on success, `Ok(false)` if the record changed underneath us.
    async fn try_steal(&self, handle: &Lock, existing: &RecordAttributes) -> Result<bool, Error> {
        handle.attempt_locking(Uuid::new_v4(), OffsetDateTime::now_utc());
        match self.store.update_lock_with_new_content(existing, handle).await {
            Ok(()) => Ok(true),
            Err(Error::ConditionalCheckFailed) => {
                handle.reset_locking_attempt();
                self.emit(
                    Severity::Info,
                    Some(handle.unique_lock_identifier()),
                    format!("steal raced for {}, re-reading", handle.unique_lock_identifier()),
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn commit(&self, handle: Lock) -> Result<Lock, Error> {
        handle.acquired();
        self.registry
            .lock()
            .unwrap()
            .insert(handle.unique_lock_identifier(), handle.clone());
        self.emit(
            Severity::Info,
            Some(handle.unique_lock_identifier()),
            format!("acquired {}", handle.unique_lock_identifier()),
        );

        if handle.prolong_lease_enabled {
            self.schedule_prolongation(handle.clone());
        }

        Ok(handle)
    }

    /// Spawns the long-lived renewal task for a newly-acquired `handle`. Stops (without
    /// rescheduling) the moment the handle is released, deregistered, or the backend
    /// reports the record no longer matches — it must not silently keep renewing a lock
    /// it no longer owns.
    ///
    /// The check-then-write span of each renewal holds `handle.write_guard`, the same
    /// mutex `release_lock`/`release_all_locks` hold across their own write. Without it,
    /// a renewal past the `is_acquired` check can race a concurrent release: both read
    /// the handle's current version before either write lands, so whichever write wins
    /// leaves the loser's conditional predicate failing against a version it no longer
    /// recognises — for release that means the record survives undeleted. The mutex
    /// forces the two writes apart; since the handle's version/`is_acquired` state is
    /// shared (via `Arc`) between every clone of the handle, whichever side runs second
    /// observes the first side's committed effect before building its own request.
    fn schedule_prolongation(&self, handle: Lock) {
        let client = self.clone();
        let cancellation = handle.cancellation.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(handle.prolong_every) => {}
                }

                let _permit = handle.write_guard.lock().await;

                let still_registered = client
                    .registry
                    .lock()
                    .unwrap()
                    .contains_key(&handle.unique_lock_identifier());
                if !handle.is_acquired() || !still_registered {
                    return;
                }

                let new_version = Uuid::new_v4();
                let now = OffsetDateTime::now_utc();
                match client.store.update_record_version_and_time(&handle, new_version, now).await {
                    Ok(()) => {
                        handle.prolonged(new_version, now);
                        client.emit(
                            Severity::Info,
                            Some(handle.unique_lock_identifier()),
                            format!("renewed {}", handle.unique_lock_identifier()),
                        );
                    }
                    Err(Error::ConditionalCheckFailed) => {
                        client.emit(
                            Severity::Warn,
                            Some(handle.unique_lock_identifier()),
                            format!(
                                "{} was stolen or deleted; stopping renewal",
                                handle.unique_lock_identifier()
                            ),
                        );
                        client.registry.lock().unwrap().remove(&handle.unique_lock_identifier());
                        return;
                    }
                    Err(err) => {
                        client.emit(
                            Severity::Error,
                            Some(handle.unique_lock_identifier()),
                            format!("renewal failed for {}: {err}", handle.unique_lock_identifier()),
                        );
                        return;
                    }
                }
                // _permit drops here, before the next sleep, so release never blocks
                // for a full prolong_every waiting on a renewal that isn't running.
            }
        });
    }

    /// Releases a single held lock. Idempotent: calling this twice on the same handle,
    /// or on a handle whose record is already gone, is not an error.
    #[instrument(skip(self, lock), fields(lock = %lock.unique_lock_identifier()))]
    pub async fn release_lock(&self, lock: &Lock) -> Result<(), Error> {
        self.registry.lock().unwrap().remove(&lock.unique_lock_identifier());
        self.release_locked(lock).await
    }

    /// Releases every lock currently held by this instance. Snapshots and clears the
    /// registry first, marks every handle released, then issues the backend deletes
    /// concurrently and waits for all of them before returning.
    pub async fn release_all_locks(&self) -> Result<(), Error> {
        let handles: Vec<Lock> = self.registry.lock().unwrap().drain().map(|(_, lock)| lock).collect();

        let results = futures::future::join_all(handles.iter().map(|lock| self.release_locked(lock))).await;
        results.into_iter().collect::<Result<Vec<()>, Error>>()?;
        Ok(())
    }

    /// Flips the handle to released and issues its conditional delete, holding
    /// `write_guard` across both so a racing renewal can never be mid-write underneath
    /// this delete (see [`Self::schedule_prolongation`]).
    async fn release_locked(&self, lock: &Lock) -> Result<(), Error> {
        let _permit = lock.write_guard.lock().await;
        lock.released();

        match self.store.delete_lock(lock).await {
            Ok(()) => {
                self.emit(
                    Severity::Info,
                    Some(lock.unique_lock_identifier()),
                    format!("released {}", lock.unique_lock_identifier()),
                );
                Ok(())
            }
            Err(Error::ConditionalCheckFailed) => {
                self.emit(
                    Severity::Warn,
                    Some(lock.unique_lock_identifier()),
                    format!(
                        "delete for {} raced; already gone or reassigned",
                        lock.unique_lock_identifier()
                    ),
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    /// In-memory [`LockStore`] for exercising the coordinator without a network dependency.
    #[derive(Default)]
    struct FakeStore {
        records: Mutex<Map<(String, String), RecordAttributes>>,
    }

    #[async_trait]
    impl LockStore for FakeStore {
        async fn get_lock(&self, lock_group: &str, lock_id: &str) -> Result<Option<RecordAttributes>, Error> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(&(lock_group.to_owned(), lock_id.to_owned()))
                .cloned())
        }

        async fn create_new_lock(&self, lock: &Lock) -> Result<(), Error> {
            let mut records = self.records.lock().unwrap();
            let key = (lock.lock_group().to_owned(), lock.lock_id().to_owned());
            if records.contains_key(&key) {
                return Err(Error::ConditionalCheckFailed);
            }
            records.insert(key, record_from(lock));
            Ok(())
        }

        async fn update_record_version_and_time(
            &self,
            lock: &Lock,
            new_version: Uuid,
            when: OffsetDateTime,
        ) -> Result<(), Error> {
            let mut records = self.records.lock().unwrap();
            let key = (lock.lock_group().to_owned(), lock.lock_id().to_owned());
            let Some(record) = records.get_mut(&key) else {
                return Err(Error::ConditionalCheckFailed);
            };
            if record.record_version_number != lock.record_version_number().unwrap() || record.owner_name != lock.owner_name()
            {
                return Err(Error::ConditionalCheckFailed);
            }
            record.record_version_number = new_version;
            record.last_updated_time_in_ms = crate::lock::millis_since_epoch(when);
            Ok(())
        }

        async fn update_lock_with_new_content(
            &self,
            existing: &RecordAttributes,
            new_lock: &Lock,
        ) -> Result<(), Error> {
            let mut records = self.records.lock().unwrap();
            let key = (new_lock.lock_group().to_owned(), new_lock.lock_id().to_owned());
            let Some(record) = records.get(&key) else {
                return Err(Error::ConditionalCheckFailed);
            };
            if record.record_version_number != existing.record_version_number {
                return Err(Error::ConditionalCheckFailed);
            }
            records.insert(key, record_from(new_lock));
            Ok(())
        }

        async fn delete_lock(&self, lock: &Lock) -> Result<(), Error> {
            let mut records = self.records.lock().unwrap();
            let key = (lock.lock_group().to_owned(), lock.lock_id().to_owned());
            match records.get(&key) {
                Some(record)
                    if record.record_version_number == lock.record_version_number().unwrap()
                        && record.owner_name == lock.owner_name() =>
                {
                    records.remove(&key);
                    Ok(())
                }
                _ => Err(Error::ConditionalCheckFailed),
            }
        }
    }

    fn record_from(lock: &Lock) -> RecordAttributes {
        RecordAttributes {
            owner_name: lock.owner_name().to_owned(),
            record_version_number: lock.record_version_number().unwrap(),
            last_updated_time_in_ms: lock.last_updated_time_in_ms().unwrap(),
            lease_duration_in_ms: lock.lease_duration_in_ms,
            additional_attributes: (*lock.additional_attributes).clone(),
        }
    }

    fn client() -> LockClient {
        LockClient::new(
            Arc::new(FakeStore::default()),
            Arc::new(TableDescriptor::default()),
            None,
        )
    }

    #[tokio::test]
    async fn acquires_on_empty_table() {
        let client = client();
        let lock = client.lock("g", "i", LockOptions::default()).await.unwrap();
        assert!(lock.is_acquired());
        assert!(lock.record_version_number().is_some());
        client.release_lock(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn distinct_groups_both_succeed() {
        let client = client();
        let a = client.lock("g1", "i", LockOptions::default()).await.unwrap();
        let b = client.lock("g2", "i", LockOptions::default()).await.unwrap();
        assert!(a.is_acquired());
        assert!(b.is_acquired());
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let client = client();
        let opts = LockOptions::default().prolong_lease_enabled(false);
        let lock = client.lock("g", "i", opts.clone()).await.unwrap();
        client.release_lock(&lock).await.unwrap();
        let lock2 = client.lock("g", "i", opts).await.unwrap();
        assert!(lock2.is_acquired());
    }

    #[tokio::test]
    async fn double_release_is_not_an_error() {
        let client = client();
        let lock = client.lock("g", "i", LockOptions::default()).await.unwrap();
        client.release_lock(&lock).await.unwrap();
        client.release_lock(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn release_all_locks_is_idempotent_and_empties_registry() {
        let client = client();
        client.lock("g", "a", LockOptions::default()).await.unwrap();
        client.lock("g", "b", LockOptions::default()).await.unwrap();
        client.release_all_locks().await.unwrap();
        client.release_all_locks().await.unwrap();
        assert!(client.registry.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_retry_count_zero_fails_fast_under_contention() {
        let client = client();
        let held = client
            .lock(
                "g",
                "i",
                LockOptions::default().prolong_lease_enabled(false).lease_duration(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert!(held.is_acquired());

        let other = LockClient::new(client.store.clone(), client.table.clone(), None);
        let err = other
            .lock(
                "g",
                "i",
                LockOptions::default().max_retry_count(0).trust_local_time(true).wait_duration(Duration::ZERO),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockNotGranted(_)));
    }

    #[tokio::test]
    async fn trust_local_time_steals_expired_lock_without_waiting_full_lease() {
        let client = client();
        let opts = LockOptions::default()
            .prolong_lease_enabled(false)
            .lease_duration(Duration::from_millis(50));
        let first = client.lock("g", "i", opts).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let other = LockClient::new(client.store.clone(), client.table.clone(), None);
        let second = other
            .lock(
                "g",
                "i",
                LockOptions::default()
                    .trust_local_time(true)
                    .wait_duration(Duration::ZERO)
                    .max_retry_count(5),
            )
            .await
            .unwrap();

        assert!(second.is_acquired());
        assert_ne!(first.owner_name(), second.owner_name());
    }

    #[tokio::test]
    async fn already_acquired_handle_cannot_be_relocked() {
        let client = client();
        let lock = client.lock("g", "i", LockOptions::default()).await.unwrap();
        // re-running the state machine directly on an already-acquired handle fails fast.
        let err = client.acquire(lock, 0).await.unwrap_err();
        assert!(matches!(err, Error::LockNotGranted(_)));
    }

    #[tokio::test]
    async fn fifty_concurrent_contenders_all_eventually_acquire_one_at_a_time() {
        let base = client();
        let store = base.store.clone();
        let table = base.table.clone();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let table = table.clone();
                tokio::spawn(async move {
                    let contender = LockClient::new(store, table, None);
                    contender
                        .lock(
                            "g",
                            "i",
                            LockOptions::default()
                                .prolong_lease_enabled(false)
                                .lease_duration(Duration::from_millis(30))
                                .trust_local_time(true)
                                .wait_duration(Duration::from_millis(2)),
                        )
                        .await
                })
            })
            .collect();

        let results = tokio::time::timeout(Duration::from_secs(15), futures::future::join_all(tasks))
            .await
            .expect("50 contenders serialized by a 30ms lease should all resolve well inside 15s");

        // every contender must have gotten its own exclusive turn: the store's version
        // predicate allows only one write to land per expiry window, so 50 distinct,
        // successful acquisitions is only possible if they were serialized one at a time.
        let mut versions = std::collections::HashSet::new();
        for result in results {
            let lock = result
                .expect("task should not panic")
                .expect("every contender should eventually acquire");
            assert!(lock.is_acquired());
            assert!(
                versions.insert(lock.record_version_number().unwrap()),
                "two contenders acquired with the same record_version_number"
            );
        }
        assert_eq!(versions.len(), 50);
    }
}
