//! The orchestrator. A pass walks three strictly sequential phases, each
//! re-reading its working set fresh at phase start, so records dirtied by UI
//! activity mid-pass land in the next pass instead of being lost.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connectivity::ConnectivityMonitor;
use crate::db::models::OperationType;
use crate::db::operations::{
    delete_queue_item, get_pending_queue_items, get_unsynced_sessions, get_unsynced_set_records,
    mark_entity_synced, mark_session_synced, mark_set_records_synced, record_queue_failure,
};
use crate::events::{Listeners, Subscription};
use crate::remote::{RemoteClient, SessionUpsert, SetBatch, SetCreate};
use crate::sync::{MAX_RETRIES, SyncProgress, SyncStatus};

/// Clears the re-entrancy guard on every exit path of a pass.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Triggers {
    timer: JoinHandle<()>,
    restored: JoinHandle<()>,
    _subscription: Subscription<bool>,
}

pub struct SyncEngine {
    pool: SqlitePool,
    remote: RemoteClient,
    monitor: Arc<ConnectivityMonitor>,
    interval: Duration,
    running: AtomicBool,
    status: Mutex<SyncStatus>,
    status_listeners: Listeners<SyncStatus>,
    triggers: Mutex<Option<Triggers>>,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        remote: RemoteClient,
        monitor: Arc<ConnectivityMonitor>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            remote,
            monitor,
            interval,
            running: AtomicBool::new(false),
            status: Mutex::new(SyncStatus::Idle),
            status_listeners: Listeners::new(),
            triggers: Mutex::new(None),
        })
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe_status(
        &self,
        cb: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription<SyncStatus> {
        self.status_listeners.subscribe(cb)
    }

    fn publish(&self, status: SyncStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        self.status_listeners.emit(&status);
    }

    /// Wire up the two triggers: a periodic timer and the monitor's
    /// offline-to-online transition. Idempotent; `stop` tears both down.
    pub fn start(self: &Arc<Self>) {
        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        if triggers.is_some() {
            debug!("SyncEngine::start called while already started");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.monitor.subscribe(move |online: &bool| {
            if *online {
                let _ = tx.send(());
            }
        });

        let engine = self.clone();
        let restored = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                debug!("connectivity restored, triggering sync");
                engine.sync_now().await;
            }
        });

        let engine = self.clone();
        let interval = self.interval;
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                engine.sync_now().await;
            }
        });

        info!("Sync engine started (interval {:?})", self.interval);
        *triggers = Some(Triggers {
            timer,
            restored,
            _subscription: subscription,
        });
    }

    pub fn stop(&self) {
        let taken = self
            .triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(triggers) = taken {
            triggers.timer.abort();
            triggers.restored.abort();
            info!("Sync engine stopped");
        }
    }

    /// Run one pass. Refuses while offline (zero network calls, flags
    /// untouched); overlapping invocations are coalesced, never queued.
    /// Failures surface only on the status channel.
    pub async fn sync_now(&self) {
        if !self.monitor.is_online() {
            debug!("sync skipped: monitor reports offline");
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already in progress; trigger coalesced");
            return;
        }
        let _guard = PassGuard(&self.running);

        self.publish(SyncStatus::Syncing(None));
        match self.run_pass().await {
            Ok(()) => {
                debug!("sync pass completed");
                self.publish(SyncStatus::Idle);
            }
            Err(e) => {
                error!("sync pass failed: {:#}", e);
                self.publish(SyncStatus::Error);
            }
        }
    }

    async fn run_pass(&self) -> Result<()> {
        self.sync_sessions().await?;
        self.sync_set_records().await?;
        self.sync_queue().await?;
        Ok(())
    }

    /// Phase 1: upsert every unsynced session, one call each. Per-item
    /// failures leave that session unsynced and the phase moves on.
    async fn sync_sessions(&self) -> Result<()> {
        let sessions = get_unsynced_sessions(&self.pool).await?;
        if sessions.is_empty() {
            return Ok(());
        }
        let total = sessions.len();
        info!("Sessions phase: {} unsynced", total);

        for (index, session) in sessions.iter().enumerate() {
            match self
                .remote
                .upsert_session(&SessionUpsert::from(session))
                .await
            {
                // Confirms only the state that was read above; a mutation
                // that raced the upload keeps the session dirty.
                Ok(()) => {
                    mark_session_synced(&self.pool, &session.id, session.updated_at).await?
                }
                Err(e) => warn!("Session {} upsert failed, will retry next pass: {}", session.id, e),
            }
            self.publish(SyncStatus::Syncing(Some(SyncProgress {
                current: index + 1,
                total,
            })));
        }
        Ok(())
    }

    /// Phase 2: batch unsynced set records per session, one call per batch.
    /// A 2xx marks the whole batch together; a failure leaves the whole
    /// group unsynced.
    async fn sync_set_records(&self) -> Result<()> {
        let records = get_unsynced_set_records(&self.pool).await?;
        if records.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<&str, Vec<&crate::db::models::SetRecord>> = BTreeMap::new();
        for record in &records {
            groups
                .entry(record.session_id.as_str())
                .or_default()
                .push(record);
        }
        let total = groups.len();
        info!("Sets phase: {} records in {} batches", records.len(), total);

        for (index, (session_id, group)) in groups.iter().enumerate() {
            let batch = SetBatch {
                sets: group.iter().map(|r| SetCreate::from(*r)).collect(),
            };
            match self.remote.create_sets(session_id, &batch).await {
                Ok(()) => {
                    let ids: Vec<String> = group.iter().map(|r| r.id.clone()).collect();
                    mark_set_records_synced(&self.pool, &ids).await?;
                }
                Err(e) => warn!(
                    "Set batch for session {} failed ({} records), will retry next pass: {}",
                    session_id,
                    group.len(),
                    e
                ),
            }
            self.publish(SyncStatus::Syncing(Some(SyncProgress {
                current: index + 1,
                total,
            })));
        }
        Ok(())
    }

    /// Phase 3: dispatch pending queue items oldest first. Success removes
    /// the item; failure bumps its attempt count. Items at the retry bound
    /// never reach this loop.
    async fn sync_queue(&self) -> Result<()> {
        let items = get_pending_queue_items(&self.pool, MAX_RETRIES).await?;
        if items.is_empty() {
            return Ok(());
        }
        let total = items.len();
        info!("Queue phase: {} pending items", total);

        for (index, item) in items.iter().enumerate() {
            match self.remote.dispatch(item).await {
                Ok(()) => {
                    delete_queue_item(&self.pool, &item.id).await?;
                    if item.operation_type != OperationType::Delete {
                        mark_entity_synced(&self.pool, item.entity_type, &item.entity_id).await?;
                    }
                }
                Err(e) => {
                    warn!(
                        "Queue item {} ({:?} {:?}) failed on attempt {}: {}",
                        item.id,
                        item.operation_type,
                        item.entity_type,
                        item.attempts + 1,
                        e
                    );
                    record_queue_failure(&self.pool, &item.id, &e.to_string()).await?;
                }
            }
            self.publish(SyncStatus::Syncing(Some(SyncProgress {
                current: index + 1,
                total,
            })));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::models::{
        EntityType, QueueItem, Session, SessionExercise, SessionStatus, SetRecord,
    };
    use crate::db::operations::*;
    use crate::remote::{RemoteError, RemoteRequest};
    use crate::sync::DEFAULT_SYNC_INTERVAL;
    use std::sync::Condvar;
    use std::sync::Mutex as StdMutex;

    async fn engine_with(
        responder: impl Fn(&RemoteRequest) -> Result<(), RemoteError> + Send + Sync + 'static,
    ) -> (SqlitePool, Arc<SyncEngine>) {
        let pool = db::open_memory().await.unwrap();
        let monitor = ConnectivityMonitor::new(true, "http://localhost:9").unwrap();
        let remote = RemoteClient::new_mock_fn(responder);
        let engine = SyncEngine::new(pool.clone(), remote, monitor, DEFAULT_SYNC_INTERVAL);
        (pool, engine)
    }

    #[tokio::test]
    async fn one_pass_syncs_session_and_batches_its_sets() {
        let (pool, engine) = engine_with(|_| Ok(())).await;

        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();
        let exercise = SessionExercise::new(&session.id, "ex-1", "Back Squat", 0, 5, 5, Some(100.0));
        upsert_session_exercise(&pool, &exercise).await.unwrap();
        let set1 = SetRecord::new(&session.id, &exercise.id, 1, 5, Some(100.0), Some(8.0));
        let set2 = SetRecord::new(&session.id, &exercise.id, 2, 5, Some(100.0), Some(8.5));
        insert_set_record(&pool, &set1).await.unwrap();
        insert_set_record(&pool, &set2).await.unwrap();

        engine.sync_now().await;

        assert!(get_session(&pool, &session.id).await.unwrap().unwrap().synced);
        assert!(get_unsynced_set_records(&pool).await.unwrap().is_empty());
        assert_eq!(engine.status(), SyncStatus::Idle);

        let recorded = engine.remote.recorded_requests();
        assert_eq!(recorded.len(), 2);
        assert!(matches!(&recorded[0], RemoteRequest::UpsertSession(body) if body.id == session.id));
        match &recorded[1] {
            RemoteRequest::CreateSets { session_id, batch } => {
                assert_eq!(session_id, &session.id);
                assert_eq!(batch.sets.len(), 2);
            }
            other => panic!("expected CreateSets, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn per_item_failures_are_isolated() {
        let failing = Session::new("athlete-1", "plan-1", None);
        let failing_id = failing.id.clone();
        let (pool, engine) = engine_with(move |request| match request {
            RemoteRequest::UpsertSession(body) if body.id == failing_id => {
                Err(RemoteError::Mock("500".into()))
            }
            _ => Ok(()),
        })
        .await;

        let healthy = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &failing).await.unwrap();
        upsert_session(&pool, &healthy).await.unwrap();

        engine.sync_now().await;

        assert!(!get_session(&pool, &failing.id).await.unwrap().unwrap().synced);
        assert!(get_session(&pool, &healthy.id).await.unwrap().unwrap().synced);
        // Per-item failure is not a pass failure.
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn offline_pass_makes_zero_calls_and_changes_nothing() {
        let (pool, engine) = engine_with(|_| Ok(())).await;
        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        engine.monitor.set_online(false);
        engine.sync_now().await;

        assert!(engine.remote.recorded_requests().is_empty());
        assert!(!get_session(&pool, &session.id).await.unwrap().unwrap().synced);
        assert_eq!(engine.status(), SyncStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_triggers_are_coalesced() {
        let gate = Arc::new((StdMutex::new(false), Condvar::new()));
        let g = gate.clone();
        let (pool, engine) = engine_with(move |_| {
            let (lock, cvar) = &*g;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cvar.wait(released).unwrap();
            }
            Ok(())
        })
        .await;

        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_now().await })
        };
        // Wait until the first pass has claimed the guard and gone remote.
        while engine.remote.recorded_requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A second trigger while the pass is in flight performs zero calls.
        engine.sync_now().await;
        assert_eq!(engine.remote.recorded_requests().len(), 1);

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        first.await.unwrap();

        assert_eq!(engine.remote.recorded_requests().len(), 1);
        assert!(get_session(&pool, &session.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn queue_items_never_exceed_retry_bound() {
        let (pool, engine) = engine_with(|request| match request {
            RemoteRequest::Dispatch { .. } => Err(RemoteError::Mock("503".into())),
            _ => Ok(()),
        })
        .await;

        let item = QueueItem::new(
            OperationType::Delete,
            EntityType::Set,
            "set-1",
            &serde_json::json!({ "id": "set-1" }),
        );
        enqueue(&pool, &item).await.unwrap();

        for _ in 0..5 {
            engine.sync_now().await;
        }

        // Dispatched exactly MAX_RETRIES times across five passes, then
        // skipped; the stale item stays visible.
        assert_eq!(engine.remote.recorded_requests().len() as i64, MAX_RETRIES);
        let all = get_queue_items(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].attempts, MAX_RETRIES);
        assert!(all[0].error.is_some());
    }

    #[tokio::test]
    async fn queue_success_removes_item_and_marks_entity() {
        let (pool, engine) = engine_with(|_| Ok(())).await;

        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();
        mark_session_synced(&pool, &session.id, session.updated_at)
            .await
            .unwrap();
        let exercise = SessionExercise::new(&session.id, "ex-1", "Deadlift", 0, 1, 5, None);
        upsert_session_exercise(&pool, &exercise).await.unwrap();
        let item = QueueItem::new(
            OperationType::Create,
            EntityType::Exercise,
            &exercise.id,
            &serde_json::json!({ "id": exercise.id, "session_id": session.id }),
        );
        enqueue(&pool, &item).await.unwrap();

        engine.sync_now().await;

        assert!(get_queue_items(&pool).await.unwrap().is_empty());
        let exercise = get_session_exercise(&pool, &exercise.id).await.unwrap().unwrap();
        assert!(exercise.synced);
    }

    #[tokio::test]
    async fn retried_session_payloads_are_identical() {
        let (pool, engine) = engine_with(|_| Ok(())).await;
        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        engine.sync_now().await;
        // Resend with no intervening local change.
        upsert_session(&pool, &session).await.unwrap();
        engine.sync_now().await;

        let recorded = engine.remote.recorded_requests();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], recorded[1]);
    }

    #[tokio::test]
    async fn post_sync_mutation_is_resent_next_pass() {
        let (pool, engine) = engine_with(|_| Ok(())).await;
        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        engine.sync_now().await;
        pause_session(&pool, &session.id).await.unwrap();
        engine.sync_now().await;

        let recorded = engine.remote.recorded_requests();
        assert_eq!(recorded.len(), 2);
        match &recorded[1] {
            RemoteRequest::UpsertSession(body) => assert_eq!(body.status, "paused"),
            other => panic!("expected UpsertSession, got {:?}", other),
        }
        assert!(get_session(&pool, &session.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mutation_during_upload_stays_dirty_and_is_resent() {
        let gate = Arc::new((StdMutex::new(false), Condvar::new()));
        let g = gate.clone();
        let (pool, engine) = engine_with(move |_| {
            let (lock, cvar) = &*g;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = cvar.wait(released).unwrap();
            }
            Ok(())
        })
        .await;

        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_now().await })
        };
        while engine.remote.recorded_requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The pause lands while the upload of the active state is in flight.
        pause_session(&pool, &session.id).await.unwrap();

        {
            let (lock, cvar) = &*gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        first.await.unwrap();

        // The pass must not stamp synced over the newer state.
        let found = get_session(&pool, &session.id).await.unwrap().unwrap();
        assert_eq!(found.status, SessionStatus::Paused);
        assert!(!found.synced);
        assert_eq!(get_unsynced_sessions(&pool).await.unwrap().len(), 1);

        engine.sync_now().await;
        let recorded = engine.remote.recorded_requests();
        assert_eq!(recorded.len(), 2);
        match &recorded[1] {
            RemoteRequest::UpsertSession(body) => assert_eq!(body.status, "paused"),
            other => panic!("expected UpsertSession, got {:?}", other),
        }
        assert!(get_session(&pool, &session.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn exercise_stays_dirty_while_newer_progress_is_queued() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let h = healthy.clone();
        let (pool, engine) = engine_with(move |request| match request {
            RemoteRequest::Dispatch { payload, .. }
                if payload["sets_completed"] == 2 && !h.load(Ordering::SeqCst) =>
            {
                Err(RemoteError::Mock("503".into()))
            }
            _ => Ok(()),
        })
        .await;

        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();
        let exercise = SessionExercise::new(&session.id, "ex-1", "Back Squat", 0, 5, 5, None);
        upsert_session_exercise(&pool, &exercise).await.unwrap();
        record_exercise_set_completed(&pool, &exercise.id, false)
            .await
            .unwrap();
        record_exercise_set_completed(&pool, &exercise.id, false)
            .await
            .unwrap();

        engine.sync_now().await;

        // The first progress item succeeded, but the newer one is still
        // pending; the exercise must not read as synced yet.
        assert_eq!(get_queue_items(&pool).await.unwrap().len(), 1);
        let found = get_session_exercise(&pool, &exercise.id).await.unwrap().unwrap();
        assert!(!found.synced);
        assert_eq!(found.sets_completed, 2);

        healthy.store(true, Ordering::SeqCst);
        engine.sync_now().await;

        assert!(get_queue_items(&pool).await.unwrap().is_empty());
        let found = get_session_exercise(&pool, &exercise.id).await.unwrap().unwrap();
        assert!(found.synced);
    }

    #[tokio::test]
    async fn status_channel_reports_progress_and_settles_idle() {
        let (pool, engine) = engine_with(|_| Ok(())).await;
        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = engine.subscribe_status(move |status| s.lock().unwrap().push(*status));

        engine.sync_now().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&SyncStatus::Syncing(None)));
        assert_eq!(seen.last(), Some(&SyncStatus::Idle));
        assert!(seen.contains(&SyncStatus::Syncing(Some(SyncProgress {
            current: 1,
            total: 1
        }))));
    }

    #[tokio::test]
    async fn storage_failure_mid_pass_ends_in_error_status() {
        let (pool, engine) = engine_with(|_| Ok(())).await;
        pool.close().await;

        engine.sync_now().await;
        assert_eq!(engine.status(), SyncStatus::Error);

        // The guard was released; a later trigger runs again.
        engine.sync_now().await;
        assert_eq!(engine.status(), SyncStatus::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_timer_triggers_a_pass() {
        let pool = db::open_memory().await.unwrap();
        let monitor = ConnectivityMonitor::new(true, "http://localhost:9").unwrap();
        let engine = SyncEngine::new(
            pool.clone(),
            RemoteClient::new_mock_ok(),
            monitor,
            Duration::from_millis(25),
        );
        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        engine.start();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if get_session(&pool, &session.id).await.unwrap().unwrap().synced {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connectivity_restored_triggers_a_pass() {
        let (pool, engine) = engine_with(|_| Ok(())).await;
        let session = Session::new("athlete-1", "plan-1", None);
        upsert_session(&pool, &session).await.unwrap();

        engine.monitor.set_online(false);
        engine.start();
        engine.monitor.set_online(true);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if get_session(&pool, &session.id).await.unwrap().unwrap().synced {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "sync never triggered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        engine.stop();
    }
}
