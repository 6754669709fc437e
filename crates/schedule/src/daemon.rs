//! Schedule daemon — polls the store and fires due schedules.
//!
//! Many nodes may run the daemon against one store. Each due schedule is
//! claimed with an advisory lock before execution; nodes that lose the
//! race skip it. The lock is renewed at half its TTL while the workflow
//! runs and released on every exit path.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use visor_domain::cancel::CancelToken;
use visor_domain::error::Result;

use crate::model::Schedule;
use crate::store::{LockToken, ScheduleStoreBackend};

/// Runs a schedule's workflow. Implemented over the engine by the
/// binary; tests substitute recorders.
#[async_trait::async_trait]
pub trait ScheduleExecutor: Send + Sync {
    async fn execute(&self, schedule: &Schedule) -> Result<()>;
}

pub struct ScheduleDaemon {
    store: Arc<dyn ScheduleStoreBackend>,
    executor: Arc<dyn ScheduleExecutor>,
    node_id: String,
    tick: std::time::Duration,
    lock_ttl: Duration,
}

impl ScheduleDaemon {
    pub fn new(
        store: Arc<dyn ScheduleStoreBackend>,
        executor: Arc<dyn ScheduleExecutor>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            executor,
            node_id: node_id.into(),
            tick: std::time::Duration::from_secs(10),
            lock_ttl: Duration::seconds(60),
        }
    }

    pub fn with_tick(mut self, tick: std::time::Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Poll until cancelled. In-flight executions complete before exit.
    pub async fn run(&self, cancel: CancelToken) {
        tracing::info!(node_id = %self.node_id, tick = ?self.tick, "schedule daemon started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let fired = self.tick_once(Utc::now()).await;
            if fired > 0 {
                tracing::debug!(node_id = %self.node_id, fired, "tick complete");
            }
            tokio::time::sleep(self.tick).await;
        }
        tracing::info!(node_id = %self.node_id, "schedule daemon stopped");
    }

    /// One evaluation pass. Returns how many schedules this node fired.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> usize {
        let due = match self.store.get_due_schedules(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "failed to query due schedules");
                return 0;
            }
        };

        let mut fired = 0usize;
        for schedule in due {
            let lock = match self
                .store
                .try_acquire_lock(&schedule.id, &self.node_id, self.lock_ttl)
                .await
            {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    tracing::debug!(
                        schedule_id = %schedule.id,
                        node_id = %self.node_id,
                        "another node owns this schedule, skipping"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "lock acquisition failed");
                    continue;
                }
            };

            fired += 1;
            self.fire(schedule, &lock).await;
            // Scoped release: runs after success, failure, and executor
            // panics turned into task errors alike.
            if let Err(e) = self.store.release_lock(&lock).await {
                tracing::warn!(schedule_id = %lock.schedule_id, error = %e, "lock release failed");
            }
        }
        fired
    }

    async fn fire(&self, schedule: Schedule, lock: &LockToken) {
        tracing::info!(
            schedule_id = %schedule.id,
            workflow = %schedule.workflow_ref,
            node_id = %self.node_id,
            "firing schedule"
        );

        // Renew at half the TTL while the workflow runs.
        let renewer = {
            let store = self.store.clone();
            let token = lock.clone();
            let ttl = self.lock_ttl;
            let period = std::time::Duration::from_millis((ttl.num_milliseconds() as u64 / 2).max(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    match store.renew_lock(&token, ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(schedule_id = %token.schedule_id, "schedule lock lost");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(schedule_id = %token.schedule_id, error = %e, "lock renewal failed");
                            break;
                        }
                    }
                }
            })
        };

        let result = self.executor.execute(&schedule).await;
        renewer.abort();

        let succeeded = match &result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(schedule_id = %schedule.id, error = %e, "scheduled workflow failed");
                false
            }
        };

        // Re-read so concurrent edits (pause, expression change) survive.
        let mut updated = match self.store.get(&schedule.id).await {
            Ok(Some(current)) => current,
            _ => schedule,
        };
        updated.record_run(Utc::now(), succeeded);
        if let Err(e) = self.store.update(&updated).await {
            tracing::warn!(schedule_id = %updated.id, error = %e, "failed to record schedule run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScheduleKind, ScheduleStatus};
    use crate::sqlite::SqliteScheduleStore;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct Recorder {
        runs: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait::async_trait]
    impl ScheduleExecutor for Recorder {
        async fn execute(&self, schedule: &Schedule) -> Result<()> {
            self.runs.lock().push(schedule.workflow_ref.clone());
            if self.fail {
                Err(visor_domain::Error::Internal("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn store_with_due(dir: &tempfile::TempDir) -> (Arc<SqliteScheduleStore>, Schedule) {
        let store = Arc::new(SqliteScheduleStore::open(&dir.path().join("s.db")).unwrap());
        store.initialize().await.unwrap();
        let s = Schedule::new(
            "alice",
            ScheduleKind::Recurring,
            "0 * * * *",
            "nightly",
            Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap(),
        )
        .unwrap();
        let s = store.create(s, 10).await.unwrap();
        (store, s)
    }

    #[tokio::test]
    async fn fires_due_schedule_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let (store, s) = store_with_due(&dir).await;
        let exec = Recorder::new(false);
        let daemon = ScheduleDaemon::new(store.clone(), exec.clone(), "node-a");

        let when = s.next_run_at.unwrap() + Duration::minutes(1);
        let fired = daemon.tick_once(when).await;
        assert_eq!(fired, 1);
        assert_eq!(exec.runs.lock().as_slice(), &["nightly".to_string()]);

        let updated = store.get(&s.id).await.unwrap().unwrap();
        assert_eq!(updated.run_count, 1);
        assert_eq!(updated.failure_count, 0);
        assert!(updated.next_run_at.unwrap() > when);
        // Lock released.
        assert!(updated.lock_token.is_none());
    }

    #[tokio::test]
    async fn nothing_due_nothing_fires() {
        let dir = tempfile::tempdir().unwrap();
        let (store, s) = store_with_due(&dir).await;
        let exec = Recorder::new(false);
        let daemon = ScheduleDaemon::new(store, exec.clone(), "node-a");

        let before = s.next_run_at.unwrap() - Duration::minutes(5);
        assert_eq!(daemon.tick_once(before).await, 0);
        assert!(exec.runs.lock().is_empty());
    }

    #[tokio::test]
    async fn failure_increments_failure_count() {
        let dir = tempfile::tempdir().unwrap();
        let (store, s) = store_with_due(&dir).await;
        let exec = Recorder::new(true);
        let daemon = ScheduleDaemon::new(store.clone(), exec, "node-a");

        let when = s.next_run_at.unwrap() + Duration::minutes(1);
        daemon.tick_once(when).await;

        let updated = store.get(&s.id).await.unwrap().unwrap();
        assert_eq!(updated.failure_count, 1);
        // Recurring schedules stay active after failures.
        assert_eq!(updated.status, ScheduleStatus::Active);
    }

    #[tokio::test]
    async fn one_time_schedule_completes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteScheduleStore::open(&dir.path().join("s.db")).unwrap());
        store.initialize().await.unwrap();
        let s = Schedule::new(
            "alice",
            ScheduleKind::OneTime,
            "2024-06-15T11:00:00Z",
            "once",
            Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap(),
        )
        .unwrap();
        let s = store.create(s, 10).await.unwrap();

        let exec = Recorder::new(false);
        let daemon = ScheduleDaemon::new(store.clone(), exec, "node-a");
        let when = Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 30).unwrap();
        assert_eq!(daemon.tick_once(when).await, 1);

        let updated = store.get(&s.id).await.unwrap().unwrap();
        assert_eq!(updated.status, ScheduleStatus::Completed);
        assert!(updated.next_run_at.is_none());

        // Completed schedules never fire again.
        assert_eq!(daemon.tick_once(when + Duration::hours(1)).await, 0);
    }
}
