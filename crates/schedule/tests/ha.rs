//! Two daemons polling one store: the advisory lock guarantees a single
//! node fires each due schedule.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;

use visor_domain::error::Result;
use visor_schedule::{
    Schedule, ScheduleDaemon, ScheduleExecutor, ScheduleKind, ScheduleStoreBackend,
    SqliteScheduleStore,
};

struct CountingExecutor {
    node: &'static str,
    runs: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait::async_trait]
impl ScheduleExecutor for CountingExecutor {
    async fn execute(&self, _schedule: &Schedule) -> Result<()> {
        // Hold the schedule long enough that the other node's tick
        // overlaps the execution window.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.runs.lock().push(self.node);
        Ok(())
    }
}

#[tokio::test]
async fn single_due_schedule_fires_on_exactly_one_node() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let store_a = Arc::new(SqliteScheduleStore::open(&path).unwrap());
    store_a.initialize().await.unwrap();
    let store_b = Arc::new(SqliteScheduleStore::open(&path).unwrap());
    store_b.initialize().await.unwrap();

    let created = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
    let schedule = Schedule::new("alice", ScheduleKind::Recurring, "0 * * * *", "digest", created)
        .unwrap();
    let schedule = store_a.create(schedule, 10).await.unwrap();
    let due_at = schedule.next_run_at.unwrap() + Duration::minutes(1);

    let runs = Arc::new(Mutex::new(Vec::new()));
    let daemon_a = ScheduleDaemon::new(
        store_a.clone(),
        Arc::new(CountingExecutor {
            node: "a",
            runs: runs.clone(),
        }),
        "node-a",
    );
    let daemon_b = ScheduleDaemon::new(
        store_b.clone(),
        Arc::new(CountingExecutor {
            node: "b",
            runs: runs.clone(),
        }),
        "node-b",
    );

    let (fired_a, fired_b) = tokio::join!(daemon_a.tick_once(due_at), daemon_b.tick_once(due_at));

    assert_eq!(fired_a + fired_b, 1, "exactly one node claims the schedule");
    assert_eq!(runs.lock().len(), 1, "the workflow executed exactly once");

    let updated = store_a.get(&schedule.id).await.unwrap().unwrap();
    assert_eq!(updated.run_count, 1);
    assert!(
        updated.next_run_at.unwrap() > due_at,
        "next window advanced past the fired one"
    );
}

#[tokio::test]
async fn both_nodes_fire_disjoint_schedules_over_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let store_a = Arc::new(SqliteScheduleStore::open(&path).unwrap());
    store_a.initialize().await.unwrap();
    let store_b = Arc::new(SqliteScheduleStore::open(&path).unwrap());
    store_b.initialize().await.unwrap();

    let created = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
    for i in 0..4 {
        let s = Schedule::new(
            "alice",
            ScheduleKind::Recurring,
            "0 * * * *",
            format!("wf-{i}"),
            created,
        )
        .unwrap();
        store_a.create(s, 10).await.unwrap();
    }
    let due_at = created + Duration::hours(1) + Duration::minutes(1);

    let runs = Arc::new(Mutex::new(Vec::new()));
    let daemon_a = ScheduleDaemon::new(
        store_a,
        Arc::new(CountingExecutor {
            node: "a",
            runs: runs.clone(),
        }),
        "node-a",
    );
    let daemon_b = ScheduleDaemon::new(
        store_b,
        Arc::new(CountingExecutor {
            node: "b",
            runs: runs.clone(),
        }),
        "node-b",
    );

    let (fired_a, fired_b) = tokio::join!(daemon_a.tick_once(due_at), daemon_b.tick_once(due_at));

    // Every due schedule fired somewhere, none twice.
    assert_eq!(fired_a + fired_b, 4);
    assert_eq!(runs.lock().len(), 4);
}
