//! Embedded SQLite schedule store — the zero-config default backend.
//!
//! One local database file holds every schedule row, including the
//! advisory lock columns. Lock mutations are compare-and-set UPDATEs, so
//! concurrent daemons on the same file observe at-most-one live holder
//! per schedule.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use visor_domain::error::{Error, Result, ScheduleErrorKind};

use crate::model::{Schedule, ScheduleKind, ScheduleStats, ScheduleStatus};
use crate::store::{LockToken, ScheduleStoreBackend};

pub struct SqliteScheduleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteScheduleStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(10))
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        // WAL so multiple daemon nodes can share the file.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        Ok(Schedule {
            id: row.get("id")?,
            creator_id: row.get("creator_id")?,
            kind: ScheduleKind::parse(&kind).unwrap_or(ScheduleKind::Recurring),
            expression: row.get("expression")?,
            workflow_ref: row.get("workflow_ref")?,
            status: ScheduleStatus::parse(&status).unwrap_or(ScheduleStatus::Paused),
            run_count: row.get("run_count")?,
            failure_count: row.get("failure_count")?,
            next_run_at: from_millis(row.get::<_, Option<i64>>("next_run_at")?),
            created_at: from_millis(Some(row.get::<_, i64>("created_at")?))
                .unwrap_or_else(Utc::now),
            last_run_at: from_millis(row.get::<_, Option<i64>>("last_run_at")?),
            locked_by: row.get("locked_by")?,
            lock_token: row.get("lock_token")?,
            lock_expires_at: from_millis(row.get::<_, Option<i64>>("lock_expires_at")?),
        })
    }

    async fn query_schedules(
        &self,
        sql: &str,
        args: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_schedule)
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(
                row.map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?,
            );
        }
        Ok(out)
    }

    async fn insert(&self, s: &Schedule) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedules (id, creator_id, kind, expression, workflow_ref, status, \
             run_count, failure_count, next_run_at, created_at, last_run_at, \
             locked_by, lock_token, lock_expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                s.id,
                s.creator_id,
                s.kind.as_str(),
                s.expression,
                s.workflow_ref,
                s.status.as_str(),
                s.run_count,
                s.failure_count,
                s.next_run_at.map(to_millis),
                to_millis(s.created_at),
                s.last_run_at.map(to_millis),
                s.locked_by,
                s.lock_token,
                s.lock_expires_at.map(to_millis),
            ],
        )
        .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(())
    }
}

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[async_trait]
impl ScheduleStoreBackend for SqliteScheduleStore {
    async fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                creator_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                expression TEXT NOT NULL,
                workflow_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                run_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                next_run_at INTEGER,
                created_at INTEGER NOT NULL,
                last_run_at INTEGER,
                locked_by TEXT,
                lock_token TEXT,
                lock_expires_at INTEGER
            )",
            [],
        )
        .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_schedules_due \
             ON schedules (status, next_run_at)",
            [],
        )
        .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.flush().await
    }

    async fn create(&self, schedule: Schedule, max_per_creator: u32) -> Result<Schedule> {
        self.validate_limits(&schedule.creator_id, max_per_creator)
            .await?;
        self.insert(&schedule).await?;
        tracing::info!(
            schedule_id = %schedule.id,
            workflow = %schedule.workflow_ref,
            expression = %schedule.expression,
            "created schedule"
        );
        Ok(schedule)
    }

    async fn import_schedule(&self, schedule: Schedule) -> Result<()> {
        self.insert(&schedule).await
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM schedules WHERE id = ?1",
            params![id],
            Self::row_to_schedule,
        )
        .optional()
        .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))
    }

    async fn update(&self, s: &Schedule) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedules SET creator_id=?2, kind=?3, expression=?4, workflow_ref=?5, \
             status=?6, run_count=?7, failure_count=?8, next_run_at=?9, last_run_at=?10 \
             WHERE id=?1",
            params![
                s.id,
                s.creator_id,
                s.kind.as_str(),
                s.expression,
                s.workflow_ref,
                s.status.as_str(),
                s.run_count,
                s.failure_count,
                s.next_run_at.map(to_millis),
                s.last_run_at.map(to_millis),
            ],
        )
        .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(n > 0)
    }

    async fn get_by_creator(&self, creator_id: &str) -> Result<Vec<Schedule>> {
        self.query_schedules(
            "SELECT * FROM schedules WHERE creator_id = ?1 ORDER BY created_at",
            vec![rusqlite::types::Value::from(creator_id.to_string())],
        )
        .await
    }

    async fn get_active_schedules(&self) -> Result<Vec<Schedule>> {
        self.query_schedules(
            "SELECT * FROM schedules WHERE status = 'active' ORDER BY created_at",
            vec![],
        )
        .await
    }

    async fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        self.query_schedules(
            "SELECT * FROM schedules WHERE status = 'active' \
             AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             ORDER BY next_run_at",
            vec![rusqlite::types::Value::from(to_millis(now))],
        )
        .await
    }

    async fn find_by_workflow(&self, workflow_ref: &str) -> Result<Vec<Schedule>> {
        self.query_schedules(
            "SELECT * FROM schedules WHERE workflow_ref = ?1 ORDER BY created_at",
            vec![rusqlite::types::Value::from(workflow_ref.to_string())],
        )
        .await
    }

    async fn get_stats(&self) -> Result<ScheduleStats> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM schedules GROUP BY status")
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;

        let mut stats = ScheduleStats::default();
        for row in rows {
            let (status, count) =
                row.map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
            let count = count as u64;
            stats.total += count;
            match ScheduleStatus::parse(&status) {
                Some(ScheduleStatus::Active) => stats.active += count,
                Some(ScheduleStatus::Paused) => stats.paused += count,
                Some(ScheduleStatus::Completed) => stats.completed += count,
                Some(ScheduleStatus::Failed) => stats.failed += count,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn validate_limits(&self, creator_id: &str, max_per_creator: u32) -> Result<()> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM schedules WHERE creator_id = ?1 \
                 AND status IN ('active', 'paused')",
                params![creator_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        if count >= max_per_creator as i64 {
            return Err(Error::schedule(
                ScheduleErrorKind::LimitExceeded,
                format!("creator {creator_id} already has {count} schedules (max {max_per_creator})"),
            ));
        }
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        schedule_id: &str,
        node_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        let now = Utc::now();
        let token = Uuid::new_v4().to_string();
        let expires = to_millis(now + ttl);

        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE schedules SET locked_by=?1, lock_token=?2, lock_expires_at=?3 \
                 WHERE id=?4 AND (lock_expires_at IS NULL OR lock_expires_at < ?5)",
                params![node_id, token, expires, schedule_id, to_millis(now)],
            )
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        if n == 1 {
            Ok(Some(LockToken {
                schedule_id: schedule_id.to_string(),
                node_id: node_id.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    async fn renew_lock(&self, token: &LockToken, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE schedules SET lock_expires_at=?1 \
                 WHERE id=?2 AND lock_token=?3 AND lock_expires_at >= ?4",
                params![
                    to_millis(now + ttl),
                    token.schedule_id,
                    token.token,
                    to_millis(now)
                ],
            )
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(n == 1)
    }

    async fn release_lock(&self, token: &LockToken) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedules SET locked_by=NULL, lock_token=NULL, lock_expires_at=NULL \
             WHERE id=?1 AND lock_token=?2",
            params![token.schedule_id, token.token],
        )
        .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
            .map_err(|e| Error::schedule(ScheduleErrorKind::StoreUnavailable, e.to_string()))?;
        Ok(())
    }
}
