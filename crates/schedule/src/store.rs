//! Persistence contract for schedule backends.
//!
//! The embedded SQLite file store is the zero-config default; the same
//! contract admits server-based SQL backends loaded elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use visor_domain::error::Result;

use crate::model::{Schedule, ScheduleStats};

/// Proof of advisory-lock ownership for one schedule.
///
/// Every lock mutation (renew, release) must present the token; a stale
/// holder whose TTL lapsed loses the token race to the next acquirer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub schedule_id: String,
    pub node_id: String,
    pub token: String,
}

#[async_trait]
pub trait ScheduleStoreBackend: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;

    /// Create a schedule after enforcing per-creator limits.
    async fn create(&self, schedule: Schedule, max_per_creator: u32) -> Result<Schedule>;

    /// Insert a schedule verbatim (migrations, imports). No limit checks.
    async fn import_schedule(&self, schedule: Schedule) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Schedule>>;
    async fn update(&self, schedule: &Schedule) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn get_by_creator(&self, creator_id: &str) -> Result<Vec<Schedule>>;
    async fn get_active_schedules(&self) -> Result<Vec<Schedule>>;
    async fn get_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;
    async fn find_by_workflow(&self, workflow_ref: &str) -> Result<Vec<Schedule>>;
    async fn get_stats(&self) -> Result<ScheduleStats>;

    /// Fail with `ScheduleErrorKind::LimitExceeded` when the creator is
    /// at their ceiling.
    async fn validate_limits(&self, creator_id: &str, max_per_creator: u32) -> Result<()>;

    /// Acquire the advisory lock for a schedule. Returns `None` when
    /// another node holds a live lock.
    async fn try_acquire_lock(
        &self,
        schedule_id: &str,
        node_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>>;

    /// Extend a held lock. Returns `false` when the lock was lost.
    async fn renew_lock(&self, token: &LockToken, ttl: Duration) -> Result<bool>;

    /// Release a held lock. Releasing a lost lock is a no-op.
    async fn release_lock(&self, token: &LockToken) -> Result<()>;

    /// Flush any buffered writes to durable storage.
    async fn flush(&self) -> Result<()>;
}
