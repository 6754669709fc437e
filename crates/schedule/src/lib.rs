//! Persistent schedules — driver-pluggable storage plus the daemon that
//! fires due schedules back into the engine.
//!
//! A schedule is recurring (cron or `@every <duration>`) or one-shot
//! (an RFC3339 instant). Any number of daemon nodes may poll the same
//! store; an advisory lock with a TTL guarantees at-most-one node fires
//! a given schedule within its window.

pub mod cron;
pub mod daemon;
pub mod model;
pub mod sqlite;
pub mod store;

pub use cron::{next_fire, parse_expression, Expression};
pub use daemon::{ScheduleDaemon, ScheduleExecutor};
pub use model::{Schedule, ScheduleKind, ScheduleStats, ScheduleStatus};
pub use sqlite::SqliteScheduleStore;
pub use store::{LockToken, ScheduleStoreBackend};
