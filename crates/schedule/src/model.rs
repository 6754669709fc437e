//! Schedule data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use visor_domain::error::Result;

use crate::cron::{next_fire, parse_expression};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Recurring,
    OneTime,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recurring => "recurring",
            Self::OneTime => "one_time",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recurring" => Some(Self::Recurring),
            "one_time" => Some(Self::OneTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Persisted schedule row. The lock columns are owned by the store and
/// only meaningful while a daemon holds the advisory lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub creator_id: String,
    pub kind: ScheduleKind,
    /// Cron expression, `@every <duration>`, or an RFC3339 instant.
    pub expression: String,
    /// The workflow this schedule fires.
    pub workflow_ref: String,
    pub status: ScheduleStatus,
    pub run_count: i64,
    pub failure_count: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Build a new active schedule, validating the expression and
    /// computing its first fire time.
    pub fn new(
        creator_id: impl Into<String>,
        kind: ScheduleKind,
        expression: impl Into<String>,
        workflow_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let expression = expression.into();
        let parsed = parse_expression(&expression)?;
        let next_run_at = next_fire(&parsed, now, None);
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            creator_id: creator_id.into(),
            kind,
            expression,
            workflow_ref: workflow_ref.into(),
            status: ScheduleStatus::Active,
            run_count: 0,
            failure_count: 0,
            next_run_at,
            created_at: now,
            last_run_at: None,
            locked_by: None,
            lock_token: None,
            lock_expires_at: None,
        })
    }

    /// Advance state after a completed run. Recurring schedules compute
    /// the next window; one-shot schedules reach a terminal status.
    pub fn record_run(&mut self, now: DateTime<Utc>, succeeded: bool) {
        self.last_run_at = Some(now);
        self.run_count += 1;
        if !succeeded {
            self.failure_count += 1;
        }
        match self.kind {
            ScheduleKind::OneTime => {
                self.status = if succeeded {
                    ScheduleStatus::Completed
                } else {
                    ScheduleStatus::Failed
                };
                self.next_run_at = None;
            }
            ScheduleKind::Recurring => {
                self.next_run_at = parse_expression(&self.expression)
                    .ok()
                    .and_then(|e| next_fire(&e, now, Some(now)));
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active
            && self.next_run_at.map_or(false, |next| next <= now)
    }
}

/// Aggregate counts for dashboards and limit checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleStats {
    pub total: u64,
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
}
