use std::fmt;

/// Why a sandboxed predicate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateErrorKind {
    Timeout,
    Syntax,
    Runtime,
    Blocked,
}

impl fmt::Display for PredicateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Syntax => "syntax",
            Self::Runtime => "runtime",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Routing failures enforced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingErrorKind {
    RoutingBudgetExceeded,
    LoopBudgetExceeded,
    MaxRunsExceeded,
    InvalidGotoTarget,
}

impl fmt::Display for RoutingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RoutingBudgetExceeded => "routing_budget_exceeded",
            Self::LoopBudgetExceeded => "loop_budget_exceeded",
            Self::MaxRunsExceeded => "max_runs_exceeded",
            Self::InvalidGotoTarget => "invalid_goto_target",
        };
        f.write_str(s)
    }
}

/// Schedule store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleErrorKind {
    LockLost,
    LimitExceeded,
    StoreUnavailable,
}

impl fmt::Display for ScheduleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LockLost => "lock_lost",
            Self::LimitExceeded => "limit_exceeded",
            Self::StoreUnavailable => "store_unavailable",
        };
        f.write_str(s)
    }
}

/// Shared error type used across all Visor crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("predicate {kind}: {message}")]
    Predicate {
        kind: PredicateErrorKind,
        message: String,
    },

    #[error("provider {provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        /// Transient failures (I/O, 5xx, timeouts) are retriable.
        transient: bool,
    },

    #[error("routing {kind}: {message}")]
    Routing {
        kind: RoutingErrorKind,
        message: String,
    },

    #[error("schedule {kind}: {message}")]
    Schedule {
        kind: ScheduleErrorKind,
        message: String,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn predicate(kind: PredicateErrorKind, message: impl Into<String>) -> Self {
        Self::Predicate {
            kind,
            message: message.into(),
        }
    }

    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        transient: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            transient,
        }
    }

    pub fn routing(kind: RoutingErrorKind, message: impl Into<String>) -> Self {
        Self::Routing {
            kind,
            message: message.into(),
        }
    }

    pub fn schedule(kind: ScheduleErrorKind, message: impl Into<String>) -> Self {
        Self::Schedule {
            kind,
            message: message.into(),
        }
    }

    /// True when a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { transient: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
