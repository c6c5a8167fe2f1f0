/// Run lifecycle definitions
///
/// A run is created `Running` and ends in exactly one terminal status.
use std::fmt;

/// The two mutually exclusive crawl modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Checks the newest-listings pages for previously unseen items
    NewScan,

    /// Walks older listing pages from the persisted cursor
    Backfill,
}

impl RunMode {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::NewScan => "new_scan",
            Self::Backfill => "backfill",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "new_scan" => Some(Self::NewScan),
            "backfill" => Some(Self::Backfill),
            _ => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewScan => write!(f, "NEW_SCAN"),
            Self::Backfill => write!(f, "BACKFILL"),
        }
    }
}

/// Status of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    // ===== Active State =====
    /// Crawl in progress
    Running,

    // ===== Terminal States =====
    /// Bounded workload exhausted without a fatal error
    Completed,

    /// Unrecoverable error, or reaped as stale
    Failed,

    /// Skip flag observed before natural completion
    Skipped,
}

impl RunStatus {
    /// Returns true once the run can no longer change status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Only `Running -> {Completed, Failed, Skipped}` is legal
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, Self::Running) && next.is_terminal()
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{}", label)
    }
}

/// Severity of a run log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
