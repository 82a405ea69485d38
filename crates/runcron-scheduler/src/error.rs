use std::path::PathBuf;

use thiserror::Error;

/// Errors from turning schedule text into a delay.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The text is longer than the supported maximum.
    #[error("timespec exceeds maximum length: {max}")]
    TooLong { max: usize },

    /// Not 1, 5 or 6+ whitespace-separated fields.
    #[error("invalid crontab timespec: {fields} fields")]
    FieldCount { fields: usize },

    /// A single field that is not a known `@alias`.
    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    /// Rejected by the cron expression parser.
    #[error("invalid crontab timespec: {0}")]
    Parse(String),

    /// The expression has no occurrence after the reference time.
    #[error("next scheduled interval: {0}")]
    NoOccurrence(String),

    /// The next occurrence is not strictly after the reference time.
    #[error("negative duration: {secs} seconds")]
    NotInFuture { secs: i64 },

    /// A `--timestamp` value in neither `@<epoch>` nor `%Y-%m-%d %H:%M:%S` form.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("hostname: {0}")]
    Hostname(String),
}

/// Errors from the lock-file ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Another invocation holds the exclusive lock.
    #[error("{} is locked by another instance", path.display())]
    Locked { path: PathBuf },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but holds no status byte.
    #[error("{} is empty", path.display())]
    Empty { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
