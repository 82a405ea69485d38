use nix::errno::Errno;
use thiserror::Error;

/// Failure to prepare or enter a confined state. Always fatal.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{op}: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// The syscall filter could not be built for this architecture.
    #[error("seccomp filter: {0}")]
    Filter(String),
}

impl SandboxError {
    pub(crate) fn sys(op: &'static str, source: Errno) -> Self {
        SandboxError::Sys { op, source }
    }

    /// `Errno::last()` wrapped with the failing operation's name.
    pub(crate) fn last(op: &'static str) -> Self {
        SandboxError::Sys {
            op,
            source: Errno::last(),
        }
    }
}

/// Why a schedule could not be turned into a delay.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("cron expression parsing exceeded allotted runtime")]
    Timeout,

    #[error("cron expression parsing exceeded allotted memory usage")]
    MemoryExceeded,

    #[error("{0}")]
    Parse(String),

    #[error("evaluator: {0}")]
    Internal(String),
}

impl From<SandboxError> for EvalError {
    fn from(e: SandboxError) -> Self {
        EvalError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
