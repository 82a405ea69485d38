use nix::errno::Errno;
use thiserror::Error;

use runcron_core::types::EXIT_INTERNAL;
use runcron_core::CoreError;
use runcron_sandbox::{EvalError, SandboxError};
use runcron_scheduler::{LedgerError, ScheduleError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("config: {0}")]
    Config(#[from] CoreError),

    #[error("{0}")]
    Schedule(#[from] ScheduleError),

    #[error("evaluate: {0}")]
    Evaluate(#[from] EvalError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("invalid signal: {0}")]
    InvalidSignal(i32),

    #[error("no command given")]
    EmptyCommand,

    #[error("argument contains a NUL byte: {0:?}")]
    NulInArgument(String),

    #[error("{op}: {source}")]
    Signal {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// A terminating signal arrived while sleeping.
    #[error("aborted by signal {signal}")]
    Aborted { signal: i32 },

    #[error("waitpid: {0}")]
    Wait(#[source] Errno),

    #[error("unexpected wait status: {0}")]
    UnexpectedStatus(String),
}

impl SupervisorError {
    /// Process exit code for this failure.
    ///
    /// Every supervisor-level failure is internal; command failures are not
    /// errors and come back as the command's own code.
    pub fn exit_code(&self) -> i32 {
        EXIT_INTERNAL
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
