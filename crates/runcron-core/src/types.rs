use chrono::{DateTime, Local};
use std::fmt;

// Exit codes, shared by the supervisor and the CLI.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_INTERNAL: i32 = 111;
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Evaluator result meaning "run now" (the `@reboot` alias).
pub const IMMEDIATE: u32 = u32::MAX;

/// Ledger byte written on first creation for `@reboot` jobs.
pub const STATUS_NEVER_RUN: u8 = 255;

/// Ledger byte written before spawning: 128 + SIGKILL.
pub const STATUS_KILLED: u8 = 137;

// Exported to the supervised command.
pub const ENV_TIMEOUT: &str = "RUNCRON_TIMEOUT";
pub const ENV_EXIT_STATUS: &str = "RUNCRON_EXIT_STATUS";

/// Everything about one invocation that does not come from layered config.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Raw schedule text, before alias expansion.
    pub schedule: String,
    /// Program followed by its arguments. Never empty.
    pub command: Vec<String>,
    /// Reference time for the first evaluation.
    pub now: DateTime<Local>,
    pub dry_run: bool,
    pub print: bool,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl Termination {
    /// Translate into the byte stored in the ledger and used as exit code.
    ///
    /// Signals become `128 + signal`; anything past 255 saturates.
    pub fn exit_code(self) -> u8 {
        let raw = match self {
            Termination::Exited(n) => n,
            Termination::Signaled(s) => 128 + s,
        };
        raw.clamp(0, 255) as u8
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(n) => write!(f, "exited {n}"),
            Termination::Signaled(s) => write!(f, "killed by signal {s}"),
        }
    }
}

/// Supervision phase. Ordered; a run only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    Sleeping,
    PreSpawnMark,
    Running,
    Reaped,
}

impl Phase {
    /// Move to `next`. Returns `false` (and stays put) on a regression.
    pub fn advance(&mut self, next: Phase) -> bool {
        if next < *self {
            return false;
        }
        *self = next;
        true
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Sleeping => "sleeping",
            Phase::PreSpawnMark => "pre-spawn-mark",
            Phase::Running => "running",
            Phase::Reaped => "reaped",
        };
        write!(f, "{s}")
    }
}
