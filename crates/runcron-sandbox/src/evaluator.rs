//! Schedule evaluation in a disposable, confined child process.
//!
//! The child writes the delay as 4 native-endian bytes to a pipe and exits
//! 0. Every failure is reported through its exit status instead:
//!
//! | Child outcome          | Result                          |
//! |------------------------|---------------------------------|
//! | exit 0 + 4 bytes       | `Ok(delay)`                     |
//! | killed by `SIGXCPU`    | [`EvalError::Timeout`]          |
//! | killed by `SIGSEGV`/`SIGABRT` | [`EvalError::MemoryExceeded`] |
//! | exit 1                 | [`EvalError::Parse`]            |
//! | anything else          | [`EvalError::Internal`]         |

use std::fs::File;
use std::io::Read;
use std::mem::ManuallyDrop;
use std::os::fd::OwnedFd;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Duration, Local};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::WaitStatus;
use tracing::debug;

use runcron_core::types::IMMEDIATE;
use runcron_core::EvaluatorLimits;
use runcron_scheduler::{schedule, ScheduleError, Timespec};

use crate::backend::{wait_for_child, CapabilityBackend, Forked, Profile};
use crate::error::EvalError;

const CHILD_OK: i32 = 0;
const CHILD_PARSE: i32 = 1;
const CHILD_INTERNAL: i32 = 111;

const PREFAULT_HEAP: usize = 64 * 1024;
const PREFAULT_STACK: usize = 32 * 1024;

const BACKTRACE_VARS: [&str; 2] = ["RUST_BACKTRACE", "RUST_LIB_BACKTRACE"];

/// Signals whose default action the evaluator result depends on.
const FAULT_SIGNALS: [Signal; 4] = [
    Signal::SIGXCPU,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGABRT,
];

pub struct Evaluator<'a, B: CapabilityBackend> {
    backend: &'a B,
    limits: EvaluatorLimits,
    confined: bool,
}

impl<'a, B: CapabilityBackend> Evaluator<'a, B> {
    pub fn new(backend: &'a B, limits: EvaluatorLimits) -> Self {
        Self {
            backend,
            limits,
            confined: true,
        }
    }

    /// Evaluate in-process, without fork or limits.
    pub fn unconfined(mut self) -> Self {
        self.confined = false;
        self
    }

    /// Delay in seconds from `now` to the next occurrence of `schedule`,
    /// or [`runcron_core::types::IMMEDIATE`] for `@reboot`.
    pub fn evaluate(
        &self,
        schedule: &str,
        now: DateTime<Local>,
        tag: &str,
    ) -> Result<u32, EvalError> {
        let delay = if self.confined {
            // chrono loads the zone file on first use; do it while open(2) works
            let _ = Local::now();
            self.run(|| schedule::evaluate(schedule, now, tag))?
        } else {
            schedule::evaluate(schedule, now, tag).map_err(|e| EvalError::Parse(e.to_string()))?
        };
        debug!(
            schedule,
            normalized = %normalized_text(schedule),
            %now,
            next = ?next_occurrence(now, delay),
            delay,
            confined = self.confined,
            "evaluated schedule"
        );
        Ok(delay)
    }

    /// Run `f` in a forked, confined child and collect its result.
    pub fn run<F>(&self, f: F) -> Result<u32, EvalError>
    where
        F: FnOnce() -> Result<u32, ScheduleError>,
    {
        let (read_end, write_end) =
            nix::unistd::pipe().map_err(|e| EvalError::Internal(format!("pipe: {e}")))?;

        // SAFETY: the child never returns from this function; it computes,
        // writes to the pipe and leaves through _exit.
        match unsafe { self.backend.fork() }? {
            Forked::Child => {
                drop(read_end);
                let code = child_main(self.backend, self.limits, write_end, f);
                // SAFETY: skips atexit handlers and destructors, which may
                // make syscalls outside the allow-list.
                unsafe { libc::_exit(code) }
            }
            Forked::Parent(child) => {
                drop(write_end);
                let status = wait_for_child(child.pid)
                    .map_err(|e| EvalError::Internal(format!("waitpid: {e}")))?;
                interpret(status, read_end)
            }
        }
    }
}

/// Normalized schedule text for diagnostics. Errors are reported by the
/// evaluation itself, so here they are only rendered.
fn normalized_text(schedule: &str) -> String {
    match schedule::normalize(schedule) {
        Ok(Timespec::Immediate) => "@reboot".to_string(),
        Ok(Timespec::Cron(spec)) => spec,
        Err(e) => format!("<{e}>"),
    }
}

fn next_occurrence(now: DateTime<Local>, delay: u32) -> Option<DateTime<Local>> {
    (delay != IMMEDIATE).then(|| now + Duration::seconds(i64::from(delay)))
}

fn child_main<B, F>(backend: &B, limits: EvaluatorLimits, out: OwnedFd, f: F) -> i32
where
    B: CapabilityBackend,
    F: FnOnce() -> Result<u32, ScheduleError>,
{
    // close(2) is not allowed once confined
    let out = ManuallyDrop::new(out);

    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        disable_backtraces();
        if let Err(e) = restore_default_signals() {
            eprintln!("runcron: evaluator: signals: {e}");
            return CHILD_INTERNAL;
        }
        prefault();
        if let Err(e) = backend.enter_restricted(Profile::Evaluator(limits)) {
            eprintln!("runcron: evaluator: {e}");
            return CHILD_INTERNAL;
        }

        match f() {
            Ok(delay) => match write_all(&out, &delay.to_ne_bytes()) {
                Ok(()) => CHILD_OK,
                Err(_) => CHILD_INTERNAL,
            },
            Err(e) => {
                eprintln!("runcron: {e}");
                CHILD_PARSE
            }
        }
    }));

    outcome.unwrap_or(CHILD_INTERNAL)
}

/// The allocation-failure and panic paths capture a backtrace when these
/// are set, and that needs `getcwd`/`open`, which the filter kills on.
/// Must run before anything reads and caches the setting.
fn disable_backtraces() {
    for var in BACKTRACE_VARS {
        std::env::remove_var(var);
    }
}

/// Default dispositions and an empty mask, so resource-limit signals kill.
fn restore_default_signals() -> nix::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in FAULT_SIGNALS {
        // SAFETY: installing SIG_DFL has no handler to be unsafe about.
        unsafe { signal::sigaction(sig, &default) }?;
    }
    signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}

/// Touch heap and stack while they can still grow: the address-space
/// limit refuses growth afterwards.
#[inline(never)]
fn prefault() {
    let heap = vec![1u8; PREFAULT_HEAP];
    std::hint::black_box(&heap);
    drop(heap);

    let stack = [1u8; PREFAULT_STACK];
    std::hint::black_box(&stack);
}

fn write_all(fd: &OwnedFd, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(0) => return Err(Errno::EPIPE),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn interpret(status: WaitStatus, pipe: OwnedFd) -> Result<u32, EvalError> {
    match status {
        WaitStatus::Exited(_, CHILD_OK) => {
            let mut buf = [0u8; 4];
            File::from(pipe)
                .read_exact(&mut buf)
                .map_err(|e| EvalError::Internal(format!("short read: {e}")))?;
            Ok(u32::from_ne_bytes(buf))
        }
        WaitStatus::Exited(_, CHILD_PARSE) => {
            Err(EvalError::Parse("invalid crontab timespec".into()))
        }
        WaitStatus::Signaled(_, Signal::SIGXCPU, _) => Err(EvalError::Timeout),
        WaitStatus::Signaled(_, Signal::SIGSEGV | Signal::SIGABRT, _) => {
            Err(EvalError::MemoryExceeded)
        }
        other => Err(EvalError::Internal(format!("unexpected status: {other:?}"))),
    }
}
