//! Phase-scoped signal handling.
//!
//! Handlers only touch the atomics below or call `kill(2)`. Everything else
//! (printing, aborting, logging) happens in the main flow.
//!
//! | Phase    | Signal                         | Effect                               |
//! |----------|--------------------------------|--------------------------------------|
//! | sleeping | `SIGUSR1`                      | stop sleeping, run now               |
//! | sleeping | `SIGUSR2`                      | print remaining seconds, keep going  |
//! | sleeping | HUP INT QUIT TERM PIPE XCPU XFSZ | abort the invocation               |
//! | sleeping | anything else                  | ignored                              |
//! | running  | `SIGALRM` from the kernel      | teardown signal to the command group |
//! | running  | `SIGALRM` from a process       | ignored                              |
//! | running  | anything else                  | relayed to the command group         |

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;

use crate::error::{Result, SupervisorError};

static CHILD_PGID: AtomicI32 = AtomicI32::new(0);
static TEARDOWN: AtomicI32 = AtomicI32::new(libc::SIGTERM);
static WAKE: AtomicBool = AtomicBool::new(false);
static REPORT: AtomicBool = AtomicBool::new(false);
static ABORT: AtomicI32 = AtomicI32::new(0);

/// Which handler set is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerSet {
    Sleeping,
    Running,
}

/// How a sleep ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Woken,
}

/// Signals that get a handler. Child status, uncatchable and synchronous
/// fault signals keep their default disposition.
pub fn is_handled(sig: Signal) -> bool {
    !matches!(
        sig,
        Signal::SIGCHLD
            | Signal::SIGKILL
            | Signal::SIGSTOP
            | Signal::SIGSEGV
            | Signal::SIGBUS
            | Signal::SIGILL
            | Signal::SIGFPE
            | Signal::SIGABRT
            | Signal::SIGSYS
            | Signal::SIGTRAP
    )
}

pub fn handled_signals() -> impl Iterator<Item = Signal> {
    Signal::iterator().filter(|s| is_handled(*s))
}

pub fn handled_set() -> SigSet {
    let mut set = SigSet::empty();
    for sig in handled_signals() {
        set.add(sig);
    }
    set
}

fn is_terminating(sig: libc::c_int) -> bool {
    matches!(
        sig,
        libc::SIGHUP
            | libc::SIGINT
            | libc::SIGQUIT
            | libc::SIGTERM
            | libc::SIGPIPE
            | libc::SIGXCPU
            | libc::SIGXFSZ
    )
}

extern "C" fn on_sleeping(sig: libc::c_int) {
    match sig {
        libc::SIGUSR1 => WAKE.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => REPORT.store(true, Ordering::SeqCst),
        s if is_terminating(s) => ABORT.store(s, Ordering::SeqCst),
        _ => {}
    }
}

extern "C" fn on_running(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let pgid = CHILD_PGID.load(Ordering::SeqCst);
    if pgid <= 0 {
        return;
    }

    let relay = if sig == libc::SIGALRM {
        // si_pid is 0 only for the kernel's own timer
        // SAFETY: the kernel passes a valid siginfo_t to SA_SIGINFO handlers.
        let sender = unsafe { (*info).si_pid() };
        if sender != 0 {
            return;
        }
        TEARDOWN.load(Ordering::SeqCst)
    } else {
        sig
    };

    // SAFETY: kill() is async-signal-safe.
    unsafe {
        libc::kill(-pgid, relay);
    }
}

/// Replace every handled signal's disposition with `set`'s handler.
pub fn install(set: HandlerSet) -> Result<()> {
    let action = match set {
        HandlerSet::Sleeping => SigAction::new(
            SigHandler::Handler(on_sleeping),
            SaFlags::empty(),
            SigSet::all(),
        ),
        HandlerSet::Running => SigAction::new(
            SigHandler::SigAction(on_running),
            SaFlags::SA_SIGINFO,
            SigSet::all(),
        ),
    };

    for sig in handled_signals() {
        // SAFETY: both handlers only store atomics or call kill().
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|source| SupervisorError::Signal { op: "sigaction", source })?;
    }
    tracing::trace!(?set, "installed signal handlers");
    Ok(())
}

/// Point the running-phase handler at a new process group.
pub fn arm_child(pgid: Pid, teardown: Signal) {
    TEARDOWN.store(teardown as i32, Ordering::SeqCst);
    CHILD_PGID.store(pgid.as_raw(), Ordering::SeqCst);
}

/// Stop relaying; the group is gone or about to be.
pub fn disarm_child() {
    CHILD_PGID.store(0, Ordering::SeqCst);
}

/// Block `set` in the calling thread until dropped.
pub struct MaskGuard {
    old: SigSet,
}

impl MaskGuard {
    pub fn block(set: &SigSet) -> Result<Self> {
        let mut old = SigSet::empty();
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(set), Some(&mut old))
            .map_err(|source| SupervisorError::Signal { op: "sigprocmask", source })?;
        Ok(Self { old })
    }

    pub fn block_all() -> Result<Self> {
        Self::block(&SigSet::all())
    }

    /// The mask in effect before this guard.
    pub fn previous(&self) -> &SigSet {
        &self.old
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.old), None);
    }
}

/// Sleep for `secs` with the sleeping handlers installed.
///
/// `SIGUSR1` ends the sleep early, `SIGUSR2` prints the remaining seconds
/// and a terminating signal fails with [`SupervisorError::Aborted`].
/// Anything else resumes the sleep.
///
/// `held` must block [`handled_set`]. Signals are only delivered inside
/// pselect, which swaps in the mask from before `held`. Once this returns
/// they stay pending until the caller drops `held`.
pub fn sleep_for(secs: u32, held: &MaskGuard) -> Result<SleepOutcome> {
    let deadline = Instant::now() + Duration::from_secs(u64::from(secs));

    loop {
        let aborted = ABORT.swap(0, Ordering::SeqCst);
        if aborted != 0 {
            return Err(SupervisorError::Aborted { signal: aborted });
        }
        if WAKE.swap(false, Ordering::SeqCst) {
            tracing::info!("woken early");
            return Ok(SleepOutcome::Woken);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(SleepOutcome::Elapsed);
        }
        let remaining = deadline - now;

        if REPORT.swap(false, Ordering::SeqCst) {
            eprintln!("{}", remaining.as_secs());
        }

        let timeout = libc::timespec {
            tv_sec: remaining.as_secs() as libc::time_t,
            tv_nsec: remaining.subsec_nanos() as libc::c_long,
        };
        // SAFETY: no fd sets; `timeout` and the mask outlive the call.
        let rv = unsafe {
            libc::pselect(
                0,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                &timeout,
                held.previous().as_ref(),
            )
        };
        if rv < 0 {
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(SupervisorError::Signal {
                    op: "pselect",
                    source: errno,
                });
            }
        }
    }
}

/// Forget flags left over from an earlier phase.
pub fn reset_flags() {
    WAKE.store(false, Ordering::SeqCst);
    REPORT.store(false, Ordering::SeqCst);
    ABORT.store(0, Ordering::SeqCst);
}
