//! Platform capability backends.
//!
//! Exactly one backend is compiled in, chosen by target OS:
//!
//! | Target  | Backend            | Mechanism                                   |
//! |---------|--------------------|---------------------------------------------|
//! | Linux   | [`SeccompBackend`] | fixed syscall allow-list, kill on mismatch  |
//! | FreeBSD | `CapsicumBackend`  | capability mode, limited stdio rights       |
//! | other   | `RlimitBackend`    | zeroed process, file-size and fd limits     |

use std::os::fd::{BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{ForkResult, Pid};

use runcron_core::EvaluatorLimits;

use crate::error::{Result, SandboxError};

#[cfg(target_os = "freebsd")]
mod capsicum;
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
mod rlimit;
#[cfg(target_os = "linux")]
mod seccomp;

#[cfg(target_os = "freebsd")]
pub use capsicum::CapsicumBackend as PlatformBackend;
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub use rlimit::RlimitBackend as PlatformBackend;
#[cfg(target_os = "linux")]
pub use seccomp::SeccompBackend as PlatformBackend;
#[cfg(target_os = "linux")]
pub use seccomp::SeccompBackend;

/// What the calling process is about to become.
#[derive(Debug, Clone, Copy)]
pub enum Profile<'a> {
    /// Schedule evaluator: CPU and address-space limits plus confinement.
    Evaluator(EvaluatorLimits),
    /// Supervisor waiting on its command. `child` is the process
    /// descriptor, where the backend hands one out.
    SupervisedWait { child: Option<BorrowedFd<'a>> },
}

/// Result of [`CapabilityBackend::fork`].
#[derive(Debug)]
pub enum Forked {
    Child,
    Parent(ChildProcess),
}

/// A forked child as seen by its parent.
#[derive(Debug)]
pub struct ChildProcess {
    pub pid: Pid,
    /// Process descriptor on backends that have them. Dropping it kills
    /// the child there.
    pub descriptor: Option<OwnedFd>,
}

/// Privilege reduction for the evaluator and the supervised command.
///
/// Every error is fatal to the caller: a process that cannot be confined
/// must not continue.
pub trait CapabilityBackend {
    fn name(&self) -> &'static str;

    /// One-time setup before any other operation.
    fn init(&mut self) -> Result<()>;

    /// Stop this process and its descendants from gaining privileges
    /// through setuid/setgid executables.
    fn disable_setuid_propagation(&self) -> Result<()>;

    /// Irreversibly drop privileges in the current process.
    fn enter_restricted(&self, profile: Profile<'_>) -> Result<()>;

    /// Called in a freshly forked command: ask to be killed if the
    /// supervisor goes away first.
    fn teardown_signal_hint(&self) -> Result<()>;

    /// Fork, returning a process descriptor where supported.
    ///
    /// # Safety
    ///
    /// Same contract as `fork(2)` in a possibly multi-threaded process: the
    /// child may only call async-signal-safe functions until it execs or
    /// exits.
    unsafe fn fork(&self) -> Result<Forked>;
}

/// The backend for the current target.
pub fn platform() -> PlatformBackend {
    PlatformBackend::default()
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn set_rlimit(op: &'static str, resource: Resource, soft: u64, hard: u64) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialized rlimit for the call's duration.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(SandboxError::last(op));
    }
    Ok(())
}

/// CPU seconds and address space for the evaluator; hard limits are twice
/// the soft ones.
pub(crate) fn apply_evaluator_limits(limits: &EvaluatorLimits) -> Result<()> {
    set_rlimit(
        "setrlimit(RLIMIT_CPU)",
        libc::RLIMIT_CPU,
        limits.cpu,
        limits.cpu.saturating_mul(2),
    )?;
    set_rlimit(
        "setrlimit(RLIMIT_AS)",
        libc::RLIMIT_AS,
        limits.address_space,
        limits.address_space.saturating_mul(2),
    )
}

/// Forbid new processes.
#[cfg(not(target_os = "linux"))]
pub(crate) fn zero_nproc() -> Result<()> {
    set_rlimit("setrlimit(RLIMIT_NPROC)", libc::RLIMIT_NPROC, 0, 0)
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub(crate) fn zero_fsize_nofile() -> Result<()> {
    set_rlimit("setrlimit(RLIMIT_FSIZE)", libc::RLIMIT_FSIZE, 0, 0)?;
    set_rlimit("setrlimit(RLIMIT_NOFILE)", libc::RLIMIT_NOFILE, 0, 0)
}

/// `fork(2)` without a process descriptor.
///
/// # Safety
///
/// See [`CapabilityBackend::fork`].
#[cfg(not(target_os = "freebsd"))]
pub(crate) unsafe fn plain_fork() -> Result<Forked> {
    match nix::unistd::fork() {
        Ok(ForkResult::Child) => Ok(Forked::Child),
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent(ChildProcess {
            pid: child,
            descriptor: None,
        })),
        Err(e) => Err(SandboxError::sys("fork", e)),
    }
}

/// `waitpid` on one child, retrying on `EINTR`.
pub fn wait_for_child(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}
