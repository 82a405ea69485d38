use std::ffi::{CStr, CString};
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::sys::signal::{killpg, SigSet, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use runcron_core::types::{EXIT_EXEC_FAILED, EXIT_INTERNAL};
use runcron_sandbox::{CapabilityBackend, ChildProcess, Forked, Profile};

use crate::error::{Result, SupervisorError};
use crate::signals::{self, HandlerSet, MaskGuard};

/// argv converted to C strings ahead of `fork`, so the child does not
/// allocate before `exec`.
#[derive(Debug)]
pub struct PreparedCommand {
    argv: Vec<CString>,
}

impl PreparedCommand {
    pub fn new(args: &[String]) -> Result<Self> {
        if args.is_empty() {
            return Err(SupervisorError::EmptyCommand);
        }
        let argv = args
            .iter()
            .map(|a| CString::new(a.as_bytes()).map_err(|_| SupervisorError::NulInArgument(a.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { argv })
    }

    pub fn program(&self) -> &CStr {
        &self.argv[0]
    }

    /// Short process title for the supervisor while the command runs.
    pub fn title(&self) -> String {
        let program = self.program().to_string_lossy();
        let base = program.rsplit('/').next().unwrap_or(&program);
        format!("runcron: {base}")
    }
}

/// Fork the command as leader of a new session and wire up the running
/// phase in the parent.
///
/// In the parent the running handler set is installed and armed for the
/// child's group before any signal can be delivered. With `restrict` the
/// parent also enters the backend's supervised-wait profile.
///
/// The child execs with `child_mask`, the mask the supervisor started
/// with, whatever the caller holds blocked at the time.
pub fn spawn<B: CapabilityBackend>(
    backend: &B,
    command: &PreparedCommand,
    teardown: Signal,
    restrict: bool,
    child_mask: &SigSet,
) -> Result<ChildProcess> {
    let mut argv: Vec<*const libc::c_char> = command.argv.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    let handled: Vec<libc::c_int> = signals::handled_signals().map(|s| s as libc::c_int).collect();

    let blocked = MaskGuard::block_all()?;

    // SAFETY: the child only calls async-signal-safe functions on
    // pre-allocated data before exec or _exit.
    match unsafe { backend.fork() }? {
        Forked::Child => unsafe {
            if libc::setsid() < 0 {
                libc::_exit(EXIT_INTERNAL);
            }
            if backend.teardown_signal_hint().is_err() {
                libc::_exit(EXIT_INTERNAL);
            }
            for &sig in &handled {
                libc::signal(sig, libc::SIG_DFL);
            }
            libc::sigprocmask(libc::SIG_SETMASK, child_mask.as_ref(), std::ptr::null_mut());
            libc::execvp(command.program().as_ptr(), argv.as_ptr());
            libc::_exit(EXIT_EXEC_FAILED)
        },
        Forked::Parent(child) => {
            signals::arm_child(child.pid, teardown);
            signals::install(HandlerSet::Running)?;
            if restrict {
                backend.enter_restricted(Profile::SupervisedWait {
                    child: child.descriptor.as_ref().map(|fd| fd.as_fd()),
                })?;
            }
            drop(blocked);
            debug!(pid = child.pid.as_raw(), "spawned command");
            Ok(child)
        }
    }
}

/// Send `sig` to the command's process group. Failures are logged only.
pub fn signal_group(pgid: Pid, sig: Signal) {
    match killpg(pgid, sig) {
        Ok(()) => debug!(pgid = pgid.as_raw(), signal = %sig, "signalled process group"),
        Err(Errno::ESRCH) => debug!(pgid = pgid.as_raw(), "process group already gone"),
        Err(e) => warn!(pgid = pgid.as_raw(), signal = %sig, error = %e, "failed to signal process group"),
    }
}

/// Rename the supervisor while it waits (Linux only).
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(name) = CString::new(title) {
            if let Err(e) = nix::sys::prctl::set_name(&name) {
                debug!(error = %e, "prctl(PR_SET_NAME) failed");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = title;
}
