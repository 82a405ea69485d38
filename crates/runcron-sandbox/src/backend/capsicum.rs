use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::unistd::Pid;

use super::{apply_evaluator_limits, zero_nproc, CapabilityBackend, ChildProcess, Forked, Profile};
use crate::error::{Result, SandboxError};

// <sys/capsicum.h>
const CAP_RIGHTS_VERSION: libc::c_int = 0;

const fn capright(idx: u64, bit: u64) -> u64 {
    (1u64 << (57 + idx)) | bit
}

const CAP_READ: u64 = capright(0, 0x1);
const CAP_WRITE: u64 = capright(0, 0x2);
const CAP_SEEK: u64 = capright(0, 0x4 | 0x8);
const CAP_EVENT: u64 = capright(1, 0x20);
const CAP_PDWAIT: u64 = capright(1, 0x400);
const CAP_PDKILL: u64 = capright(1, 0x800);

#[repr(C)]
struct CapRights {
    cr_rights: [u64; 2],
}

extern "C" {
    fn __cap_rights_init(version: libc::c_int, rights: *mut CapRights, ...) -> *mut CapRights;
    fn cap_rights_limit(fd: libc::c_int, rights: *const CapRights) -> libc::c_int;
    fn cap_enter() -> libc::c_int;
    fn pdfork(fdp: *mut libc::c_int, flags: libc::c_int) -> libc::pid_t;
}

fn limit_fd(fd: RawFd, rights: &[u64], op: &'static str) -> Result<()> {
    let mut set = CapRights { cr_rights: [0; 2] };
    // SAFETY: `set` is valid; the variadic list ends with 0 as the
    // cap_rights_init() macro does. At most three rights are passed.
    unsafe {
        match rights {
            [a] => __cap_rights_init(CAP_RIGHTS_VERSION, &mut set, *a, 0u64),
            [a, b] => __cap_rights_init(CAP_RIGHTS_VERSION, &mut set, *a, *b, 0u64),
            [a, b, c] => __cap_rights_init(CAP_RIGHTS_VERSION, &mut set, *a, *b, *c, 0u64),
            _ => return Err(SandboxError::sys(op, nix::errno::Errno::EINVAL)),
        };
        if cap_rights_limit(fd, &set) < 0 {
            return Err(SandboxError::last(op));
        }
    }
    Ok(())
}

// Seek and event stay so redirected files and poll(2) keep working.
const STDIN_RIGHTS: [u64; 3] = [CAP_READ, CAP_SEEK, CAP_EVENT];
const STDOUT_RIGHTS: [u64; 3] = [CAP_WRITE, CAP_SEEK, CAP_EVENT];

fn limit_stdio() -> Result<()> {
    limit_fd(libc::STDIN_FILENO, &STDIN_RIGHTS, "cap_rights_limit(stdin)")?;
    limit_fd(libc::STDOUT_FILENO, &STDOUT_RIGHTS, "cap_rights_limit(stdout)")?;
    limit_fd(libc::STDERR_FILENO, &STDOUT_RIGHTS, "cap_rights_limit(stderr)")
}

/// FreeBSD backend: capability mode for the evaluator, process descriptors
/// for the supervised command.
#[derive(Debug, Default)]
pub struct CapsicumBackend;

impl CapabilityBackend for CapsicumBackend {
    fn name(&self) -> &'static str {
        "capsicum"
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    // exec of a setuid binary is already refused in capability mode
    fn disable_setuid_propagation(&self) -> Result<()> {
        Ok(())
    }

    fn enter_restricted(&self, profile: Profile<'_>) -> Result<()> {
        match profile {
            Profile::Evaluator(limits) => {
                apply_evaluator_limits(&limits)?;
                zero_nproc()?;
                limit_stdio()?;
                // SAFETY: no arguments; irreversible by design of the call.
                if unsafe { cap_enter() } < 0 {
                    return Err(SandboxError::last("cap_enter"));
                }
                Ok(())
            }
            // The supervisor keeps kill(2) on the process group, so only the
            // child's descriptor is narrowed.
            Profile::SupervisedWait { child } => match child {
                Some(fd) => limit_fd(
                    fd.as_raw_fd(),
                    &[CAP_PDWAIT, CAP_PDKILL, CAP_EVENT],
                    "cap_rights_limit(procdesc)",
                ),
                None => Ok(()),
            },
        }
    }

    // the child dies when its process descriptor is closed
    fn teardown_signal_hint(&self) -> Result<()> {
        Ok(())
    }

    unsafe fn fork(&self) -> Result<Forked> {
        let mut fd: libc::c_int = -1;
        let pid = pdfork(&mut fd, 0);
        match pid {
            -1 => Err(SandboxError::last("pdfork")),
            0 => Ok(Forked::Child),
            pid => Ok(Forked::Parent(ChildProcess {
                pid: Pid::from_raw(pid),
                descriptor: Some(OwnedFd::from_raw_fd(fd)),
            })),
        }
    }
}
