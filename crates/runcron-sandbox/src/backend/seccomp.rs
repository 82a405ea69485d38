use std::collections::BTreeMap;

use nix::sys::prctl;
use nix::sys::signal::Signal;
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};

use super::{apply_evaluator_limits, plain_fork, CapabilityBackend, Forked, Profile};
use crate::error::{Result, SandboxError};

/// Syscalls the evaluator may make after confinement.
fn allowed_syscalls() -> Vec<i64> {
    let mut nrs = vec![
        // allocation
        libc::SYS_brk,
        libc::SYS_mmap,
        libc::SYS_munmap,
        libc::SYS_mremap,
        libc::SYS_madvise,
        libc::SYS_mprotect, // glibc grows non-main arenas in place
        // exit
        libc::SYS_exit,
        libc::SYS_exit_group,
        // local time zone checks
        libc::SYS_fstat,
        libc::SYS_newfstatat,
        libc::SYS_statx,
        libc::SYS_clock_gettime,
        // result pipe and diagnostics
        libc::SYS_write,
        libc::SYS_writev,
        libc::SYS_restart_syscall,
        libc::SYS_rt_sigreturn,
        // abort() on allocation failure
        libc::SYS_rt_sigprocmask,
        libc::SYS_getpid,
        libc::SYS_gettid,
    ];
    #[cfg(target_arch = "x86_64")]
    nrs.extend([libc::SYS_stat, libc::SYS_lstat]);

    nrs.into_iter().map(i64::from).collect()
}

/// Linux backend: seccomp-bpf allow-list for the evaluator, `no_new_privs`
/// and parent-death signal for the supervised command.
#[derive(Debug, Default)]
pub struct SeccompBackend {
    arch: Option<TargetArch>,
}

impl SeccompBackend {
    fn arch(&self) -> Result<TargetArch> {
        match &self.arch {
            Some(arch) => Ok(arch.clone()),
            None => target_arch(),
        }
    }

    /// Build (but do not install) the evaluator filter.
    ///
    /// Building allocates, so it must happen before the address-space limit.
    fn evaluator_filter(&self) -> Result<BpfProgram> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = allowed_syscalls()
            .into_iter()
            .map(|nr| (nr, vec![]))
            .collect();

        // abort() signals itself; nothing else may be signalled
        let pid = nix::unistd::getpid().as_raw() as u64;
        let own_pid = SeccompCondition::new(0, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, pid)
            .map_err(|e| SandboxError::Filter(e.to_string()))?;
        let rule =
            SeccompRule::new(vec![own_pid]).map_err(|e| SandboxError::Filter(e.to_string()))?;
        rules.insert(i64::from(libc::SYS_tgkill), vec![rule]);

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::KillProcess, // mismatch
            SeccompAction::Allow,       // match
            self.arch()?,
        )
        .map_err(|e| SandboxError::Filter(e.to_string()))?;

        filter
            .try_into()
            .map_err(|e: seccompiler::BackendError| SandboxError::Filter(e.to_string()))
    }
}

fn target_arch() -> Result<TargetArch> {
    let arch = std::env::consts::ARCH;
    arch.try_into()
        .map_err(|e| SandboxError::Filter(format!("{arch}: {e:?}")))
}

impl CapabilityBackend for SeccompBackend {
    fn name(&self) -> &'static str {
        "seccomp"
    }

    fn init(&mut self) -> Result<()> {
        self.arch = Some(target_arch()?);
        Ok(())
    }

    fn disable_setuid_propagation(&self) -> Result<()> {
        prctl::set_no_new_privs().map_err(|e| SandboxError::sys("prctl(PR_SET_NO_NEW_PRIVS)", e))
    }

    fn enter_restricted(&self, profile: Profile<'_>) -> Result<()> {
        match profile {
            Profile::Evaluator(limits) => {
                let program = self.evaluator_filter()?;
                apply_evaluator_limits(&limits)?;
                // also sets no_new_privs
                seccompiler::apply_filter(&program).map_err(|e| SandboxError::Filter(e.to_string()))
            }
            // waitpid and kill stay unrestricted for the supervisor
            Profile::SupervisedWait { .. } => Ok(()),
        }
    }

    fn teardown_signal_hint(&self) -> Result<()> {
        prctl::set_pdeathsig(Signal::SIGKILL)
            .map_err(|e| SandboxError::sys("prctl(PR_SET_PDEATHSIG)", e))
    }

    unsafe fn fork(&self) -> Result<Forked> {
        plain_fork()
    }
}
