use super::{
    apply_evaluator_limits, plain_fork, zero_fsize_nofile, zero_nproc, CapabilityBackend, Forked,
    Profile,
};
use crate::error::Result;

/// Fallback backend: resource limits only.
#[derive(Debug, Default)]
pub struct RlimitBackend;

impl CapabilityBackend for RlimitBackend {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn disable_setuid_propagation(&self) -> Result<()> {
        Ok(())
    }

    fn enter_restricted(&self, profile: Profile<'_>) -> Result<()> {
        match profile {
            Profile::Evaluator(limits) => {
                apply_evaluator_limits(&limits)?;
                zero_nproc()?;
                zero_fsize_nofile()
            }
            Profile::SupervisedWait { .. } => Ok(()),
        }
    }

    fn teardown_signal_hint(&self) -> Result<()> {
        Ok(())
    }

    unsafe fn fork(&self) -> Result<Forked> {
        plain_fork()
    }
}
