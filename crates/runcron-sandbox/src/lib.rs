//! `runcron-sandbox` — least-privilege execution for runcron.
//!
//! Two pieces:
//!
//! - [`backend`]: the [`CapabilityBackend`] trait and the one variant
//!   compiled for this target ([`PlatformBackend`]).
//! - [`evaluator`]: computes the schedule delay in a forked child that is
//!   CPU-, memory- and syscall-limited, so hostile schedule text can only
//!   hurt a process that is about to exit anyway.

pub mod backend;
pub mod error;
pub mod evaluator;

pub use backend::{
    platform, wait_for_child, CapabilityBackend, ChildProcess, Forked, PlatformBackend, Profile,
};
pub use error::{EvalError, Result, SandboxError};
pub use evaluator::Evaluator;
