//! The supervision state machine: evaluate, open the ledger, sleep, mark,
//! spawn, wait and record.

use chrono::Duration;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::alarm;
use tracing::{debug, info, trace};

use runcron_core::types::{
    ENV_EXIT_STATUS, ENV_TIMEOUT, EXIT_SUCCESS, IMMEDIATE, STATUS_KILLED, STATUS_NEVER_RUN,
};
use runcron_core::{Config, Invocation, Phase, Termination, TimeoutSetting};
use runcron_sandbox::{wait_for_child, CapabilityBackend, Evaluator};
use runcron_scheduler::{seed, Ledger};

use crate::error::{Result, SupervisorError};
use crate::signals::{self, HandlerSet, MaskGuard, SleepOutcome};
use crate::spawn::{self, PreparedCommand};

/// Everything decided before the sleep starts.
pub struct Prepared {
    ledger: Ledger,
    /// Status left by the previous run (or written on first creation).
    pub previous: u8,
    /// The ledger file was created by this invocation.
    pub created: bool,
    /// Seconds to sleep, after retry capping.
    pub delay: u32,
    /// Command timeout. `None` means unbounded.
    pub timeout: Option<u32>,
}

impl Prepared {
    pub fn ledger_is_locked(&self) -> bool {
        self.ledger.is_locked()
    }
}

pub struct Supervisor<B: CapabilityBackend> {
    config: Config,
    backend: B,
    teardown: Signal,
    phase: Phase,
}

impl<B: CapabilityBackend> Supervisor<B> {
    pub fn new(config: Config, mut backend: B) -> Result<Self> {
        let teardown =
            Signal::try_from(config.signal).map_err(|_| SupervisorError::InvalidSignal(config.signal))?;
        backend.init()?;
        debug!(backend = backend.name(), signal = %teardown, "supervisor ready");
        Ok(Self {
            config,
            backend,
            teardown,
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn enter(&mut self, next: Phase) {
        let moved = self.phase.advance(next);
        debug_assert!(moved, "phase regression: {} -> {next}", self.phase);
        trace!(phase = %self.phase, "phase");
    }

    fn evaluate(&self, schedule: &str, now: chrono::DateTime<chrono::Local>, tag: &str) -> Result<u32> {
        let evaluator = Evaluator::new(&self.backend, self.config.limits);
        let evaluator = if self.config.disable_process_restrictions {
            evaluator.unconfined()
        } else {
            evaluator
        };
        Ok(evaluator.evaluate(schedule, now, tag)?)
    }

    /// Evaluate the schedule, open (and unless dry-running, lock) the
    /// ledger, apply the retry cap and work out the command timeout.
    pub fn prepare(&mut self, inv: &Invocation) -> Result<Prepared> {
        if !self.config.allow_setuid_subprocess {
            self.backend.disable_setuid_propagation()?;
        }

        let tag = match &self.config.tag {
            Some(tag) => tag.clone(),
            None => seed::default_tag()?,
        };

        let mut delay = self.evaluate(&inv.schedule, inv.now, &tag)?;

        let initial = if delay == IMMEDIATE { STATUS_NEVER_RUN } else { 0 };
        let (ledger, opened) = Ledger::open_or_create(&self.config.file, initial)?;
        let ledger = if inv.dry_run { ledger } else { ledger.lock()? };

        if opened.created && delay == IMMEDIATE {
            delay = 0;
        }
        if opened.previous != 0 && delay > self.config.retry_interval {
            debug!(
                previous = opened.previous,
                natural = delay,
                capped = self.config.retry_interval,
                "previous run failed, retrying sooner"
            );
            delay = self.config.retry_interval;
        }

        if inv.print {
            println!("{delay}");
        }

        let timeout = match self.config.timeout_setting() {
            TimeoutSetting::Unbounded => None,
            TimeoutSetting::Seconds(secs) => Some(secs),
            TimeoutSetting::Derive => {
                let next = inv.now + Duration::seconds(i64::from(delay));
                match self.evaluate(&inv.schedule, next, &tag)? {
                    IMMEDIATE => None,
                    secs => Some(secs),
                }
            }
        };

        info!(
            command = ?inv.command,
            previous = opened.previous,
            delay,
            timeout = ?timeout,
            "scheduled"
        );

        Ok(Prepared {
            ledger,
            previous: opened.previous,
            created: opened.created,
            delay,
            timeout,
        })
    }

    /// Sleep, run the command and record its status. Returns the exit code
    /// for this process.
    pub fn execute(&mut self, prepared: Prepared, inv: &Invocation) -> Result<i32> {
        let Prepared {
            mut ledger,
            previous,
            delay,
            timeout,
            ..
        } = prepared;
        let command = PreparedCommand::new(&inv.command)?;

        self.enter(Phase::Sleeping);
        signals::reset_flags();
        signals::install(HandlerSet::Sleeping)?;
        // Held until the running handlers are in place: a signal after the
        // sleep is relayed to the command instead of being lost.
        let held = MaskGuard::block(&signals::handled_set())?;
        if signals::sleep_for(delay, &held)? == SleepOutcome::Woken {
            debug!("sleep cut short");
        }

        self.enter(Phase::PreSpawnMark);
        if previous == 0 {
            ledger.write(STATUS_KILLED)?;
        }
        std::env::set_var(ENV_TIMEOUT, timeout.map_or(-1, i64::from).to_string());
        std::env::set_var(ENV_EXIT_STATUS, previous.to_string());
        info!(command = ?inv.command, previous, timeout = ?timeout, "executing");

        self.enter(Phase::Running);
        let restrict = !self.config.disable_process_restrictions;
        let child = spawn::spawn(&self.backend, &command, self.teardown, restrict, held.previous())?;
        drop(held);
        let pgid = child.pid;
        if let Some(secs) = timeout {
            alarm::set(secs);
        }
        spawn::set_process_title(&command.title());

        let waited = wait_for_child(child.pid);
        alarm::cancel();
        signals::disarm_child();

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                spawn::signal_group(pgid, self.teardown);
                return Err(SupervisorError::Wait(e));
            }
        };
        drop(child);

        self.enter(Phase::Reaped);
        let termination = match status {
            WaitStatus::Exited(_, code) => Termination::Exited(code),
            WaitStatus::Signaled(_, sig, _) => Termination::Signaled(sig as i32),
            other => return Err(SupervisorError::UnexpectedStatus(format!("{other:?}"))),
        };
        let code = termination.exit_code();
        trace!(raw = ?status, %termination, code, "command finished");

        ledger.write(code)?;

        if !self.config.disable_signal_on_exit {
            spawn::signal_group(pgid, self.teardown);
        }
        Ok(i32::from(code))
    }

    /// One full invocation. A dry run stops after [`Supervisor::prepare`].
    pub fn run(&mut self, inv: &Invocation) -> Result<i32> {
        let prepared = self.prepare(inv)?;
        if inv.dry_run {
            return Ok(EXIT_SUCCESS);
        }
        self.execute(prepared, inv)
    }
}
