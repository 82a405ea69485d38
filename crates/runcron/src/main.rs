use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use chrono::Local;
use clap::{ArgAction, Parser};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use runcron_core::types::{EXIT_INTERNAL, EXIT_USAGE};
use runcron_core::{Config, ConfigOverrides, CoreError, Invocation, LimitOverrides};
use runcron_scheduler::{parse_timestamp, ScheduleError};
use runcron_supervisor::{Supervisor, SupervisorError};

/// Run a command once, at the next time matching a cron schedule.
#[derive(Parser, Debug)]
#[command(name = "runcron", version, long_about = None)]
struct Cli {
    /// Lock file holding the previous exit status
    #[arg(short = 'f', long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Change to this directory before doing anything else
    #[arg(short = 'C', long, value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Seed for H fields (default: host name)
    #[arg(short = 't', long)]
    tag: Option<String>,

    /// Command timeout in seconds: 0 derives it from the schedule, negative disables it
    #[arg(short = 'T', long, value_name = "SECS", allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Retry interval after a failed run
    #[arg(short = 'P', long, value_name = "SECS")]
    retry_interval: Option<u32>,

    /// Signal sent to the command's process group on timeout and exit
    #[arg(short = 's', long, value_name = "NUM")]
    signal: Option<i32>,

    /// CPU seconds allowed to the schedule evaluator
    #[arg(long, value_name = "SECS")]
    limit_cpu: Option<u64>,

    /// Address space in bytes allowed to the schedule evaluator
    #[arg(long = "limit-as", value_name = "BYTES")]
    limit_as: Option<u64>,

    /// Reference time: "YYYY-MM-DD HH:MM:SS" or "@<epoch seconds>"
    #[arg(long, value_name = "TIME")]
    timestamp: Option<String>,

    /// Evaluate the schedule and exit
    #[arg(short = 'n', long = "dryrun")]
    dry_run: bool,

    /// Print the sleep delay to stdout
    #[arg(short = 'p', long)]
    print: bool,

    /// Evaluate in-process and skip privilege restrictions
    #[arg(long)]
    disable_process_restrictions: bool,

    /// Let the command gain privileges through setuid executables
    #[arg(long)]
    allow_setuid_subprocess: bool,

    /// Do not signal the process group after the command exits
    #[arg(long)]
    disable_signal_on_exit: bool,

    /// More diagnostics (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// TOML config file (default: $RUNCRON_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Cron expression or @alias
    schedule: String,

    /// Program and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let limits = (self.limit_cpu.is_some() || self.limit_as.is_some()).then(|| LimitOverrides {
            cpu: self.limit_cpu,
            address_space: self.limit_as,
        });
        ConfigOverrides {
            file: self.file.clone(),
            chdir: self.chdir.clone(),
            tag: self.tag.clone(),
            timeout: self.timeout,
            retry_interval: self.retry_interval,
            signal: self.signal,
            limits,
            disable_process_restrictions: self.disable_process_restrictions,
            allow_setuid_subprocess: self.allow_setuid_subprocess,
            disable_signal_on_exit: self.disable_signal_on_exit,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("RUNCRON_LOG").unwrap_or_else(|_| level.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = Config::load(cli.config.as_deref(), &cli.overrides())?;

    if let Some(dir) = &config.chdir {
        std::env::set_current_dir(dir).with_context(|| format!("chdir {}", dir.display()))?;
    }

    let now = match cli.timestamp.as_deref() {
        Some(ts) => parse_timestamp(ts)?,
        None => Local::now(),
    };

    let invocation = Invocation {
        schedule: cli.schedule,
        command: cli.command,
        now,
        dry_run: cli.dry_run,
        print: cli.print,
    };
    debug!(?config, "configuration loaded");

    let mut supervisor = Supervisor::new(config, runcron_sandbox::platform())?;
    Ok(supervisor.run(&invocation)?)
}

/// Bad flags, config values and timestamps are usage errors; everything
/// else is internal.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<CoreError>().is_some() {
        return EXIT_USAGE;
    }
    if let Some(ScheduleError::InvalidTimestamp(_)) = err.downcast_ref::<ScheduleError>() {
        return EXIT_USAGE;
    }
    match err.downcast_ref::<SupervisorError>() {
        Some(SupervisorError::Config(_)) | Some(SupervisorError::InvalidSignal(_)) => EXIT_USAGE,
        Some(e) => e.exit_code(),
        None => EXIT_INTERNAL,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("runcron: {e:#}");
            exit_code_for(&e)
        }
    };
    ExitCode::from(code.clamp(0, 255) as u8)
}
