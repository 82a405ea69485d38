use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, TimeZone};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

use runcron_core::types::{IMMEDIATE, STATUS_KILLED, STATUS_NEVER_RUN};
use runcron_core::{Config, Invocation, Phase};
use runcron_sandbox::{platform, PlatformBackend};
use runcron_scheduler::LedgerError;
use runcron_supervisor::{Supervisor, SupervisorError};

// Forks, signal dispositions and the environment are process-wide.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_path(dir: &TempDir) -> PathBuf {
    dir.path().join("job.lock")
}

fn supervisor(dir: &TempDir, tweak: impl FnOnce(&mut Config)) -> Supervisor<PlatformBackend> {
    let mut config = Config {
        file: lock_path(dir),
        tag: Some("test-host".into()),
        ..Config::default()
    };
    tweak(&mut config);
    Supervisor::new(config, platform()).unwrap()
}

fn invocation(schedule: &str, command: &[&str]) -> Invocation {
    Invocation {
        schedule: schedule.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        now: Local::now(),
        dry_run: false,
        print: false,
    }
}

fn valentines_morning() -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 2, 14, 9, 41, 7).single().unwrap()
}

fn ledger_byte(path: &Path) -> u8 {
    std::fs::read(path).unwrap()[0]
}

/// Gone, or a zombie waiting for init.
fn is_gone(pid: Pid) -> bool {
    match kill(pid, None) {
        Err(Errno::ESRCH) => true,
        _ => std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| stat.rsplit(')').next().unwrap_or("").trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

fn gone_within(pid: Pid, limit: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if is_gone(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    is_gone(pid)
}

/// Run a command that leaves a `sleep 30` behind and return its pid.
fn leave_background_sleep(sup: &mut Supervisor<PlatformBackend>, dir: &TempDir) -> Pid {
    let pidfile = dir.path().join("bg.pid");
    let code = sup
        .run(&invocation(
            "@reboot",
            &["sh", "-c", r#"sleep 30 & echo $! > "$0"; exit 0"#, pidfile.to_str().unwrap()],
        ))
        .unwrap();
    assert_eq!(code, 0);
    let pid = std::fs::read_to_string(&pidfile).unwrap();
    Pid::from_raw(pid.trim().parse().unwrap())
}

/// Deliver `sig` to the calling thread after `after`.
fn signal_me_after(after: Duration, sig: Signal) -> JoinHandle<()> {
    let target = unsafe { libc::pthread_self() } as usize;
    thread::spawn(move || {
        thread::sleep(after);
        unsafe {
            libc::pthread_kill(target as libc::pthread_t, sig as libc::c_int);
        }
    })
}

#[test]
fn exit_code_is_passed_through_and_recorded() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |_| {});
    let code = sup.run(&invocation("@reboot", &["sh", "-c", "exit 3"])).unwrap();
    assert_eq!(code, 3);
    assert_eq!(ledger_byte(&lock_path(&dir)), 3);
    assert_eq!(sup.phase(), Phase::Reaped);
}

#[test]
fn killed_command_reports_128_plus_signal() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |_| {});
    let code = sup
        .run(&invocation("@reboot", &["sh", "-c", "kill -TERM $$"]))
        .unwrap();
    assert_eq!(code, 143);
    assert_eq!(ledger_byte(&lock_path(&dir)), 143);
}

#[test]
fn missing_program_exits_127() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |_| {});
    let code = sup
        .run(&invocation("@reboot", &["/nonexistent/runcron-test-binary"]))
        .unwrap();
    assert_eq!(code, 127);
}

#[test]
fn timeout_sends_teardown_signal_to_group() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |c| c.timeout = 1);
    let started = std::time::Instant::now();
    let code = sup.run(&invocation("@reboot", &["sleep", "30"])).unwrap();
    assert_eq!(code, 143);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn alarm_from_another_process_is_ignored() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |c| c.timeout = -1);
    let code = sup
        .run(&invocation(
            "@reboot",
            &["sh", "-c", "kill -ALRM $PPID; sleep 1; exit 5"],
        ))
        .unwrap();
    assert_eq!(code, 5);
}

#[test]
fn command_sees_timeout_and_previous_status() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |c| c.timeout = 7);
    let code = sup
        .run(&invocation(
            "@reboot",
            &[
                "sh",
                "-c",
                r#"test "$RUNCRON_TIMEOUT" = 7 && test "$RUNCRON_EXIT_STATUS" = 255"#,
            ],
        ))
        .unwrap();
    assert_eq!(code, 0);
}

#[test]
fn unbounded_timeout_is_exported_as_minus_one() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |_| {});
    // @reboot derives no timeout
    let code = sup
        .run(&invocation(
            "@reboot",
            &["sh", "-c", r#"test "$RUNCRON_TIMEOUT" = -1"#],
        ))
        .unwrap();
    assert_eq!(code, 0);
}

#[test]
fn crash_marker_is_written_before_spawn() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    std::fs::write(&path, [0u8]).unwrap();

    let mut sup = supervisor(&dir, |c| c.timeout = -1);
    let code = sup
        .run(&invocation(
            "* * * * * *",
            &[
                "sh",
                "-c",
                r#"test "$(od -An -tu1 "$0" | tr -d ' ')" = 137"#,
                path.to_str().unwrap(),
            ],
        ))
        .unwrap();
    assert_eq!(code, 0, "command did not observe the crash marker");
    assert_eq!(ledger_byte(&path), 0);
}

#[test]
fn no_crash_marker_after_failure() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let path = lock_path(&dir);
    std::fs::write(&path, [4u8]).unwrap();

    let mut sup = supervisor(&dir, |c| c.timeout = -1);
    let code = sup
        .run(&invocation(
            "* * * * * *",
            &[
                "sh",
                "-c",
                r#"test "$(od -An -tu1 "$0" | tr -d ' ')" = 4"#,
                path.to_str().unwrap(),
            ],
        ))
        .unwrap();
    assert_eq!(code, 0);
    assert_ne!(ledger_byte(&path), STATUS_KILLED);
}

#[test]
fn failed_previous_run_caps_delay_at_retry_interval() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    std::fs::write(lock_path(&dir), [1u8]).unwrap();

    let mut sup = supervisor(&dir, |c| c.retry_interval = 60);
    let mut inv = invocation("@daily", &["true"]);
    inv.now = valentines_morning();
    let prepared = sup.prepare(&inv).unwrap();
    assert_eq!(prepared.previous, 1);
    assert_eq!(prepared.delay, 60);
    // next midnight is 60 seconds closer
    assert_eq!(prepared.timeout, Some(51_533 - 60));
}

#[test]
fn successful_previous_run_keeps_natural_delay() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    std::fs::write(lock_path(&dir), [0u8]).unwrap();

    let mut sup = supervisor(&dir, |c| c.retry_interval = 60);
    let mut inv = invocation("@daily", &["true"]);
    inv.now = valentines_morning();
    let prepared = sup.prepare(&inv).unwrap();
    assert_eq!(prepared.delay, 51_533);
    assert_eq!(prepared.timeout, Some(86_400));
    assert!(prepared.ledger_is_locked());
}

#[test]
fn second_instance_fails_fast() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let inv = invocation("@hourly", &["true"]);

    let mut first = supervisor(&dir, |_| {});
    let _held = first.prepare(&inv).unwrap();

    let mut second = supervisor(&dir, |_| {});
    let err = second.prepare(&inv).err().unwrap();
    assert!(
        matches!(err, SupervisorError::Ledger(LedgerError::Locked { .. })),
        "{err}"
    );
}

#[test]
fn reboot_runs_once_per_ledger() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let inv = invocation("@reboot", &["true"]);

    let first = supervisor(&dir, |_| {}).prepare(&inv).unwrap();
    assert!(first.created);
    assert_eq!(first.previous, STATUS_NEVER_RUN);
    assert_eq!(first.delay, 0);
    assert_eq!(first.timeout, None);
    drop(first);

    // never-run status counts as a failure: retried after the interval
    let again = supervisor(&dir, |c| c.retry_interval = 90).prepare(&inv).unwrap();
    assert!(!again.created);
    assert_eq!(again.delay, 90);
    drop(again);

    std::fs::write(lock_path(&dir), [0u8]).unwrap();
    let done = supervisor(&dir, |_| {}).prepare(&inv).unwrap();
    assert_eq!(done.delay, IMMEDIATE);
}

#[test]
fn dry_run_neither_locks_nor_runs() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    let mut inv = invocation(
        "@reboot",
        &["sh", "-c", r#"touch "$0""#, marker.to_str().unwrap()],
    );
    inv.dry_run = true;

    let mut sup = supervisor(&dir, |_| {});
    assert!(!sup.prepare(&inv).unwrap().ledger_is_locked());
    assert_eq!(sup.run(&inv).unwrap(), 0);
    assert!(!marker.exists());
}

#[test]
fn unconfined_evaluation_matches() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut inv = invocation("@daily", &["true"]);
    inv.dry_run = true;
    inv.now = valentines_morning();

    let confined = supervisor(&dir, |_| {}).prepare(&inv).unwrap();
    let unconfined = supervisor(&dir, |c| c.disable_process_restrictions = true)
        .prepare(&inv)
        .unwrap();
    assert_eq!(confined.delay, unconfined.delay);
    assert_eq!(confined.timeout, unconfined.timeout);
}

#[test]
fn wake_signal_ends_sleep_early() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |_| {});
    let mut inv = invocation("@daily", &["true"]);
    inv.now = valentines_morning();

    let prepared = sup.prepare(&inv).unwrap();
    assert_eq!(prepared.delay, 51_533);

    let report = signal_me_after(Duration::from_millis(200), Signal::SIGUSR2);
    let wake = signal_me_after(Duration::from_millis(400), Signal::SIGUSR1);
    let code = sup.execute(prepared, &inv).unwrap();
    report.join().unwrap();
    wake.join().unwrap();

    assert_eq!(code, 0);
    assert_eq!(ledger_byte(&lock_path(&dir)), 0);
}

#[test]
fn terminating_signal_aborts_sleep() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    std::fs::write(lock_path(&dir), [0u8]).unwrap();
    let mut sup = supervisor(&dir, |_| {});
    let mut inv = invocation("@daily", &["true"]);
    inv.now = valentines_morning();

    let prepared = sup.prepare(&inv).unwrap();
    let term = signal_me_after(Duration::from_millis(200), Signal::SIGTERM);
    let err = sup.execute(prepared, &inv).err().unwrap();
    term.join().unwrap();

    assert!(
        matches!(err, SupervisorError::Aborted { signal } if signal == libc::SIGTERM),
        "{err}"
    );
    assert_eq!(err.exit_code(), 111);
    // aborted before the marker
    assert_eq!(ledger_byte(&lock_path(&dir)), 0);
    assert_eq!(sup.phase(), Phase::Sleeping);
}

#[test]
fn leftover_background_job_is_torn_down() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |_| {});
    let bg = leave_background_sleep(&mut sup, &dir);
    let gone = gone_within(bg, Duration::from_secs(5));
    if !gone {
        let _ = kill(bg, Signal::SIGKILL);
    }
    assert!(gone, "background job {bg} survived teardown");
}

#[test]
fn signal_on_exit_can_be_disabled() {
    let _guard = serial();
    let dir = TempDir::new().unwrap();
    let mut sup = supervisor(&dir, |c| c.disable_signal_on_exit = true);
    let bg = leave_background_sleep(&mut sup, &dir);
    thread::sleep(Duration::from_millis(300));
    let alive = !is_gone(bg);
    let _ = kill(bg, Signal::SIGKILL);
    assert!(alive, "background job {bg} was signalled");
}
