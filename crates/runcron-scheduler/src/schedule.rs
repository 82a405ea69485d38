use chrono::{DateTime, Local, Timelike};
use croner::Cron;
use rand::Rng;

use runcron_core::types::IMMEDIATE;

use crate::error::{Result, ScheduleError};
use crate::seed;

/// Longest accepted schedule text, in bytes.
pub const MAX_TIMESPEC_LEN: usize = 251;

/// Alias name to 6-field expansion. `@reboot` is handled separately.
const ALIASES: &[(&str, &str)] = &[
    ("@yearly", "0 0 0 1 1 *"),
    ("@annually", "0 0 0 1 1 *"),
    ("@monthly", "0 0 0 1 * *"),
    ("@weekly", "0 0 0 * * 0"),
    ("@daily", "0 0 0 * * *"),
    ("@midnight", "0 0 0 * * *"),
    ("@hourly", "0 0 * * * *"),
];

const REBOOT: &str = "@reboot";

/// Inclusive ranges substituted for `H`, by field position.
const HASH_RANGES: [(u32, u32); 6] = [
    (0, 59), // second
    (0, 59), // minute
    (0, 23), // hour
    (1, 28), // day of month
    (1, 12), // month
    (0, 6),  // day of week
];

/// A normalized schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timespec {
    /// `@reboot`: no calendar occurrence, run immediately.
    Immediate,
    /// A six-field (or longer) cron expression with a seconds field.
    Cron(String),
}

/// Normalize raw schedule text: whitespace, field count and aliases.
pub fn normalize(text: &str) -> Result<Timespec> {
    if text.len() > MAX_TIMESPEC_LEN {
        return Err(ScheduleError::TooLong {
            max: MAX_TIMESPEC_LEN,
        });
    }

    let fields: Vec<&str> = text.split_ascii_whitespace().collect();

    match fields.len() {
        1 => alias(fields[0]),
        5 => Ok(Timespec::Cron(format!("0 {}", fields.join(" ")))),
        n if n >= 6 => Ok(Timespec::Cron(fields.join(" "))),
        n => Err(ScheduleError::FieldCount { fields: n }),
    }
}

fn alias(name: &str) -> Result<Timespec> {
    if name == REBOOT {
        return Ok(Timespec::Immediate);
    }
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, spec)| Timespec::Cron((*spec).to_string()))
        .ok_or_else(|| ScheduleError::UnknownAlias(name.to_string()))
}

/// Replace every field that is exactly `H` with a value drawn from `rng`.
///
/// Fields past the sixth are left alone.
pub fn expand_hashed<R: Rng>(spec: &str, rng: &mut R) -> String {
    spec.split(' ')
        .enumerate()
        .map(|(i, field)| match (field, HASH_RANGES.get(i)) {
            ("H", Some(&(lo, hi))) => rng.gen_range(lo..=hi).to_string(),
            _ => field.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Seconds from `now` (truncated to whole seconds) to the next occurrence.
///
/// Never returns 0 and never returns [`IMMEDIATE`].
pub fn next_delay(spec: &str, now: DateTime<Local>) -> Result<u32> {
    let now = now.with_nanosecond(0).unwrap_or(now);

    let cron = Cron::new(spec)
        .with_seconds_required()
        .parse()
        .map_err(|e| ScheduleError::Parse(e.to_string()))?;

    let next = cron
        .find_next_occurrence(&now, false)
        .map_err(|e| ScheduleError::NoOccurrence(e.to_string()))?;

    let secs = (next - now).num_seconds();
    if secs <= 0 {
        return Err(ScheduleError::NotInFuture { secs });
    }

    Ok(u32::try_from(secs).unwrap_or(u32::MAX).min(IMMEDIATE - 1))
}

/// Full evaluation: normalize, expand `H` fields from `tag`, compute delay.
///
/// Returns [`IMMEDIATE`] for `@reboot`. Pure apart from reading the local
/// time zone, so it can run inside a confined process.
pub fn evaluate(text: &str, now: DateTime<Local>, tag: &str) -> Result<u32> {
    match normalize(text)? {
        Timespec::Immediate => Ok(IMMEDIATE),
        Timespec::Cron(spec) => {
            let spec = if spec.split(' ').any(|f| f == "H") {
                expand_hashed(&spec, &mut seed::rng_for_tag(tag))
            } else {
                spec
            };
            next_delay(&spec, now)
        }
    }
}
