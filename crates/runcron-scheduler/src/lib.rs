//! `runcron-scheduler` — schedule evaluation and the persisted retry ledger.
//!
//! # Schedule text
//!
//! | Fields | Handling                                          |
//! |--------|---------------------------------------------------|
//! | 1      | `@alias` lookup; `@reboot` means run immediately  |
//! | 5      | classic crontab, a `0` seconds field is prepended |
//! | 6+     | used as given                                     |
//!
//! A field that is exactly `H` is replaced by a value derived from the seed
//! tag (the host name by default), so a fleet spreads its load while each
//! host keeps a stable slot.
//!
//! # Ledger
//!
//! [`ledger::Ledger`] is a one-byte file holding the previous exit status,
//! locked exclusively for the lifetime of an invocation.

pub mod error;
pub mod ledger;
pub mod schedule;
pub mod seed;
pub mod timestamp;

pub use error::{LedgerError, Result, ScheduleError};
pub use ledger::{Ledger, Opened};
pub use schedule::{evaluate, normalize, Timespec};
pub use timestamp::parse_timestamp;
