//! `runcron-supervisor` — runs one scheduled command under supervision.
//!
//! | Phase          | What happens                                          |
//! |----------------|-------------------------------------------------------|
//! | idle           | evaluate schedule, open + lock ledger, derive timeout |
//! | sleeping       | interruptible sleep (wake / report / abort signals)   |
//! | pre-spawn-mark | write the crash marker if the last run succeeded      |
//! | running        | command in its own session, signals relayed to it     |
//! | reaped         | record status, tear down the process group            |

pub mod engine;
pub mod error;
pub mod signals;
pub mod spawn;

pub use engine::{Prepared, Supervisor};
pub use error::{Result, SupervisorError};
pub use signals::SleepOutcome;
