//! `runcron-core` — shared configuration and vocabulary for runcron.
//!
//! | Module   | Contents                                                   |
//! |----------|------------------------------------------------------------|
//! | `config` | [`Config`] layered from defaults, TOML, env and CLI flags  |
//! | `types`  | exit codes, status translation, supervision [`Phase`]      |
//! | `error`  | [`CoreError`]                                              |

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, ConfigOverrides, EvaluatorLimits, LimitOverrides, TimeoutSetting};
pub use error::{CoreError, Result};
pub use types::{Invocation, Phase, Termination};
