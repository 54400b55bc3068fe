//! Error taxonomy shared across the core modules.
//!
//! Each variant corresponds to one category from the error handling design:
//! configuration, name resolution, protocol framing, kernel calls, and
//! scheduler invariant violations. Sample rejections are deliberately not
//! part of this enum — they're routine filtering outcomes, not errors, and
//! are represented by `refclock::SampleOutcome` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error at line {line}: {msg}")]
    Config { line: usize, msg: String },

    #[error("name resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("control-wire frame malformed")]
    Framing,

    #[error("kernel clock call failed: {0}")]
    Kernel(#[from] std::io::Error),

    #[error("scheduler invariant violated: {0}")]
    SchedulerInvariant(&'static str),
}

/// Outcome of an asynchronous name-resolution attempt.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("temporary resolution failure for {name}: {reason}")]
    Temporary { name: String, reason: String },

    #[error("permanent resolution failure for {name}: {reason}")]
    Permanent { name: String, reason: String },
}
