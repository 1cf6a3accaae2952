//! Error taxonomy for the command station.
//!
//! The dispatcher never propagates an `Err` to its caller (see `dispatcher`);
//! this type exists for the pieces that legitimately fail outward: startup
//! (config/hardware init) and the pulse sink / current sensor boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DccError {
    /// The message is the exact reply body the dispatcher wraps in
    /// `<Error: ...>` -- it carries its own trailing period.
    #[error("{0}")]
    ModeConflict(&'static str),

    #[error("malformed command.")]
    MalformedCommand,

    #[error("hardware init failed: {0}")]
    HardwareInit(String),

    #[error("overload tripped, cannot power on.")]
    Overload,

    #[error("pulse sink error: {0}")]
    PulseSink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type DccResult<T> = Result<T, DccError>;
