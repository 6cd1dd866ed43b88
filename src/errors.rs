//! Crate-wide error taxonomy.
//!
//! Every failure is reported synchronously to the immediate caller and
//! never retried internally. The dispatch path is the one exception to
//! visibility: it maps any internal fault to a suppressed verdict instead
//! of propagating, so firing a trace point can never fault its caller.

use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    /// Bad capacity or frame-depth limit at table creation.
    #[error("invalid table configuration")]
    InvalidConfiguration,

    /// Slot index outside the table bounds (mutating operations only;
    /// lookups tolerate unknown keys and return an empty result).
    #[error("slot index out of table bounds")]
    OutOfRange,

    /// Remove addressed an empty slot.
    #[error("no record occupies this slot")]
    NotFound,

    /// Insert collided with a different resident record and overwriting
    /// was not permitted.
    #[error("slot already holds a colliding record")]
    AlreadyExists,

    /// Skip count meets or exceeds the number of captured frames.
    #[error("skip exceeds captured stack depth")]
    InsufficientFrames,

    /// Allocation failed, or the projected memory cost of a new table
    /// exceeds the 32-bit byte budget.
    #[error("allocation failed or memory budget exceeded")]
    ResourceExhausted,

    /// The program is already attached at this attachment point.
    #[error("program already attached at this point")]
    AlreadyAttached,
}
