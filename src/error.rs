//! Error types for the Quickstep trace compiler.
//!
//! Only compilation failures are represented here. Recording aborts are
//! expected control flow and are modeled by [`crate::recorder::AbortReason`];
//! they never surface as `Error` values.

use thiserror::Error;

/// Errors raised while turning a recorded trace into installed native code.
///
/// Per the failure policy, every variant results in the trace being
/// abandoned and the interpreter continuing on the slow path; none of them
/// is user-visible except through the abort counters.
#[derive(Debug, Error)]
pub enum Error {
    /// The recorded trace produced no snapshots, so the compiled loop would
    /// have no exit.
    #[error("trace has no snapshots; refusing to compile an inescapable loop")]
    NoSnapshots,

    /// The IR buffer hit its fixed node cap during emission.
    #[error("IR buffer full ({0} nodes)")]
    IrBufferFull(usize),

    /// The snapshot table or the shared entry pool hit its cap.
    #[error("snapshot capacity exceeded: {0}")]
    SnapshotOverflow(&'static str),

    /// More live ranges than the allocator can track.
    #[error("live range capacity exceeded ({0} ranges)")]
    LiveRangeOverflow(usize),

    /// The assembler backend reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Executable-memory allocation or relocation failed.
    #[error("code memory error: {0}")]
    CodeMemory(String),

    /// An internal invariant was violated (SSA id out of range, register
    /// pool underflow). Debug builds panic at the violation site instead;
    /// release builds abandon the trace with this error.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
