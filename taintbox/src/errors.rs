use thiserror::Error;

/// Failure of a tainted-value operation.
///
/// Every fallible operation in this crate reports one of these; the sandbox
/// machinery never panics on attacker-reachable paths. `Clone + PartialEq`
/// so tests and callers can match on exact outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaintError {
    /// Dereference or arithmetic on a null tainted pointer.
    #[error("tainted pointer is null")]
    Null,

    /// A pointer operation would touch memory outside the arena, or the
    /// pointer is not a valid location for its element type.
    #[error("pointer escapes sandbox memory at host address {addr:#x} ({context})")]
    Bounds {
        /// The offending host address.
        addr: usize,
        /// Which operation tripped the check.
        context: &'static str,
    },

    /// Array access past the statically known element count.
    #[error("index {index} out of bounds for array of length {len}")]
    Index { index: usize, len: usize },

    /// Offset arithmetic wrapped while computing a pointer target.
    #[error("pointer offset computation overflowed")]
    Overflow,

    /// The verifier closure refused the snapshot.
    #[error("verification rejected: {reason}")]
    VerificationRejected { reason: String },

    /// The sandboxed computation failed, or the instance was already
    /// poisoned by an earlier failure.
    #[error("sandbox fault: {reason}")]
    SandboxFault { reason: String },

    /// A value from one sandbox instance was used with another.
    #[error("operands belong to different sandbox instances")]
    CrossSandbox,
}

/// Crate-wide result alias.
pub type Result<T, E = TaintError> = core::result::Result<T, E>;
