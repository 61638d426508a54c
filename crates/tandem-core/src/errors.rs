//! Unified error type for the tandem runtime.
//!
//! A single enum carries every signal the scheduler dispatches on, including
//! the two control markers (`Done`, `CriticalSectionAborted`) that compiled
//! critical sections return through the ordinary `Result` channel. Keeping
//! control markers in the error enum means a section body is one fallible
//! function and `?` composes all the way down to resource reads.

/// Unified error type for all runtime operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The archetype context was closed; every pending resource operation
    /// resolves to this. The scheduler treats it as clean termination.
    #[error("context closed")]
    ContextClosed,

    /// A precondition of the current critical section is not yet satisfied
    /// (guard false, empty selection set, unacknowledged mailbox). The
    /// scheduler aborts the touched resources and retries the same label.
    #[error("critical section aborted")]
    CriticalSectionAborted,

    /// A specification assertion was violated inside a section body.
    #[error("assertion failed: {message}")]
    AssertionFailed {
        /// Description of the violated assertion
        message: String,
    },

    /// The algorithm signalled completion. The scheduler commits the touched
    /// resources and terminates the archetype cleanly.
    #[error("algorithm terminated")]
    Done,

    /// A typed value accessor was applied to the wrong variant.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Variant the accessor required
        expected: &'static str,
        /// Variant actually stored
        found: &'static str,
    },

    /// RPC or transport failure.
    #[error("network error: {message}")]
    Network {
        /// Description of the transport failure
        message: String,
    },

    /// Fatal condition: missing label, resource misregistration, resource
    /// contract violation. Terminates the archetype with a diagnostic.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the fatal condition
        message: String,
    },
}

impl RuntimeError {
    /// Create an assertion failure
    pub fn assertion_failed(message: impl Into<String>) -> Self {
        Self::AssertionFailed {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a fatal internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type alias used throughout the runtime.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
