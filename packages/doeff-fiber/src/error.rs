//! Error types for the fiber runtime.

use thiserror::Error;

/// Failures of runtime operations before they are turned into exceptions.
///
/// Pure operations (growth, cloning, capsule transitions) return this; the
/// domain entry points raise the matching exception with
/// [`Domain::raise_error`](crate::domain::Domain::raise_error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("stack overflow: {required} words requested, limit is {limit} words")]
    StackOverflow { required: usize, limit: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RuntimeError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument(message.into())
    }

    pub fn stack_overflow(required: usize, limit: usize) -> Self {
        RuntimeError::StackOverflow { required, limit }
    }
}

/// Allocation failure reported by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("heap exhausted: {requested} words requested, {available} available")]
pub struct AllocError {
    pub requested: usize,
    pub available: usize,
}

impl From<AllocError> for RuntimeError {
    fn from(_: AllocError) -> Self {
        RuntimeError::OutOfMemory
    }
}

/// Proof that an exception is pending on the raising domain.
///
/// The payload itself lives in the domain's pending-exception slot and is
/// handed back by [`Domain::protect`](crate::domain::Domain::protect). Code
/// between a raise and the enclosing `protect` only ever forwards this with
/// `?`.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a raised exception must be propagated to the enclosing protect"]
pub struct Raised {
    _private: (),
}

impl Raised {
    pub(crate) fn new() -> Self {
        Raised { _private: () }
    }
}

/// Result of an entry point that may raise.
pub type RaiseResult<T> = Result<T, Raised>;

/// Exception table not usable yet. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapFault {
    #[error("Fatal error {0} during initialisation")]
    Initialisation(&'static str),

    #[error("Fatal error {0} during domain creation")]
    DomainCreation(&'static str),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::stack_overflow(2048, 1024);
        assert_eq!(
            err.to_string(),
            "stack overflow: 2048 words requested, limit is 1024 words"
        );

        let err = RuntimeError::invalid_argument("continuation already taken");
        assert!(err.to_string().contains("continuation already taken"));
    }

    #[test]
    fn test_alloc_error_maps_to_out_of_memory() {
        let err: RuntimeError = AllocError {
            requested: 10,
            available: 2,
        }
        .into();
        assert_eq!(err, RuntimeError::OutOfMemory);
    }

    #[test]
    fn test_bootstrap_fault_messages() {
        assert_eq!(
            BootstrapFault::Initialisation("FAILURE_EXN").to_string(),
            "Fatal error FAILURE_EXN during initialisation"
        );
        assert_eq!(
            BootstrapFault::DomainCreation("NOT_FOUND_EXN").to_string(),
            "Fatal error NOT_FOUND_EXN during domain creation"
        );
    }
}
