//! Structured error types for velocyte.
//!
//! Only structural problems are errors. A single gene that cannot be fitted
//! is recorded in the per-gene fit result and never surfaces here.

use thiserror::Error;

/// Unified error type for all velocyte operations.
#[derive(Debug, Error)]
pub enum VelocyteError {
    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or malformed neighbor graph, layer, or option value
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cell or gene counts disagree between inputs; no gene can be fit safely
    #[error("dimension mismatch: {what} (expected {expected}, found {found})")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
}

impl VelocyteError {
    /// Shorthand for a [`VelocyteError::DimensionMismatch`].
    pub fn dimension(what: impl Into<String>, expected: usize, found: usize) -> Self {
        VelocyteError::DimensionMismatch {
            what: what.into(),
            expected,
            found,
        }
    }

    /// Whether this error aborts a whole run rather than a single request.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            VelocyteError::Configuration(_) | VelocyteError::DimensionMismatch { .. }
        )
    }
}

/// Convenience alias used throughout velocyte.
pub type Result<T> = std::result::Result<T, VelocyteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_message() {
        let err = VelocyteError::dimension("neighbor graph rows", 10, 8);
        assert_eq!(
            err.to_string(),
            "dimension mismatch: neighbor graph rows (expected 10, found 8)"
        );
        assert!(err.is_structural());
    }

    #[test]
    fn invalid_input_not_structural() {
        assert!(!VelocyteError::InvalidInput("x".into()).is_structural());
    }
}
