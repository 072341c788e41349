//! Structured error types for the Cyanea ecosystem.
//!
//! Proposal-local rejections are never errors: operators and densities
//! signal them with `f64::NEG_INFINITY`. Everything here aborts a run.

use thiserror::Error;

/// Unified error type for all Cyanea operations.
#[derive(Debug, Error)]
pub enum CyaneaError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error (malformed input data)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Fatal model-build error: malformed model parameters, mismatched
    /// dimensions, cycles in the dependency graph.
    #[error("configuration error in {component}: {message}")]
    Config { component: String, message: String },

    /// A broken internal invariant. Only reachable through a programming defect.
    #[error("invariant violated in {component}: {message}")]
    Invariant { component: String, message: String },

    /// Checkpoint or configuration (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

impl CyaneaError {
    /// Build a [`CyaneaError::Config`] for `component`.
    pub fn config(component: impl Into<String>, message: impl Into<String>) -> Self {
        CyaneaError::Config {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Build a [`CyaneaError::Invariant`] for `component`.
    pub fn invariant(component: impl Into<String>, message: impl Into<String>) -> Self {
        CyaneaError::Invariant {
            component: component.into(),
            message: message.into(),
        }
    }

    /// True for errors that indicate a defect rather than bad input.
    pub fn is_invariant(&self) -> bool {
        matches!(self, CyaneaError::Invariant { .. })
    }
}

/// Convenience alias used throughout the Cyanea ecosystem.
pub type Result<T> = std::result::Result<T, CyaneaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_message_names_component() {
        let err = CyaneaError::config("HKY", "kappa must be positive");
        assert_eq!(
            err.to_string(),
            "configuration error in HKY: kappa must be positive"
        );
        assert!(!err.is_invariant());
    }

    #[test]
    fn invariant_is_flagged() {
        let err = CyaneaError::invariant("graph", "dirty read");
        assert!(err.is_invariant());
        assert!(err.to_string().contains("graph"));
    }

    #[test]
    fn serde_json_errors_convert() {
        let bad: std::result::Result<u32, _> = serde_json::from_str("nope");
        let err: CyaneaError = bad.unwrap_err().into();
        assert!(matches!(err, CyaneaError::Serialization(_)));
    }
}
