// src/error.rs
//
// Error taxonomy for the rollout core.
//
// - Configuration errors are raised at construction and never recovered.
// - Masking violations mean the action distribution was built wrong.
// - Numeric degeneracy is reported instead of letting NaN propagate.
// - Shape errors surface at the boundary where the mismatch is visible.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PomoError>;

#[derive(Debug, Error)]
pub enum PomoError {
    /// Invalid configuration value or combination.
    #[error("configuration error in '{field}': {message}")]
    Configuration { field: String, message: String },

    /// No embedding / context adapter registered under this environment name.
    #[error("unknown environment name '{name}' (registered: {})", .known.join(", "))]
    UnknownEnvironment { name: String, known: Vec<String> },

    /// A masked (infeasible) action was selected, or a live trajectory had
    /// no feasible action left.
    #[error("masking violation at step {step}, trajectory {trajectory}: {message}")]
    MaskingViolation {
        trajectory: usize,
        step: usize,
        message: String,
    },

    /// A numeric computation hit a degenerate input (zero range, NaN, -inf).
    #[error("numeric degeneracy: {context}")]
    NumericDegeneracy { context: String },

    /// Tensor dimensions do not line up.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    Shape {
        what: String,
        expected: String,
        actual: String,
    },

    /// The environment never signalled termination.
    #[error("rollout exceeded the step limit of {limit} without terminating")]
    StepLimitExceeded { limit: usize },

    /// Reading a config file failed.
    #[error("failed to read config file '{path}': {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Parsing a config file failed.
    #[error("failed to parse config YAML: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Ndarray(#[from] ndarray::ShapeError),
}

impl PomoError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        PomoError::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn shape(
        what: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        PomoError::Shape {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// True for the error classes that must abort construction.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PomoError::Configuration { .. }
                | PomoError::UnknownEnvironment { .. }
                | PomoError::ConfigIo { .. }
                | PomoError::ConfigParse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_display() {
        let err = PomoError::config("num_augment", "must be 8 for dihedral8");
        assert_eq!(
            err.to_string(),
            "configuration error in 'num_augment': must be 8 for dihedral8"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_environment_lists_known_names() {
        let err = PomoError::UnknownEnvironment {
            name: "jssp".to_string(),
            known: vec!["cvrp".to_string(), "tsp".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("jssp"));
        assert!(msg.contains("cvrp, tsp"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_masking_violation_is_not_configuration() {
        let err = PomoError::MaskingViolation {
            trajectory: 3,
            step: 1,
            message: "selected node 2".to_string(),
        };
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("trajectory 3"));
    }
}
