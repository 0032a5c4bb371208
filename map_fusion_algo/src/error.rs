//! Error types for submap fusion
//!
//! Linear-algebra failures (`SingularBlock`, `DimensionMismatch`,
//! `IndexOutOfRange`) abort the current fusion step and leave the global map at
//! its last committed value. `AssociationFailed` only rejects the submap being
//! processed; the engine keeps accepting new submaps afterwards.

use thiserror::Error;

/// Result type used throughout the crate
pub type FusionResult<T> = Result<T, FusionError>;

/// Main error type for map fusion
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    /// A diagonal pivot vanished or went negative (matrix is not positive definite)
    #[error("singular block at index {index}: {reason}")]
    SingularBlock { index: usize, reason: String },

    /// Block size contract violated
    #[error("dimension mismatch in {context}: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        context: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// Block index outside the matrix
    #[error("block index {index} out of range for {len} blocks")]
    IndexOutOfRange { index: usize, len: usize },

    /// No usable correspondence between the submap and the global map
    #[error("data association failed: {0}")]
    AssociationFailed(String),

    /// Malformed local submap
    #[error("invalid submap: {0}")]
    InvalidSubmap(String),

    /// A reordering was not a bijection over the state indices
    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    /// Configuration failed validation or could not be parsed
    #[error("configuration error: {0}")]
    Config(String),

    /// The bounded submap queue is full
    #[error("submap queue is full")]
    QueueFull,

    /// The submap queue has no remaining receiver
    #[error("submap queue is closed")]
    QueueClosed,

    /// The fusion worker thread panicked; the engine it owned is lost
    #[error("fusion worker panicked: {0}")]
    WorkerPanicked(String),
}

impl FusionError {
    pub(crate) fn dimension(
        context: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    ) -> Self {
        FusionError::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Whether the engine should keep going with the next submap after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FusionError::AssociationFailed(_) | FusionError::InvalidSubmap(_)
        )
    }
}

impl From<serde_yaml::Error> for FusionError {
    fn from(err: serde_yaml::Error) -> Self {
        FusionError::Config(err.to_string())
    }
}

impl From<std::io::Error> for FusionError {
    fn from(err: std::io::Error) -> Self {
        FusionError::Config(format!("failed to read configuration: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = FusionError::SingularBlock {
            index: 4,
            reason: "pivot 0.0".to_string(),
        };
        assert_eq!(error.to_string(), "singular block at index 4: pivot 0.0");

        let error = FusionError::dimension("add", (2, 2), (3, 3));
        assert_eq!(
            error.to_string(),
            "dimension mismatch in add: expected (2, 2), found (3, 3)"
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(FusionError::AssociationFailed("no votes".into()).is_recoverable());
        assert!(FusionError::InvalidSubmap("empty".into()).is_recoverable());
        assert!(!FusionError::SingularBlock {
            index: 0,
            reason: String::new()
        }
        .is_recoverable());
        assert!(!FusionError::dimension("multiply", (2, 3), (2, 2)).is_recoverable());
        assert!(!FusionError::WorkerPanicked("boom".into()).is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.yaml");
        match FusionError::from(io) {
            FusionError::Config(msg) => assert!(msg.contains("missing.yaml")),
            other => panic!("Expected config error, got {other:?}"),
        }
    }
}
