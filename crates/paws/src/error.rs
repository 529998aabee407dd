/// Errors surfaced by the training engine.
///
/// Per-run problems that the engine absorbs (imbalanced batches, weak
/// convergence, divergence) are not errors: they show up as counters, the
/// `degraded` flag, or a terminal state on the run result.
#[derive(Debug, thiserror::Error)]
pub enum PawsError {
    /// Invalid configuration, detected before any compute starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Non-finite loss or parameter that survived every retry.
    #[error("Numeric instability at epoch {epoch}, step {step}: {detail}")]
    NumericInstability {
        epoch: usize,
        step: usize,
        detail: String,
    },

    /// Dataset unusable for the requested operation.
    #[error("Data error: {0}")]
    Data(String),

    /// Saving or loading model weights failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PawsError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PawsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = PawsError::NumericInstability {
            epoch: 3,
            step: 17,
            detail: "loss is NaN".into(),
        };
        assert_eq!(
            err.to_string(),
            "Numeric instability at epoch 3, step 17: loss is NaN"
        );
        assert_eq!(
            PawsError::config("mu out of range").to_string(),
            "Configuration error: mu out of range"
        );
    }

    #[test]
    fn test_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PawsError = io.into();
        assert!(matches!(err, PawsError::Io(_)));
    }
}
