use thiserror::Error;

use crate::strategy::StrategyFailure;

#[derive(Error, Debug)]
pub enum RawError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("{tool} timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("{tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Path validation failed: {0}")]
    PathValidation(String),

    #[error("No suitable converter available ({})", describe_attempts(.0))]
    AggregateFallback(Vec<StrategyFailure>),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl RawError {
    /// True when a deadline expired and the process was force-terminated.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RawError::Timeout { .. })
    }

    pub fn execution(tool: impl Into<String>, message: impl Into<String>) -> Self {
        RawError::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Failures carried by an aggregate error, empty for every other kind.
    pub fn attempts(&self) -> &[StrategyFailure] {
        match self {
            RawError::AggregateFallback(attempts) => attempts,
            _ => &[],
        }
    }
}

fn describe_attempts(attempts: &[StrategyFailure]) -> String {
    if attempts.is_empty() {
        return "no strategy attempted".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy.name(), a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, RawError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;

    #[test]
    fn test_aggregate_message_names_every_attempt() {
        let err = RawError::AggregateFallback(vec![
            StrategyFailure::new(Strategy::EmulationLayerHalfSize, "dcraw_emu exited 1"),
            StrategyFailure::new(Strategy::ClassicDecoderHalfSize, "empty output"),
        ]);

        let message = err.to_string();
        assert!(message.contains("No suitable converter available"));
        assert!(message.contains("dcraw_emu exited 1"));
        assert!(message.contains("empty output"));
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn test_timeout_is_distinct_from_exit_failure() {
        let timeout = RawError::Timeout { tool: "dcraw".into(), timeout_ms: 30_000 };
        let failed = RawError::execution("dcraw", "exit status 1");

        assert!(timeout.is_timeout());
        assert!(!failed.is_timeout());
    }
}
