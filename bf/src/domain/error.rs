//! Configuration error types

use thiserror::Error;

/// A job configuration that cannot be run
///
/// Raised while loading or compiling a `JobConfiguration`. A job that hits
/// one of these never starts.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Job configuration not found: {0}")]
    NotFound(String),

    #[error("Failed to read job configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse job configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Duplicate target field: {0}")]
    DuplicateTarget(String),

    #[error("Invalid position for {target}: {reason}")]
    InvalidPosition { target: String, reason: String },

    #[error("Mappings mix explicit and implicit positions")]
    MixedPositions,

    #[error("Fixed-width field {0} needs a length")]
    MissingLength(String),

    #[error("Invalid format for {target}: {message}")]
    InvalidFormat { target: String, message: String },

    #[error("Invalid expression for {target}: {message}")]
    Expression { target: String, message: String },

    #[error("Invalid pattern in rule {rule}: {message}")]
    InvalidPattern { rule: String, message: String },

    #[error("Rule {0} has no fields")]
    MissingFields(String),

    #[error("Unknown business rule: {0}")]
    UnknownBusinessRule(String),

    #[error("Invalid custom query in rule {rule}: {message}")]
    InvalidQuery { rule: String, message: String },

    #[error("Loader template error: {0}")]
    Template(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ConfigurationError::InvalidPosition {
            target: "amount".to_string(),
            reason: "duplicate position 3".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid position for amount: duplicate position 3");
        assert_eq!(
            ConfigurationError::MissingLength("code".to_string()).to_string(),
            "Fixed-width field code needs a length"
        );
    }
}
