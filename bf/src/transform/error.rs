//! Transformation error types

use thiserror::Error;

/// Per-field transformation failure
///
/// Never aborts the record; the validation layer downgrades it to an
/// error-severity validation failure for the target field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformationError {
    #[error("{target}: source field {field} is missing")]
    MissingSourceField { target: String, field: String },

    #[error("{target}: no condition matched")]
    NoMatchingCondition { target: String },

    #[error("{target}: key '{key}' not found in {table}")]
    LookupNotFound { target: String, table: String, key: String },

    #[error("{target}: lookup in {table} failed: {message}")]
    LookupFailure {
        target: String,
        table: String,
        message: String,
    },

    #[error("{target}: expression failed: {message}")]
    Expression { target: String, message: String },

    #[error("{target}: {message}")]
    Format { target: String, message: String },

    #[error("{target}: value of length {actual} exceeds {max}")]
    ValueTooLong { target: String, actual: usize, max: u32 },
}

impl TransformationError {
    /// Target field the failure belongs to
    pub fn target(&self) -> &str {
        match self {
            Self::MissingSourceField { target, .. }
            | Self::NoMatchingCondition { target }
            | Self::LookupNotFound { target, .. }
            | Self::LookupFailure { target, .. }
            | Self::Expression { target, .. }
            | Self::Format { target, .. }
            | Self::ValueTooLong { target, .. } => target,
        }
    }

    /// Short kind name for reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSourceField { .. } => "missing-source-field",
            Self::NoMatchingCondition { .. } => "no-matching-condition",
            Self::LookupNotFound { .. } => "lookup-not-found",
            Self::LookupFailure { .. } => "lookup-failure",
            Self::Expression { .. } => "expression",
            Self::Format { .. } => "format",
            Self::ValueTooLong { .. } => "value-too-long",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_and_kind() {
        let err = TransformationError::LookupNotFound {
            target: "dept_name".to_string(),
            table: "departments".to_string(),
            key: "99".to_string(),
        };
        assert_eq!(err.target(), "dept_name");
        assert_eq!(err.kind(), "lookup-not-found");
        assert_eq!(err.to_string(), "dept_name: key '99' not found in departments");
    }
}
