//! Filter error types
//!
//! Errors raised when a filter set is saved or bound. Evaluation itself never
//! fails: bad patterns and unknown operators degrade per rule.

use thiserror::Error;

/// Errors detected when validating a filter set
#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    /// `in_range` with `min > max`
    #[error("Invalid range for '{field}': min {min} is greater than max {max}")]
    InvalidRange { field: String, min: f64, max: f64 },

    /// `in_range` without a `{min, max}` value
    #[error("Rule on '{0}' uses in_range but has no {{min, max}} value")]
    MissingRange(String),

    /// Range bounds that are not numbers
    #[error("Range bounds for '{0}' must be numeric")]
    NonNumericRange(String),

    /// Enabled rule without a field path
    #[error("Rule {rule} in group {group} has no field")]
    EmptyField { group: usize, rule: usize },
}

/// Result type for filter validation
pub type FilterResult<T> = Result<T, FilterError>;
