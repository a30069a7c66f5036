//! Error types shared by the core and the drivers.

use thiserror::Error;

/// Errors surfaced by the abstraction layer.
///
/// Drivers translate their native failure codes into these kinds so that
/// application code never matches on backend specifics.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed field shorthand, or an unknown field under strict formatting.
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// A primary or unique key references an unknown field.
    #[error("index references unknown field: {0}")]
    IndexMissing(String),

    /// A field of type `primary` on a model without autoincrement.
    #[error("primary field requires autoincrement on table {0}")]
    PrimaryAutoIncMismatch(String),

    /// Unique-constraint violation reported by the driver.
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    /// A cascade references a nonexistent relation or inverse.
    #[error("unresolved relation: {0}")]
    RelationUnresolved(String),

    /// An operator has no driver translation and no evaluator fallback.
    #[error("expression cannot be lowered: {0}")]
    ExpressionUnlowerable(String),

    /// Driver rollback or lost connection.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// External cancellation aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other backend-native failure.
    #[error("driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Shorthand for [`Error::InvalidField`].
    #[must_use]
    pub fn invalid_field(detail: impl Into<String>) -> Self {
        Self::InvalidField(detail.into())
    }

    /// Shorthand for [`Error::RelationUnresolved`].
    #[must_use]
    pub fn unresolved(detail: impl Into<String>) -> Self {
        Self::RelationUnresolved(detail.into())
    }

    /// Shorthand for [`Error::ExpressionUnlowerable`].
    #[must_use]
    pub fn unlowerable(detail: impl Into<String>) -> Self {
        Self::ExpressionUnlowerable(detail.into())
    }

    /// Wraps a backend-native error.
    #[must_use]
    pub fn driver(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Driver(Box::new(error))
    }
}

/// Result type alias for layer operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
