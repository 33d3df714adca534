//! Error types for relmap operations.

use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Query execution errors reported by the driver
    Query(QueryError),
    /// A row failed declared validation rules; nothing was written
    Validation(ValidationError),
    /// A malformed argument (missing reference column, non-scalar reference,
    /// row missing a column of the batch column set); fails before any SQL
    /// is built
    InvalidArgument(String),
    /// The driver accepted the statement shape but reported failure with no
    /// validation errors attached
    Mutation(MutationError),
    /// An optimistic-lock column did not match at update/delete time
    StaleObject(StaleObjectError),
    /// A nested delete affected zero rows, blocking the parent-level delete
    CascadeBlocked(CascadeBlockedError),
    /// Invalid table or relation configuration (e.g. an empty link map)
    Spec(String),
    /// Custom error with message
    Custom(String),
}

/// A driver-level query failure, with the SQL that produced it when known.
#[derive(Debug)]
pub struct QueryError {
    pub sql: Option<String>,
    pub message: String,
}

/// The underlying execute reported failure without validation errors.
#[derive(Debug)]
pub struct MutationError {
    /// Which operation failed ("insert", "update", "delete").
    pub operation: &'static str,
    pub message: String,
}

/// An optimistic-lock conflict: zero rows affected despite a matching key.
#[derive(Debug)]
pub struct StaleObjectError {
    pub table: String,
    pub message: String,
}

/// A nested delete step affected zero rows.
#[derive(Debug)]
pub struct CascadeBlockedError {
    /// The child table whose delete affected nothing.
    pub table: String,
}

/// Validation errors aggregated per field.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The errors, at most one per field (first failure wins).
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required field is missing/null
    Required,
    /// Value doesn't match regex pattern
    Pattern,
    /// String is shorter than minimum length
    MinLength,
    /// String is longer than maximum length
    MaxLength,
    /// Value is below minimum
    Min,
    /// Value is above maximum
    Max,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a new empty validation error container.
    #[must_use]
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error, keeping only the first error per field.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        let field = field.into();
        if self.errors.iter().any(|e| e.field == field) {
            return;
        }
        self.errors.push(FieldValidationError {
            field,
            kind,
            message: message.into(),
        });
    }

    /// Merge another error set, preserving first-error-per-field.
    pub fn merge(&mut self, other: ValidationError) {
        for err in other.errors {
            self.add(err.field, err.kind, err.message);
        }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Shorthand for an [`Error::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Shorthand for an [`Error::Spec`].
    pub fn spec(message: impl Into<String>) -> Self {
        Error::Spec(message.into())
    }

    /// Shorthand for an [`Error::Query`] without SQL context.
    pub fn query(message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            sql: None,
            message: message.into(),
        })
    }

    /// Shorthand for an [`Error::Mutation`].
    pub fn mutation(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Mutation(MutationError {
            operation,
            message: message.into(),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => write!(f, "query error: {e}"),
            Error::Validation(e) => write!(f, "{e}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Mutation(e) => write!(f, "{e}"),
            Error::StaleObject(e) => write!(f, "{e}"),
            Error::CascadeBlocked(e) => write!(f, "{e}"),
            Error::Spec(msg) => write!(f, "invalid spec: {msg}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql {
            Some(sql) => write!(f, "{} (sql: {sql})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for MutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to {} for an unknown reason: {}",
            self.operation, self.message
        )
    }
}

impl fmt::Display for StaleObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stale row in `{}`: {}", self.table, self.message)
    }
}

impl fmt::Display for CascadeBlockedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nested delete on `{}` affected no rows; parent delete blocked",
            self.table
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for Error {}
impl std::error::Error for QueryError {}
impl std::error::Error for MutationError {}
impl std::error::Error for StaleObjectError {}
impl std::error::Error for CascadeBlockedError {}
impl std::error::Error for ValidationError {}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<MutationError> for Error {
    fn from(err: MutationError) -> Self {
        Error::Mutation(err)
    }
}

impl From<StaleObjectError> for Error {
    fn from(err: StaleObjectError) -> Self {
        Error::StaleObject(err)
    }
}

impl From<CascadeBlockedError> for Error {
    fn from(err: CascadeBlockedError) -> Self {
        Error::CascadeBlocked(err)
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
