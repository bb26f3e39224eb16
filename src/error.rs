use mongodb::bson::{Bson, Document};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Field name (or qualified path such as `parent.child` / `items[2]`) to messages.
pub type ErrorMap = BTreeMap<String, Vec<String>>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ValidationFailed(#[from] ValidationFailed),

    #[error("Corresponding model could not be found. Criteria: {criteria}")]
    ModelCouldNotBeFound { criteria: Document },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn validation(&self) -> Option<&ValidationFailed> {
        match self {
            Error::ValidationFailed(failed) => Some(failed),
            _ => None,
        }
    }
}

/// What made a validation fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    Message(String),
    Fields(ErrorMap),
    /// Per batch position, only positions that failed are present.
    Batch(BTreeMap<usize, ErrorMap>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailed {
    pub received: Bson,
    pub failure: Failure,
}

impl ValidationFailed {
    pub fn message(received: impl Into<Bson>, message: impl Into<String>) -> Self {
        ValidationFailed {
            received: received.into(),
            failure: Failure::Message(message.into()),
        }
    }

    pub fn fields(received: impl Into<Bson>, errors: ErrorMap) -> Self {
        ValidationFailed {
            received: received.into(),
            failure: Failure::Fields(errors),
        }
    }

    pub fn batch(received: impl Into<Bson>, errors: BTreeMap<usize, ErrorMap>) -> Self {
        ValidationFailed {
            received: received.into(),
            failure: Failure::Batch(errors),
        }
    }

    /// Messages reported for `field`, empty when the failure is not field specific.
    pub fn errors_for(&self, field: &str) -> &[String] {
        match &self.failure {
            Failure::Fields(errors) => errors.get(field).map(Vec::as_slice).unwrap_or_default(),
            _ => &[],
        }
    }
}

impl fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            Failure::Message(message) => write!(f, "Validation failed: {message}"),
            Failure::Fields(errors) => write!(f, "Validation failed: {errors:?}"),
            Failure::Batch(errors) => write!(f, "Validation failed: {errors:?}"),
        }
    }
}

impl std::error::Error for ValidationFailed {}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("MongoDB error: {0}")]
    Mongo(mongodb::error::Error),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Unsupported operator {0}")]
    UnsupportedOperator(String),

    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(error: mongodb::error::Error) -> Self {
        if is_duplicate_key(&error) {
            StoreError::DuplicateKey(error.to_string())
        } else {
            StoreError::Mongo(error)
        }
    }
}

const DUPLICATE_KEY_CODE: i32 = 11000;

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(failure)) => failure.code == DUPLICATE_KEY_CODE,
        ErrorKind::InsertMany(failure) => failure
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY_CODE)),
        ErrorKind::Command(failure) => failure.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

/// Raised while building a schema, never per request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("A collection name must be provided.")]
    MissingCollectionName,

    #[error("A field name must be provided.")]
    MissingFieldName,

    #[error("Field name \"{0}\" cannot contain '.' or '$'.")]
    InvalidFieldName(String),

    #[error("Field \"{0}\" is declared more than once.")]
    DuplicateField(String),

    #[error("Only int fields can be auto incremented ({0}).")]
    AutoIncrementNotInt(String),

    #[error("A field cannot be mandatory and auto incremented at the same time ({0}).")]
    MandatoryAutoIncrement(String),

    #[error("A field cannot be mandatory and having a default value at the same time ({0}).")]
    MandatoryWithDefault(String),

    #[error("Dictionary field \"{0}\" must define at least one field.")]
    EmptyNestedFields(String),

    #[error("Auto increment is only supported on top level fields ({0}).")]
    NestedAutoIncrement(String),

    #[error("Revisions of versioned collection \"{0}\" cannot share a declared \"_id\" field.")]
    VersionedIdField(String),
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("A database connection URL must be provided.")]
    NoDatabaseProvided,

    #[error("A method allowing to create related models must be provided.")]
    NoRelatedModels,

    #[error(transparent)]
    Store(#[from] StoreError),
}
