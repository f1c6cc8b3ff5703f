use std::fmt;

/// Errors raised while building, evaluating or assigning computed fields.
///
/// Construction errors never leave a partially built field behind, evaluation errors
/// never leave partial values in a value cache.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldError {
    // construction
    MissingSourceField,
    ComponentCountMismatch { expected: usize, found: usize },
    InvalidDimension(usize),
    InvalidSourceCount { expected: usize, found: usize },
    DuplicateName(String),
    UnknownFieldName(String),
    StaleField,
    CyclicDependency(String),
    FieldInUse(String),
    ForeignField,
    // evaluation
    LocationNotSet,
    NotDefinedAtLocation(String),
    DerivativeNotApplicable(String),
    ForeignCache,
    // numeric degeneracy
    ZeroMagnitude(String),
    // assignment
    NotAssignable(String),
    AssignRejected(String),
    // text surface
    Parse(String),
    Config(String),
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldError::MissingSourceField => write!(f, "Missing source field"),
            FieldError::ComponentCountMismatch { expected, found } => write!(
                f,
                "Invalid number of components: expected {}, found {}",
                expected, found
            ),
            FieldError::InvalidDimension(dimension) => write!(
                f,
                "Invalid dimension {}: cross product supports dimensions 2, 3 and 4",
                dimension
            ),
            FieldError::InvalidSourceCount { expected, found } => write!(
                f,
                "Invalid number of source fields: expected {}, found {}",
                expected, found
            ),
            FieldError::DuplicateName(name) => write!(f, "Field name '{}' is already in use", name),
            FieldError::UnknownFieldName(name) => write!(f, "Unknown field '{}'", name),
            FieldError::StaleField => write!(f, "Field handle refers to a removed field"),
            FieldError::CyclicDependency(name) => {
                write!(f, "Definition would make field '{}' depend on itself", name)
            }
            FieldError::FieldInUse(name) => {
                write!(f, "Field '{}' is a source of other fields", name)
            }
            FieldError::ForeignField => write!(f, "Field belongs to another field module"),
            FieldError::LocationNotSet => write!(f, "Field cache has no location"),
            FieldError::NotDefinedAtLocation(name) => {
                write!(f, "Field '{}' is not defined at the current location", name)
            }
            FieldError::DerivativeNotApplicable(msg) => {
                write!(f, "Derivative not applicable: {}", msg)
            }
            FieldError::ForeignCache => write!(f, "Field cache belongs to another field module"),
            FieldError::ZeroMagnitude(name) => write!(f, "Zero magnitude in field '{}'", name),
            FieldError::NotAssignable(name) => write!(f, "Field '{}' cannot be assigned", name),
            FieldError::AssignRejected(msg) => write!(f, "Assignment rejected: {}", msg),
            FieldError::Parse(msg) => write!(f, "Invalid field command: {}", msg),
            FieldError::Config(msg) => write!(f, "Invalid settings: {}", msg),
        }
    }
}

impl std::error::Error for FieldError {}
