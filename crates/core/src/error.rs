//! Core Error Types
//!
//! Defines the error type shared by every binscope crate. Generator, rule and
//! detector failures all travel as `CoreError` so the orchestrator can catch
//! them per rule or per entity without knowing who raised them.

use thiserror::Error;

use crate::value::ValueTag;

/// Core error type for the binscope workspace.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Two generators claim the same output tag for overlapping rule classes
    #[error("Duplicate generator for value '{tag}': '{existing}' and '{duplicate}'")]
    DuplicateGenerator {
        tag: ValueTag,
        existing: &'static str,
        duplicate: &'static str,
    },

    /// A generator declaration is malformed
    #[error("Invalid generator '{name}': {reason}")]
    InvalidGenerator { name: &'static str, reason: String },

    /// Two rules declare the same report uid
    #[error("Duplicate report uid '{0}'")]
    DuplicateReport(String),

    /// A generator (transitively) requested its own output
    #[error("Dependency cycle while generating '{0}'")]
    DependencyCycle(ValueTag),

    /// A required value was not available
    #[error("Missing value '{0}'")]
    MissingValue(ValueTag),

    /// The stored payload does not have the requested type
    #[error("Value '{0}' does not have the requested type")]
    ValueTypeMismatch(ValueTag),

    /// A generator tried to store a value it did not declare
    #[error("Generator '{name}' produced undeclared value '{tag}'")]
    UndeclaredOutput { name: &'static str, tag: ValueTag },

    /// Generator failure
    #[error("Generator '{name}' failed: {message}")]
    Generator { name: &'static str, message: String },

    /// Rule failure
    #[error("Rule error: {0}")]
    Rule(String),

    /// Detector failure
    #[error("Detector error: {0}")]
    Detector(String),

    /// Embedded resource could not be loaded
    #[error("Resource error: {0}")]
    Resource(String),

    /// Invalid rule selector (bad regex, unknown uid)
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// Staging into a rule class whose combined reduction already started
    #[error("Combined analysis already started for rule class {0}")]
    CombinedPhaseClosed(u8),

    /// The operation observed a stop request
    #[error("Operation cancelled")]
    Cancelled,

    /// Execution context could not be created or joined
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for core errors
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generator error
    pub fn generator(name: &'static str, msg: impl Into<String>) -> Self {
        Self::Generator {
            name,
            message: msg.into(),
        }
    }

    /// Create a rule error
    pub fn rule(msg: impl Into<String>) -> Self {
        Self::Rule(msg.into())
    }

    /// Create a detector error
    pub fn detector(msg: impl Into<String>) -> Self {
        Self::Detector(msg.into())
    }

    /// Create a resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Whether this error only reports a stop request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convert CoreError to a string
impl From<CoreError> for String {
    fn from(err: CoreError) -> String {
        err.to_string()
    }
}
