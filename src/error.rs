//! Error types for hotswap-flags.

use std::fmt;

/// Result type alias for hotswap-flags operations.
pub type Result<T> = std::result::Result<T, FlagError>;

/// Errors that can occur when declaring, setting or synchronizing flags.
#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    /// The raw string does not decode into the flag's type.
    #[error("Failed to parse value for flag '{flag}': {reason}")]
    Parse {
        /// Flag name
        flag: String,
        /// Why the input was rejected
        reason: String,
    },

    /// The decoded value was rejected by the flag's validator.
    #[error("Validation failed for flag '{flag}': {source}")]
    Validation {
        /// Flag name
        flag: String,
        /// The validator's verdict
        source: ValidationError,
    },

    /// No flag with this name is registered.
    #[error("Unknown flag: {0}")]
    UnknownFlag(String),

    /// The flag exists but is not marked dynamic.
    #[error("Flag '{0}' is not dynamic and cannot be changed at runtime")]
    NotDynamic(String),

    /// A flag with this name was already registered.
    #[error("Flag '{0}' is already registered")]
    DuplicateFlag(String),

    /// `initialize` was called more than once.
    #[error("Watcher is already initialized")]
    AlreadyInitialized,

    /// `start` was called before a successful `initialize`.
    #[error("Watcher is not initialized")]
    NotInitialized,

    /// `start` was called while the loop is already running.
    #[error("Watcher is already watching")]
    AlreadyWatching,

    /// `stop` was called while the loop was not running.
    #[error("Watcher is not watching")]
    NotWatching,

    /// The watcher was stopped and cannot be started again.
    #[error("Watcher has been stopped")]
    Stopped,

    /// `start` was called outside a tokio runtime.
    #[error("No tokio runtime available to run the watcher")]
    NoRuntime,

    /// The initial synchronization pass failed for one or more keys.
    #[error("{0}")]
    Initialize(InitializeErrors),

    /// The synchronization source failed.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Failed to load watcher settings.
    #[error("Failed to load watcher settings: {0}")]
    Settings(String),
}

impl FlagError {
    /// Build a parse error for `flag`.
    pub fn parse(flag: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Parse {
            flag: flag.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by synchronization sources and the stores behind them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The requested change index has been compacted away; a full resync is required.
    #[error("Change index {0} is too old and has been cleared")]
    IndexCleared(u64),

    /// The store is unreachable or the cluster is unhealthy.
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// A single poll hit its deadline without any change.
    #[error("Poll timed out")]
    Timeout,

    /// A conditional write or delete lost against a newer change.
    #[error("Compare failed for key '{0}'")]
    CompareFailed(String),

    /// The key does not exist in the store.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The source cannot write back values.
    #[error("Source '{0}' does not support rollback")]
    RollbackUnsupported(String),

    /// Filesystem watch setup or delivery failed.
    #[error("Watch error: {0}")]
    Watch(String),

    /// IO error while reading the source.
    #[error("IO error: {0}")]
    Io(String),

    /// The store answered with something we could not decode.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The event stream ended.
    #[error("Event stream closed")]
    Closed,
}

impl SourceError {
    /// Whether the caller should back off and retry rather than give up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout | Self::IndexCleared(_) | Self::Io(_) | Self::Watch(_)
        )
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err.to_string())
    }
}

/// Validation error for flag values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Custom validation error with a message.
    Custom(String),

    /// A specific field has an invalid value.
    InvalidField {
        /// The field name/path
        field: String,
        /// The reason why it's invalid
        reason: String,
    },

    /// Multiple validation errors occurred.
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Create a custom validation error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Create an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(msg) => write!(f, "{}", msg),
            Self::InvalidField { field, reason } => {
                write!(f, "Field '{}' is invalid: {}", field, reason)
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple validation errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "  {}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// One key that could not be applied during the initial synchronization.
#[derive(Debug)]
pub struct KeyFailure {
    /// The source key
    pub key: String,
    /// What went wrong
    pub error: FlagError,
}

/// Aggregate of every key that failed during `initialize`.
///
/// Keys that applied cleanly stay applied; this only reports the rest.
#[derive(Debug, Default)]
pub struct InitializeErrors {
    failures: Vec<KeyFailure>,
}

impl InitializeErrors {
    pub(crate) fn push(&mut self, key: impl Into<String>, error: FlagError) {
        self.failures.push(KeyFailure {
            key: key.into(),
            error,
        });
    }

    /// The individual failures in source order.
    pub fn failures(&self) -> &[KeyFailure] {
        &self.failures
    }

    /// Keys that failed.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.key.as_str())
    }

    /// Whether nothing failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failed keys.
    pub fn len(&self) -> usize {
        self.failures.len()
    }
}

impl fmt::Display for InitializeErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Initial sync failed for {} key(s)", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.key, failure.error)?;
        }
        Ok(())
    }
}
