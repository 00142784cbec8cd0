// Error types for Testbed

use thiserror::Error;

/// Error raised by user supplied callbacks: environment factories, binding
/// providers, teardown actions and listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An environment or binding set is unusable as configured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `begin`/`end` were called out of order.
    #[error("Sequencing error: {0}")]
    Sequencing(String),

    #[error(transparent)]
    ScopeState(#[from] ScopeStateError),

    /// First construction of this environment failed; it is skipped for the
    /// rest of the process.
    #[error(
        "Environment {environment} failed once and is now permanently skipped; \
         see the first failure reported for it"
    )]
    PermanentEnvironmentFailure { environment: String },

    #[error("No binding for {0}")]
    BindingNotFound(String),

    #[error("Binding {key} resolved to a value that is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Injecting test dependencies from environment {environment} failed: {source}")]
    Injection {
        environment: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Action(BoxError),

    #[error("Panicked: {0}")]
    Panic(String),

    /// More than one teardown step failed. `first` is the first failure in
    /// execution order.
    #[error("{first} ({} further teardown failure(s) suppressed)", suppressed.len())]
    TearDown {
        first: Box<Error>,
        suppressed: Vec<Error>,
    },
}

/// Scoped resolution attempted on a thread without a usable current test.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeStateError {
    #[error(
        "No test is running on this thread. Scoped values can only be resolved while a \
         test is active; worker threads not created through TestScope::spawn need the \
         state captured with TestScope::capture_state and installed with \
         TestScope::install_state"
    )]
    NoCurrentTest,

    #[error(
        "The current test on this thread ({test}) has already finished. This usually \
         means a pooled thread is reused across tests; install the state of the running \
         test with TestScope::capture_state / TestScope::install_state"
    )]
    TestFinished { test: String },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn sequencing(message: impl Into<String>) -> Self {
        Error::Sequencing(message.into())
    }

    pub fn action(error: impl Into<BoxError>) -> Self {
        Error::Action(error.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Error::Panic(message)
    }

    /// Fold a list of failures into one error, keeping the first as primary.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => {
                let first = errors.remove(0);
                Some(Error::TearDown {
                    first: Box::new(first),
                    suppressed: errors,
                })
            }
        }
    }

    pub fn is_sequencing(&self) -> bool {
        matches!(self, Error::Sequencing(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }

    pub fn is_permanent_failure(&self) -> bool {
        matches!(self, Error::PermanentEnvironmentFailure { .. })
    }

    /// The scope state problem behind this error, looking through
    /// teardown aggregation and injection wrappers.
    pub fn scope_state(&self) -> Option<&ScopeStateError> {
        match self {
            Error::ScopeState(inner) => Some(inner),
            Error::Injection { source, .. } => source.scope_state(),
            Error::TearDown { first, .. } => first.scope_state(),
            _ => None,
        }
    }
}
