use std::error::Error as StdError;
use std::fmt;
use thiserror::Error as ThisError;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

/// Categories of failure that travel through the pipeline. Configuration
/// and wiring problems surface before a source starts serving; the rest
/// occur per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingConfig,
    TypeMismatch,
    UnknownName,
    Cardinality,
    Parse,
    Invocation,
    AvailabilityTimeout,
    CircuitOpen,
    UnconfiguredCommand,
    Cancelled,
    DeadlineExceeded,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::MissingConfig => write!(f, "missing config"),
            ErrorKind::TypeMismatch => write!(f, "type mismatch"),
            ErrorKind::UnknownName => write!(f, "unknown name"),
            ErrorKind::Cardinality => write!(f, "cardinality"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::Invocation => write!(f, "invocation"),
            ErrorKind::AvailabilityTimeout => write!(f, "availability timeout"),
            ErrorKind::CircuitOpen => write!(f, "circuit open"),
            ErrorKind::UnconfiguredCommand => write!(f, "unconfigured command"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::DeadlineExceeded => write!(f, "deadline exceeded"),
            ErrorKind::Io => write!(f, "io"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub message: Option<String>,
    pub source: Option<BoxError>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                message: None,
                source: source.map(Into::into),
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: impl Into<String>, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                message: Some(message.into()),
                source: source.map(Into::into),
            }),
        }
    }

    pub fn message(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error::with_message(kind, message, None::<BoxError>)
    }

    /// Wraps this error in a new one of the same kind, keeping the
    /// original as the cause.
    pub fn wrap(self, message: impl Into<String>) -> Error {
        let kind = self.inner.kind;
        Error::with_message(kind, message, Some(self))
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn parse(message: impl Into<String>) -> Error {
        Error::message(ErrorKind::Parse, message)
    }

    pub fn invocation(message: impl Into<String>) -> Error {
        Error::message(ErrorKind::Invocation, message)
    }

    pub fn io<E: Into<BoxError>>(source: E) -> Error {
        Error::new(ErrorKind::Io, Some(source))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Cancelled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::DeadlineExceeded)
    }

    /// True when the error came from the context rather than the work.
    pub fn is_context(&self) -> bool {
        self.is_cancelled() || self.is_deadline_exceeded()
    }

    pub fn is_availability_timeout(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::AvailabilityTimeout)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::CircuitOpen)
    }

    pub fn is_invocation(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Invocation)
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self.inner.kind,
            ErrorKind::MissingConfig
                | ErrorKind::TypeMismatch
                | ErrorKind::UnknownName
                | ErrorKind::Cardinality
        )
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("fnhost::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

/// Configuration and wiring failures raised while materializing a
/// declared pipeline.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("{0} requires configuration but none was provided")]
    Missing(String),
    #[error("{target} could not be configured with a value of shape {shape}")]
    Shape { target: String, shape: &'static str },
    #[error("expected map to have exactly one entry")]
    SingleEntry,
    #[error("no source registered with key {0:?}")]
    UnknownSource(String),
    #[error("no middleware registered with key {0:?}")]
    UnknownMiddleware(String),
    #[error("no fn registered with key {0:?}")]
    UnknownFn(String),
    #[error("{0} is a required configuration key")]
    RequiredKey(&'static str),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        let kind = match &err {
            ConfigError::Missing(_) => ErrorKind::MissingConfig,
            ConfigError::Shape { .. } => ErrorKind::TypeMismatch,
            ConfigError::SingleEntry => ErrorKind::Cardinality,
            ConfigError::UnknownSource(_)
            | ConfigError::UnknownMiddleware(_)
            | ConfigError::UnknownFn(_) => ErrorKind::UnknownName,
            ConfigError::RequiredKey(_) => ErrorKind::MissingConfig,
        };
        Error::new(kind, Some(err))
    }
}

/// Subprocess lifecycle failures from the cli function and the tap
/// middleware.
#[derive(Debug, ThisError)]
pub enum ProcessError {
    #[error("failed to spawn {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process exited with {0}")]
    Exit(String),
    #[error("process exited before producing output")]
    EarlyExit,
    #[error("empty command")]
    EmptyCommand,
    #[error("unterminated quote in command {0:?}")]
    UnterminatedQuote(String),
}

impl From<ProcessError> for Error {
    fn from(err: ProcessError) -> Self {
        let kind = match &err {
            ProcessError::EmptyCommand | ProcessError::UnterminatedQuote(_) => ErrorKind::Parse,
            _ => ErrorKind::Io,
        };
        Error::new(kind, Some(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, Some(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::Parse, Some(err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::new(ErrorKind::Parse, Some(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::message(ErrorKind::Parse, "bad cronspec");
        assert_eq!(err.to_string(), "parse error: bad cronspec");
    }

    #[test]
    fn display_includes_source_chain() {
        let io = std::io::Error::other("pipe closed");
        let err = Error::with_message(ErrorKind::Io, "writing stdin", Some(io));
        assert_eq!(err.to_string(), "io error: writing stdin: pipe closed");
        assert!(err.source().is_some());
    }

    #[test]
    fn config_error_maps_to_kinds() {
        let err: Error = ConfigError::SingleEntry.into();
        assert_eq!(err.kind(), ErrorKind::Cardinality);

        let err: Error = ConfigError::UnknownFn("nope".into()).into();
        assert_eq!(err.kind(), ErrorKind::UnknownName);
        assert!(err.is_config());
    }

    #[test]
    fn wrap_keeps_kind_and_cause() {
        let inner = Error::message(ErrorKind::Io, "process exited with exit status: 1");
        let err = inner.wrap("killing process");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("killing process"));
        assert!(err.source().is_some());
    }

    #[test]
    fn context_predicates() {
        assert!(Error::message(ErrorKind::Cancelled, "ctx").is_context());
        assert!(Error::message(ErrorKind::DeadlineExceeded, "ctx").is_context());
        assert!(!Error::message(ErrorKind::Invocation, "fn").is_context());
    }
}
