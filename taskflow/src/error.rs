//! Error types and result definitions for taskflow operations.
//!
//! Every fallible operation in the crate returns [`FlowResult`]. A [`FlowError`] carries an
//! [`ErrorKind`] whose [`ErrorClass`] tells callers whether their work failed, whether they were
//! asked to stop, whether a component was misconfigured, or whether the orchestration code itself
//! was misused. Several errors can be aggregated into one, which is how worker failures are
//! reported when a pool shuts down.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use taskflow_config::shared::ValidationError;

use crate::concurrency::context::Cause;

/// Convenient result type for taskflow operations.
pub type FlowResult<T> = Result<T, FlowError>;

/// Detailed payload stored for single [`FlowError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the orchestration core.
///
/// Cloning is cheap, which lets the same failure be logged, recorded in shared state and sent
/// down a result channel.
#[derive(Debug, Clone)]
pub struct FlowError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors, used when several workers fail.
    Many {
        errors: Vec<FlowError>,
        location: &'static Location<'static>,
    },
}

/// Specific categories of failures.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Task errors
    TaskFailed,
    TaskPanicked,
    StagePanic,

    // Cancellation
    Cancelled,
    DeadlineExceeded,

    // Configuration
    InvalidConfiguration,

    // Protocol violations
    ChannelAlreadyClosed,
    SendOnClosedChannel,
    ChannelAbandoned,
    ReentrantLock,
    WorkerPanic,

    // Unknown / Uncategorized
    Unknown,
}

/// Coarse classification of an [`ErrorKind`].
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
pub enum ErrorClass {
    /// A unit of work failed. Carried as data next to the task it belongs to.
    Task,
    /// An operation observed its context firing while it was blocked.
    Cancellation,
    /// A component was constructed with invalid parameters.
    Configuration,
    /// The orchestration primitives were misused. Always a bug in the calling code.
    ProtocolViolation,
    /// Uncategorized failure.
    Unknown,
}

impl ErrorKind {
    /// Returns the [`ErrorClass`] this kind belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::TaskFailed | ErrorKind::TaskPanicked | ErrorKind::StagePanic => {
                ErrorClass::Task
            }
            ErrorKind::Cancelled | ErrorKind::DeadlineExceeded => ErrorClass::Cancellation,
            ErrorKind::InvalidConfiguration => ErrorClass::Configuration,
            ErrorKind::ChannelAlreadyClosed
            | ErrorKind::SendOnClosedChannel
            | ErrorKind::ChannelAbandoned
            | ErrorKind::ReentrantLock
            | ErrorKind::WorkerPanic => ErrorClass::ProtocolViolation,
            ErrorKind::Unknown => ErrorClass::Unknown,
        }
    }
}

impl FlowError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`] if the
    /// aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the [`ErrorClass`] of [`FlowError::kind`].
    pub fn class(&self) -> ErrorClass {
        self.kind().class()
    }

    /// Returns `true` when the error reports a cancelled or timed out context.
    pub fn is_cancellation(&self) -> bool {
        self.class() == ErrorClass::Cancellation
    }

    /// Returns `true` when the error reports misuse of an orchestration primitive.
    pub fn is_protocol_violation(&self) -> bool {
        self.class() == ErrorClass::ProtocolViolation
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the number of single errors contained in this error.
    pub fn len(&self) -> usize {
        match self.repr {
            ErrorRepr::Single(_) => 1,
            ErrorRepr::Many { ref errors, .. } => errors.iter().map(FlowError::len).sum(),
        }
    }

    /// Returns `true` for an aggregate built from no errors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error and returns the modified instance.
    ///
    /// Has no effect on aggregates, which forward their first error as the source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
    ) -> Self {
        FlowError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source: None,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for FlowError {
    fn eq(&self, other: &FlowError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail: {}", detail.trim())?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    if let Some(first_line) = lines.next() {
                        write!(f, "\n  {}. {}", index + 1, first_line)?;
                    }
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for FlowError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Creates a [`FlowError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for FlowError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> FlowError {
        FlowError::from_components(kind, Cow::Borrowed(desc), None)
    }
}

/// Creates a [`FlowError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for FlowError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> FlowError {
        FlowError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()))
    }
}

/// Aggregates several errors into one.
///
/// A vector holding exactly one error yields that error unchanged.
impl<E> From<Vec<E>> for FlowError
where
    E: Into<FlowError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> FlowError {
        let location = Location::caller();
        let mut errors: Vec<FlowError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            return errors.remove(0);
        }

        FlowError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

/// Converts the cause recorded by a fired context into a cancellation error.
impl From<Cause> for FlowError {
    #[track_caller]
    fn from(cause: Cause) -> FlowError {
        match cause {
            Cause::Cancelled => FlowError::from((ErrorKind::Cancelled, "Context was cancelled")),
            Cause::DeadlineExceeded => {
                FlowError::from((ErrorKind::DeadlineExceeded, "Context deadline exceeded"))
            }
        }
    }
}

/// Converts a configuration validation failure into [`ErrorKind::InvalidConfiguration`].
impl From<ValidationError> for FlowError {
    #[track_caller]
    fn from(err: ValidationError) -> FlowError {
        let detail = err.to_string();
        FlowError::from_components(
            ErrorKind::InvalidConfiguration,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
        )
        .with_source(err)
    }
}
