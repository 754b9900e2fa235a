//! Error types and result definitions for ETL operations.
//!
//! [`EtlError`] carries a machine-readable [`ErrorKind`], a static description,
//! optional dynamic detail, an optional source error and the callsite location.
//! Worker fan-out can aggregate several failures into a single error value.

use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for ETL operations using [`EtlError`] as the error type.
pub type EtlResult<T> = Result<T, EtlError>;

/// Categories of errors that can occur during ETL runs.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed or inverted date range input, rejected before any I/O.
    InvalidRange,
    /// The source database could not be reached or timed out.
    SourceUnavailable,
    /// A query against the source database failed.
    SourceQueryFailed,
    /// A query against the target database failed.
    TargetQueryFailed,
    /// A target table expected by a loader has not been migrated yet.
    MissingTargetTable,
    /// An insert chunk failed while loading a window.
    LoadChunkFailed,
    /// Invalid or inconsistent configuration.
    ConfigError,
    /// Data could not be converted into the target representation.
    ConversionError,
    /// Generic I/O failure.
    IoError,
    /// An operation was attempted in a state that does not allow it.
    InvalidState,
    /// Memory usage crossed the configured hard ceiling.
    MemoryLimitExceeded,
    /// A spawned window worker panicked.
    WorkerPanic,
    /// Unclassified failure.
    Unknown,
}

/// Payload stored for single [`EtlError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
}

/// Main error type for ETL operations.
#[derive(Debug, Clone)]
pub struct EtlError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Multiple aggregated errors, mainly produced by concurrent window workers.
    Many {
        errors: Vec<EtlError>,
        location: &'static Location<'static>,
    },
}

impl EtlError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or
    /// [`ErrorKind::Unknown`] if the list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating [`error::Error`] and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward the first contained
    /// error as their source.
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
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        EtlError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
            }),
        }
    }
}

impl PartialEq for EtlError {
    fn eq(&self, other: &EtlError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                write!(
                    f,
                    "[{:?}] {} @ {}:{}",
                    payload.kind,
                    payload.description,
                    payload.location.file(),
                    payload.location.line(),
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write!(f, "\n  Detail: {detail}")?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}",
                    errors.len(),
                    if errors.len() == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = format!("{error}");
                    for (line_index, line) in rendered.lines().enumerate() {
                        if line_index == 0 {
                            write!(f, "\n  {}. {}", index + 1, line)?;
                        } else {
                            write!(f, "\n     {line}")?;
                        }
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for EtlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Creates an [`EtlError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for EtlError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> EtlError {
        EtlError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates an [`EtlError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for EtlError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> EtlError {
        EtlError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates a vector of errors into one.
///
/// A single-element vector unwraps to that error directly instead of being
/// wrapped in the aggregate variant.
impl<E> From<Vec<E>> for EtlError
where
    E: Into<EtlError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> EtlError {
        let location = Location::caller();

        let mut errors: Vec<EtlError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1 {
            return errors.pop().expect("just checked length is 1");
        }

        EtlError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for EtlError {
    #[track_caller]
    fn from(err: std::io::Error) -> EtlError {
        let detail = err.to_string();
        EtlError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<chrono::ParseError> for EtlError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> EtlError {
        let detail = err.to_string();
        EtlError::from_components(
            ErrorKind::InvalidRange,
            Cow::Borrowed("Date parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`sqlx::Error`] to [`EtlError`] with the appropriate error kind.
///
/// Connection pool failures map to [`ErrorKind::SourceUnavailable`]; callers
/// that know a query ran against the target re-wrap with an explicit kind.
impl From<sqlx::Error> for EtlError {
    #[track_caller]
    fn from(err: sqlx::Error) -> EtlError {
        let kind = match &err {
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => ErrorKind::SourceUnavailable,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                ErrorKind::ConversionError
            }
            _ => ErrorKind::SourceQueryFailed,
        };

        let detail = err.to_string();
        EtlError::from_components(
            kind,
            Cow::Borrowed("Database operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_error_exposes_kind_and_detail() {
        let err = EtlError::from((ErrorKind::InvalidRange, "Invalid date", "2024-13-01"));
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
        assert_eq!(err.detail(), Some("2024-13-01"));
    }

    #[test]
    fn aggregation_of_one_error_unwraps() {
        let err: EtlError = vec![EtlError::from((ErrorKind::IoError, "boom"))].into();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(err.kinds().len(), 1);
    }

    #[test]
    fn aggregation_flattens_kinds() {
        let err: EtlError = vec![
            EtlError::from((ErrorKind::SourceQueryFailed, "query failed")),
            EtlError::from((ErrorKind::LoadChunkFailed, "chunk failed")),
        ]
        .into();

        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::SourceQueryFailed, ErrorKind::LoadChunkFailed]
        );
    }
}
