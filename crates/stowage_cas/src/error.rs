//! Errors and the structured failure records they are normalized into.

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use simple_spawn_blocking::Cancelled;
use stowage_digest::AccumulatorError;

use crate::{
    config::ValidationError,
    fault::InjectedFault,
    payload::{CorrelationId, Payload},
};

/// The category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The store could not be set up.
    ConfigurationFailure,
    /// Reading from the caller supplied source failed.
    SourceStreamFailure,
    /// Computing the digest failed.
    DigestStageFailure,
    /// Writing the staging file failed.
    WriteStageFailure,
    /// The bytes on disk do not match the bytes that were streamed.
    ConsistencyMismatch,
    /// Moving the staged file into the store failed.
    PlacementFailure,
}

/// The part of a request during which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Streaming the source into the staging file.
    Ingest,
    /// Re-reading the staged file.
    Validate,
    /// Moving the staged file into the store.
    Placement,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Ingest => "ingest",
            Phase::Validate => "validate",
            Phase::Placement => "placement",
        })
    }
}

/// A plain description of a single failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// The category of the failure.
    pub kind: FailureKind,

    /// The phase the failure occurred in.
    pub phase: Phase,

    /// The error message, including the messages of all underlying causes.
    pub message: String,

    /// The path the failing operation was working on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// The kind of the underlying I/O error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_kind: Option<String>,
}

/// An error raised by one of the stages of a request.
///
/// These never leave the crate as-is, they are turned into a
/// [`FailureRecord`] as part of a [`StoreFailure`].
#[derive(Debug, thiserror::Error)]
pub(crate) enum StageError {
    #[error("failed to read from the source stream")]
    Source(#[source] io::Error),

    #[error("failed to update the digest")]
    Digest(#[source] AccumulatorError),

    #[error("failed to write staging file {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to inspect staged file {}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("staged file {} is {observed} bytes but {expected} bytes were streamed", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        observed: u64,
    },

    #[error(
        "staged file {} does not match what was streamed: expected {expected_size} bytes with digest {expected_digest} but found {observed_size} bytes with digest {observed_digest}",
        .path.display()
    )]
    ContentMismatch {
        path: PathBuf,
        expected_size: u64,
        expected_digest: String,
        observed_size: u64,
        observed_digest: String,
    },

    #[error("the request has no {0} yet")]
    Incomplete(&'static str),

    #[error("'{0}' is not a valid content address for this store")]
    InvalidAddress(String),

    #[error("failed to {operation} {}", .path.display())]
    Placement {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the blocking task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Injected(#[from] InjectedFault),

    #[error(transparent)]
    Failed(#[from] StoreFailure),
}

impl From<Cancelled> for StageError {
    fn from(_: Cancelled) -> Self {
        StageError::Cancelled
    }
}

impl StageError {
    /// Classifies an error returned by an [`stowage_digest::AccumulatingWriter`].
    pub(crate) fn from_write(path: &Path, err: io::Error) -> Self {
        match AccumulatorError::from_io(&err) {
            Some(inner) => StageError::Digest(inner.clone()),
            None => StageError::Write {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    pub(crate) fn placement(operation: &'static str, path: &Path, source: io::Error) -> Self {
        StageError::Placement {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }

    fn kind(&self, phase: Phase) -> FailureKind {
        match self {
            StageError::Source(_) => FailureKind::SourceStreamFailure,
            StageError::Digest(_) => FailureKind::DigestStageFailure,
            StageError::Write { .. } => FailureKind::WriteStageFailure,
            StageError::Inspect { .. }
            | StageError::SizeMismatch { .. }
            | StageError::ContentMismatch { .. } => FailureKind::ConsistencyMismatch,
            StageError::Incomplete(_) | StageError::InvalidAddress(_) => match phase {
                Phase::Placement => FailureKind::PlacementFailure,
                Phase::Ingest | Phase::Validate => FailureKind::ConsistencyMismatch,
            },
            StageError::Placement { .. } | StageError::Cancelled => FailureKind::PlacementFailure,
            StageError::Injected(fault) => fault.site.failure_kind(),
            StageError::Failed(failure) => failure.kind(),
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            StageError::Write { path, .. }
            | StageError::Inspect { path, .. }
            | StageError::SizeMismatch { path, .. }
            | StageError::ContentMismatch { path, .. }
            | StageError::Placement { path, .. } => Some(path),
            _ => None,
        }
    }

    fn into_record(self, phase: Phase) -> FailureRecord {
        FailureRecord {
            kind: self.kind(phase),
            phase,
            message: error_chain(&self),
            path: self.path().map(Path::to_path_buf),
            io_kind: io_kind(&self),
        }
    }
}

/// Joins the message of an error with the messages of all its causes.
fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn io_kind(err: &(dyn Error + 'static)) -> Option<String> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(format!("{:?}", io_err.kind()));
        }
        current = err.source();
    }
    None
}

/// The outcome of a request that failed.
///
/// Contains the payload of the request as far as it got, with `error` set,
/// every failure recorded in `errors` and the content address removed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("request {} failed{}", .payload.correlation_id, first_failure(.payload))]
pub struct StoreFailure {
    payload: Box<Payload>,
}

impl StoreFailure {
    /// Turns the error of a stage into the failure of the request described
    /// by `payload`.
    ///
    /// A failure that already belongs to the same request is returned as is.
    /// A failure of another request is recorded as a cause of this one.
    pub(crate) fn settle(mut payload: Payload, phase: Phase, err: StageError) -> Self {
        let record = match err {
            StageError::Failed(failure) if failure.correlation_id() == &payload.correlation_id => {
                return failure;
            }
            StageError::Failed(failure) => FailureRecord {
                kind: failure.kind(),
                phase,
                message: format!("nested {failure}"),
                path: None,
                io_kind: None,
            },
            err => err.into_record(phase),
        };

        tracing::debug!(
            correlation_id = %payload.correlation_id,
            %phase,
            kind = ?record.kind,
            "request failed: {}",
            record.message
        );

        payload.content_address = None;
        payload.error = true;
        payload.errors.push(record);
        Self {
            payload: Box::new(payload),
        }
    }

    /// Returns the correlation id of the request that failed.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.payload.correlation_id
    }

    /// Returns the category of the first failure.
    pub fn kind(&self) -> FailureKind {
        self.records()
            .first()
            .map_or(FailureKind::ConsistencyMismatch, |record| record.kind)
    }

    /// Returns all recorded failures.
    pub fn records(&self) -> &[FailureRecord] {
        &self.payload.errors
    }

    /// Returns the payload of the failed request.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the failure and returns the payload of the failed request.
    pub fn into_payload(self) -> Payload {
        *self.payload
    }
}

fn first_failure(payload: &Payload) -> String {
    payload
        .errors
        .first()
        .map(|record| format!(" during {}: {}", record.phase, record.message))
        .unwrap_or_default()
}

/// An error that prevents a [`crate::ContentStore`] from being constructed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The configuration is not valid.
    #[error("invalid store configuration")]
    InvalidConfig(#[from] ValidationError),

    /// A root directory does not exist or cannot be read from or written to.
    #[error("cannot access {}", .path.display())]
    InaccessibleRoot {
        /// The root as it was configured.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A root is not a directory.
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

impl StoreError {
    /// Returns the category of this error.
    pub fn kind(&self) -> FailureKind {
        FailureKind::ConfigurationFailure
    }
}
