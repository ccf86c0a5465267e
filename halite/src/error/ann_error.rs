/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::{
    fmt::{Debug, Display},
    io,
    panic::Location,
};

/// Convenience alias for a `Result<T, AnnError>`.
pub type AnnResult<T> = Result<T, AnnError>;

/// The runtime origin of an [`AnnError`].
///
/// The kind is a cheap, copyable tag that survives context chaining, so
/// callers high in the stack can match on what went wrong without parsing
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AnnErrorKind {
    /// A caller supplied an impossible configuration (e.g. more PQ chunks
    /// than dimensions).
    #[error("invalid configuration")]
    InvalidConfig,

    /// A pivot container failed shape or offset-table validation.
    #[error("malformed pivot file")]
    MalformedPivotFile,

    /// The encoder could not find its pivot file.
    #[error("missing pivot file")]
    MissingPivotFile,

    /// The OPQ encoder could not find the sibling rotation matrix file.
    #[error("missing rotation matrix file")]
    MissingRotationFile,

    /// A numeric routine failed to converge (SVD).
    #[error("numeric failure")]
    NumericFailure,

    /// A k-means contract violation (empty dataset, undersized buffers).
    #[error("k-means error")]
    KMeansError,

    /// A plain standard-library I/O failure.
    #[error("io error")]
    IoError,

    /// Opening a file for direct I/O failed.
    #[error("io open failed")]
    IoOpenFailed,

    /// Submitting a batch of reads to the kernel failed, or partial
    /// submission exhausted its retry budget.
    #[error("io submit failed")]
    IoSubmitFailed,

    /// Draining completions failed, or partial completion exhausted its
    /// retry budget.
    #[error("io getevents failed")]
    IoGetEventsFailed,

    /// An individual read completed with a non-zero status or a short
    /// transfer.
    #[error("io read failed")]
    IoReadFailed,

    /// The kernel refused to allocate another submission context.
    #[error("io context setup exhausted")]
    IoSetupExhausted,

    /// A read request violated the sector alignment contract.
    #[error("alignment error")]
    AlignmentError,

    /// A thread used the reader without a registered submission context.
    #[error("bad io context")]
    BadIoContext,

    /// A mutex guarding shared reader state was poisoned.
    #[error("lock poisoned")]
    LockPoisoned,
}

/// Common error type shared through the halite workspace.
///
/// Pairs a copyable [`AnnErrorKind`] with an [`anyhow::Error`] payload. The
/// payload wraps the original error (or message) in a [`Located`] struct so
/// the formatted chain names the file and line where the error was raised.
///
/// Errors are fatal to the operation that raised them; they propagate with
/// `?` and may pick up additional context on the way up via
/// [`AnnError::context`].
#[derive(Debug)]
pub struct AnnError {
    kind: AnnErrorKind,
    error: anyhow::Error,
}

impl AnnError {
    /// Wrap a concrete error `err`, tagged with `kind`.
    #[track_caller]
    #[inline(never)]
    pub fn new<E>(kind: AnnErrorKind, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            error: anyhow::Error::new(Located::new(err)),
        }
    }

    /// Construct an error from a displayable message, tagged with `kind`.
    #[track_caller]
    #[inline(never)]
    pub fn message<D>(kind: AnnErrorKind, display: D) -> Self
    where
        D: Display + Debug + Send + Sync + 'static,
    {
        Self {
            kind,
            error: anyhow::Error::msg(Located::new(display)),
        }
    }

    /// Attach context to `self` and return the extended error. The kind of
    /// the original error is preserved.
    #[track_caller]
    #[inline(never)]
    pub fn context<C>(self, context: C) -> Self
    where
        C: Display + Debug + Send + Sync + 'static,
    {
        Self {
            kind: self.kind,
            error: self.error.context(Located::new(context)),
        }
    }

    /// The kind of the originally constructed error.
    pub fn kind(&self) -> AnnErrorKind {
        self.kind
    }

    // Focused constructors, one per kind that takes a free-form message.

    #[track_caller]
    #[inline(never)]
    pub fn invalid_config<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::InvalidConfig, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn malformed_pivot_file<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::MalformedPivotFile, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn missing_pivot_file<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::MissingPivotFile, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn missing_rotation_file<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::MissingRotationFile, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn numeric_failure<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::NumericFailure, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn kmeans_error<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::KMeansError, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn io_error(err: io::Error) -> Self {
        Self::new(AnnErrorKind::IoError, err)
    }

    #[track_caller]
    #[inline(never)]
    pub fn io_open_failed(err: io::Error) -> Self {
        Self::new(AnnErrorKind::IoOpenFailed, err)
    }

    #[track_caller]
    #[inline(never)]
    pub fn io_submit_failed<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::IoSubmitFailed, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn io_getevents_failed<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::IoGetEventsFailed, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn io_read_failed<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::IoReadFailed, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn io_setup_exhausted<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::IoSetupExhausted, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn alignment_error<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::AlignmentError, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn bad_io_context<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::BadIoContext, msg.to_string())
    }

    #[track_caller]
    #[inline(never)]
    pub fn lock_poisoned<D: Display>(msg: D) -> Self {
        Self::message(AnnErrorKind::LockPoisoned, msg.to_string())
    }
}

impl Display for AnnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:#}", self.kind, self.error)
    }
}

impl std::error::Error for AnnError {}

impl From<io::Error> for AnnError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::io_error(err)
    }
}

/// Extension trait converting foreign results into [`AnnResult`].
pub trait IntoAnnResult<T> {
    fn into_ann_result(self) -> AnnResult<T>;
}

impl<T> IntoAnnResult<T> for io::Result<T> {
    #[track_caller]
    fn into_ann_result(self) -> AnnResult<T> {
        self.map_err(AnnError::io_error)
    }
}

/// A payload wrapper recording where an error was constructed.
struct Located<E> {
    err: E,
    location: &'static Location<'static>,
}

impl<E> Located<E> {
    #[track_caller]
    fn new(err: E) -> Self {
        Self {
            err,
            location: Location::caller(),
        }
    }
}

impl<E: Display> Display for Located<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (at {}:{})",
            self.err,
            self.location.file(),
            self.location.line()
        )
    }
}

impl<E: Debug> Debug for Located<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Located")
            .field("err", &self.err)
            .field("location", &self.location)
            .finish()
    }
}

impl<E: Display + Debug> std::error::Error for Located<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context() {
        let err = AnnError::malformed_pivot_file("offset table has 3 entries")
            .context("loading pivots from /tmp/pivots.bin");
        assert_eq!(err.kind(), AnnErrorKind::MalformedPivotFile);

        let message = format!("{}", err);
        assert!(message.contains("offset table has 3 entries"));
        assert!(message.contains("loading pivots"));
    }

    #[test]
    fn located_names_the_call_site() {
        let err = AnnError::invalid_config("number of chunks more than dimension");
        let message = format!("{}", err);
        assert!(message.contains("ann_error.rs"));
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn inner() -> AnnResult<()> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        let err = inner().unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::IoError);
    }
}
