//! Error types for the patch engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::journal::SubCase;

/// Result type for patch engine operations.
pub type Result<T> = std::result::Result<T, PatchError>;

/// All errors that can abort a build, apply, revert or resolve call.
///
/// Replacement failures are deliberately absent: they are collected as
/// [`crate::apply::ReplacementRecord`]s and never abort a session.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Malformed container or manifest. Raised before any mutation.
    #[error("malformed patch: {message}")]
    Format { message: String },

    /// A decision-table row with no safe resolution.
    #[error("integrity error at operation {id} ({path}): {message}")]
    StateIntegrity {
        id: u32,
        path: String,
        sub_case: Option<SubCase>,
        message: String,
    },

    /// The live tree does not match the manifest after all operations succeeded.
    #[error("validation failed for {path}: {message}")]
    Validation { path: String, message: String },

    /// Cooperative cancellation, surfaced after cleanup callbacks ran.
    #[error("operation cancelled")]
    Cancelled,

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Backups can only be discarded once a session has completed.
    #[error("journal {0} does not record a completed session")]
    SessionIncomplete(PathBuf),

    /// The journal holds live operations of a different patch.
    #[error("journal {journal} belongs to patch {recorded}, not {patch}")]
    JournalMismatch {
        journal: PathBuf,
        recorded: String,
        patch: String,
    },

    /// Paths are recorded as UTF-8 in the manifest and journal.
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
}

impl PatchError {
    /// Creates a format error.
    #[must_use]
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the error left the target tree in a state that `revert` can undo.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::StateIntegrity { .. } | Self::Validation { .. } | Self::Io { .. }
        )
    }
}

/// Convenience constructor for [`PatchError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> PatchError {
    PatchError::Io {
        path: path.into(),
        source,
    }
}

impl From<bincode::Error> for PatchError {
    fn from(e: bincode::Error) -> Self {
        PatchError::format(format!("manifest encoding: {e}"))
    }
}
