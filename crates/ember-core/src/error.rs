//! Error types for ember-core.

use miette::Diagnostic;
use thiserror::Error;

use ember_dl::error::DownloadError;
use ember_utils::error::{FileSystemError, HashError};

/// Core error type for bootstrapper operations.
#[derive(Error, Diagnostic, Debug)]
pub enum EmberError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    FileSystem(#[from] FileSystemError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Hash(#[from] HashError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Download(#[from] DownloadError),

    #[error("IO error while {action}")]
    #[diagnostic(
        code(ember::io),
        help("Check file permissions and disk space")
    )]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    #[diagnostic(code(ember::validation))]
    Validation(String),

    #[error("Manifest error: {0}")]
    #[diagnostic(
        code(ember::manifest),
        help("The bundle manifest is malformed; this bundle cannot be processed")
    )]
    Manifest(String),

    #[error("XML error: {0}")]
    #[diagnostic(code(ember::xml))]
    Xml(#[from] quick_xml::Error),

    #[error("Condition error: {0}")]
    #[diagnostic(code(ember::condition))]
    Condition(String),

    #[error("Variable '{0}' not found")]
    #[diagnostic(code(ember::variable_not_found))]
    VariableNotFound(String),

    #[error("Variable '{0}' is built-in and cannot be overwritten")]
    #[diagnostic(code(ember::built_in_overwrite))]
    BuiltInOverwrite(String),

    #[error("'{0}' was not found")]
    #[diagnostic(code(ember::not_found))]
    NotFound(String),

    #[error("Payload '{key}' failed verification")]
    #[diagnostic(
        code(ember::verify),
        help("The staged file may be corrupted. Re-acquire it and try again.")
    )]
    VerifyFailed { key: String },

    #[error("Pipe authentication failed: {0}")]
    #[diagnostic(code(ember::access_denied))]
    AccessDenied(String),

    #[error("Pipe connection failed: {0}")]
    #[diagnostic(code(ember::pipe))]
    Pipe(String),

    #[error("Operation canceled by user")]
    #[diagnostic(code(ember::user_exit))]
    UserExit,

    #[error("Package '{package}' failed with code {code}")]
    #[diagnostic(code(ember::package))]
    PackageFailure { package: String, code: i32 },

    #[error("JSON error: {0}")]
    #[diagnostic(code(ember::json))]
    Json(#[from] serde_json::Error),

    #[error("Thread lock poison error")]
    #[diagnostic(
        code(ember::poison),
        help("This is an internal error, please report it")
    )]
    PoisonError,

    #[error("{0}")]
    #[diagnostic(code(ember::fatal))]
    Fatal(String),
}

impl EmberError {
    /// True when the error is the user declining to continue, which
    /// skips rollback of not-yet-started work.
    pub fn is_user_exit(&self) -> bool {
        matches!(
            self,
            Self::UserExit | Self::Download(DownloadError::Canceled { .. })
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for EmberError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::PoisonError
    }
}

pub type EmberResult<T> = std::result::Result<T, EmberError>;

/// Trait for adding context to IO errors.
pub trait ErrorContext<T> {
    fn with_context<C>(self, context: C) -> std::result::Result<T, EmberError>
    where
        C: FnOnce() -> String;
}

impl<T> ErrorContext<T> for std::io::Result<T> {
    fn with_context<C>(self, context: C) -> std::result::Result<T, EmberError>
    where
        C: FnOnce() -> String,
    {
        self.map_err(|err| EmberError::Io {
            action: context(),
            source: err,
        })
    }
}
