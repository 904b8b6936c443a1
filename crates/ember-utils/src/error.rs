//! Error types for ember-utils.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Error type for hash operations.
#[derive(Error, Diagnostic, Debug)]
pub enum HashError {
    #[error("Failed to read file '{path}'")]
    #[diagnostic(
        code(ember_utils::hash::read),
        help("Check if the file exists and you have read permissions")
    )]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error type for filesystem operations.
#[derive(Error, Diagnostic, Debug)]
pub enum FileSystemError {
    #[error("Failed to read file '{path}'")]
    #[diagnostic(code(ember_utils::fs::read_file))]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}'")]
    #[diagnostic(
        code(ember_utils::fs::write_file),
        help("Check if you have write permissions to the directory")
    )]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory '{path}'")]
    #[diagnostic(code(ember_utils::fs::create_dir))]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}'")]
    #[diagnostic(
        code(ember_utils::fs::remove),
        help("Check if you have write permissions to the file")
    )]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move '{from}' to '{to}'")]
    #[diagnostic(code(ember_utils::fs::rename))]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to update permissions on '{path}'")]
    #[diagnostic(code(ember_utils::fs::permissions))]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path '{path}' exists but is not a directory")]
    #[diagnostic(code(ember_utils::fs::not_a_directory))]
    NotADirectory { path: PathBuf },
}

pub type HashResult<T> = std::result::Result<T, HashError>;
pub type FileSystemResult<T> = std::result::Result<T, FileSystemError>;
