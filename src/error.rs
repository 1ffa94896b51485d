//! Error handling module for Kherimoya.
//!
//! This module defines the error types used throughout the library.
//! Every internal failure is an [`Error`]; the command façade turns those into
//! a [`CommandError`], which additionally carries the instance id and the last
//! known observed state so an operator can decide whether to retry, reconcile,
//! or investigate manually.
//!
//! # Example
//!
//! ```
//! use kherimoya::error::{Error, ErrorKind, Result};
//!
//! fn handle_error(result: Result<()>) {
//!     match result {
//!         Ok(_) => println!("Operation succeeded"),
//!         Err(Error::NotFound(id)) => println!("Server '{}' is not registered", id),
//!         Err(e) if e.kind() == ErrorKind::SpawnTimeout => println!("Server was too slow: {}", e),
//!         Err(e) => println!("Other error: {}", e),
//!     }
//! }
//! ```
use crate::registry::{ObservedState, ServerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the kherimoya library.
///
/// One variant per kind of the external error taxonomy, plus the input and
/// configuration errors raised before any instance is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No instance is registered under the given id.
    #[error("Server not found: {0}")]
    NotFound(String),

    /// Another instance already holds the requested name.
    #[error("Server name already in use: {0}")]
    DuplicateName(String),

    /// The instance is already Starting or Running.
    #[error("Server already running: {0}")]
    AlreadyRunning(String),

    /// The operation is not allowed in the instance's current state.
    ///
    /// This error occurs when:
    /// - Destroying an instance that is not Stopped
    /// - Stopping an instance that is already Stopped
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A live session with the same name already exists.
    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    /// No live session exists with the given name.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The server process could not be created, or died before it was ready.
    ///
    /// This error occurs when:
    /// - The executable cannot be found on `PATH`
    /// - The working directory does not exist
    /// - The multiplexer backend refuses to create the session
    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(String),

    /// The server process did not become ready within the spawn ceiling.
    #[error("Timed out waiting for server to start: {0}")]
    SpawnTimeout(String),

    /// The durable store could not be written or read.
    ///
    /// Fatal for the triggering call (nothing is committed) but the caller
    /// may retry.
    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    /// External input has the wrong shape (malformed id, illegal name).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failed to parse configuration from a file or string.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains invalid values.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// Map this error onto the stable external taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::DuplicateName(_) => ErrorKind::DuplicateName,
            Error::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::SessionAlreadyExists(_) => ErrorKind::SessionAlreadyExists,
            Error::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Error::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Error::SpawnTimeout(_) => ErrorKind::SpawnTimeout,
            Error::PersistenceFailed(_) => ErrorKind::PersistenceFailed,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::ConfigParse(_) | Error::ConfigInvalid(_) => ErrorKind::InvalidConfig,
        }
    }

    pub(crate) fn persistence(context: &str, err: impl fmt::Display) -> Self {
        Error::PersistenceFailed(format!("{}: {}", context, err))
    }
}

/// Result type for kherimoya operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable external error taxonomy.
///
/// The string form and the exit code of each kind never change between
/// releases; front ends may rely on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    DuplicateName,
    AlreadyRunning,
    InvalidState,
    SessionAlreadyExists,
    SessionNotFound,
    SpawnFailed,
    SpawnTimeout,
    PersistenceFailed,
    InvalidArgument,
    InvalidConfig,
}

impl ErrorKind {
    /// Stable identifier of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::DuplicateName => "DuplicateName",
            ErrorKind::AlreadyRunning => "AlreadyRunning",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::SessionAlreadyExists => "SessionAlreadyExists",
            ErrorKind::SessionNotFound => "SessionNotFound",
            ErrorKind::SpawnFailed => "SpawnFailed",
            ErrorKind::SpawnTimeout => "SpawnTimeout",
            ErrorKind::PersistenceFailed => "PersistenceFailed",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::InvalidConfig => "InvalidConfig",
        }
    }

    /// Process exit code used by the command-line front end.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::NotFound => 10,
            ErrorKind::DuplicateName => 11,
            ErrorKind::AlreadyRunning => 12,
            ErrorKind::InvalidState => 13,
            ErrorKind::SessionAlreadyExists => 14,
            ErrorKind::SessionNotFound => 15,
            ErrorKind::SpawnFailed => 16,
            ErrorKind::SpawnTimeout => 17,
            ErrorKind::PersistenceFailed => 18,
            ErrorKind::InvalidArgument => 2,
            ErrorKind::InvalidConfig => 3,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure report returned by the command façade.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{kind}: {message}")]
pub struct CommandError {
    /// Error kind from the stable taxonomy.
    pub kind: ErrorKind,
    /// Instance the call targeted, when there was one.
    pub server_id: Option<ServerId>,
    /// Last known observed state of that instance.
    pub observed_state: Option<ObservedState>,
    /// Human-readable message.
    pub message: String,
}

impl CommandError {
    pub(crate) fn new(
        error: Error,
        server_id: Option<ServerId>,
        observed_state: Option<ObservedState>,
    ) -> Self {
        Self {
            kind: error.kind(),
            server_id,
            observed_state,
            message: error.to_string(),
        }
    }
}

/// Result type of façade calls.
pub type CommandResult<T> = std::result::Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping_is_stable() {
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::ConfigParse("bad".into()).kind(),
            ErrorKind::InvalidConfig
        );
        assert_eq!(ErrorKind::SpawnTimeout.as_str(), "SpawnTimeout");
        assert_eq!(ErrorKind::PersistenceFailed.to_string(), "PersistenceFailed");
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::DuplicateName,
            ErrorKind::AlreadyRunning,
            ErrorKind::InvalidState,
            ErrorKind::SessionAlreadyExists,
            ErrorKind::SessionNotFound,
            ErrorKind::SpawnFailed,
            ErrorKind::SpawnTimeout,
            ErrorKind::PersistenceFailed,
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidConfig,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_command_error_carries_context() {
        let err = CommandError::new(
            Error::InvalidState("server is running".into()),
            None,
            Some(ObservedState::Running),
        );
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(err.observed_state, Some(ObservedState::Running));
        assert!(err.to_string().starts_with("InvalidState: "));
    }
}
