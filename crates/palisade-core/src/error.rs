//! Error types for palisade-core

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PalisadeError {
    #[error("access denied: {request}")]
    AccessDenied { request: String },

    #[error("enforcement is already armed for this execution")]
    AlreadyArmed,

    #[error("cannot disarm while an enforcement check is in progress")]
    InCheck,

    #[error("wrong or missing arm token")]
    WrongToken,

    #[error("unit not found: {name}")]
    ResolutionNotFound {
        name: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("runtime process unreachable: {0}")]
    ProcessUnreachable(String),

    #[error("runtime process killed an execution that held critical sections")]
    UnsafeKillSignaled,

    #[error("execution killed: {reason}")]
    Killed { reason: String },

    #[error("unit {unit} failed: {message}")]
    ExecutionFailure { unit: String, message: String },

    #[error("runtime process has no session")]
    NotInitialized,

    #[error("runtime process session is already initialized")]
    AlreadyInitialized,

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl PalisadeError {
    /// Failure raised by a unit itself. The coordinator fills in the unit name.
    pub fn unit_failure(message: impl Into<String>) -> Self {
        Self::ExecutionFailure {
            unit: String::new(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(name: &str) -> Self {
        Self::ResolutionNotFound {
            name: name.to_string(),
            source: None,
        }
    }

    /// Whether the pool should resubmit the task to a fresh process.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ProcessUnreachable(_))
    }
}

impl From<rmp_serde::encode::Error> for PalisadeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PalisadeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Discriminant of a [`PalisadeError`] as it crosses the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    AccessDenied,
    AlreadyArmed,
    InCheck,
    WrongToken,
    NotFound { name: String },
    Unreachable,
    UnsafeKill,
    Killed,
    Execution { unit: String },
    NotInitialized,
    AlreadyInitialized,
    Spawn,
    PoolShutdown,
    Timeout { millis: u64 },
    Config,
    Io,
    Codec,
}

/// Serializable form of an error raised inside a runtime process.
///
/// Converting back with [`RemoteFailure::into_error`] yields the same
/// variant, so callers handle remote and local failures alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteFailure {
    #[must_use]
    pub fn into_error(self) -> PalisadeError {
        let message = self.message;
        match self.kind {
            FailureKind::AccessDenied => PalisadeError::AccessDenied { request: message },
            FailureKind::AlreadyArmed => PalisadeError::AlreadyArmed,
            FailureKind::InCheck => PalisadeError::InCheck,
            FailureKind::WrongToken => PalisadeError::WrongToken,
            FailureKind::NotFound { name } => PalisadeError::ResolutionNotFound { name, source: None },
            FailureKind::Unreachable => PalisadeError::ProcessUnreachable(message),
            FailureKind::UnsafeKill => PalisadeError::UnsafeKillSignaled,
            FailureKind::Killed => PalisadeError::Killed { reason: message },
            FailureKind::Execution { unit } => PalisadeError::ExecutionFailure { unit, message },
            FailureKind::NotInitialized => PalisadeError::NotInitialized,
            FailureKind::AlreadyInitialized => PalisadeError::AlreadyInitialized,
            FailureKind::Spawn => PalisadeError::Spawn(message),
            FailureKind::PoolShutdown => PalisadeError::PoolShutdown,
            FailureKind::Timeout { millis } => PalisadeError::Timeout(Duration::from_millis(millis)),
            FailureKind::Config => PalisadeError::Config(message),
            FailureKind::Io => PalisadeError::Io(std::io::Error::other(message)),
            FailureKind::Codec => PalisadeError::Codec(message),
        }
    }
}

impl From<&PalisadeError> for RemoteFailure {
    fn from(error: &PalisadeError) -> Self {
        let (kind, message) = match error {
            PalisadeError::AccessDenied { request } => (FailureKind::AccessDenied, request.clone()),
            PalisadeError::AlreadyArmed => (FailureKind::AlreadyArmed, String::new()),
            PalisadeError::InCheck => (FailureKind::InCheck, String::new()),
            PalisadeError::WrongToken => (FailureKind::WrongToken, String::new()),
            PalisadeError::ResolutionNotFound { name, source } => (
                FailureKind::NotFound { name: name.clone() },
                source.as_ref().map(ToString::to_string).unwrap_or_default(),
            ),
            PalisadeError::ProcessUnreachable(reason) => (FailureKind::Unreachable, reason.clone()),
            PalisadeError::UnsafeKillSignaled => (FailureKind::UnsafeKill, String::new()),
            PalisadeError::Killed { reason } => (FailureKind::Killed, reason.clone()),
            PalisadeError::ExecutionFailure { unit, message } => {
                (FailureKind::Execution { unit: unit.clone() }, message.clone())
            }
            PalisadeError::NotInitialized => (FailureKind::NotInitialized, String::new()),
            PalisadeError::AlreadyInitialized => (FailureKind::AlreadyInitialized, String::new()),
            PalisadeError::Spawn(reason) => (FailureKind::Spawn, reason.clone()),
            PalisadeError::PoolShutdown => (FailureKind::PoolShutdown, String::new()),
            PalisadeError::Timeout(after) => (
                FailureKind::Timeout {
                    millis: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                },
                String::new(),
            ),
            PalisadeError::Config(reason) => (FailureKind::Config, reason.clone()),
            PalisadeError::Io(e) => (FailureKind::Io, e.to_string()),
            PalisadeError::Codec(reason) => (FailureKind::Codec, reason.clone()),
        };
        Self { kind, message }
    }
}
