//! Replica set error types

use std::io;

/// Result type for replica set operations
pub type Result<T> = std::result::Result<T, ReplicaSetError>;

/// Server error code for a node that has not been initiated yet.
pub const NOT_YET_INITIALIZED: i32 = 94;

/// Server error code for a malformed replica set configuration.
pub const INVALID_REPLICA_SET_CONFIG: i32 = 93;

/// Server error code for a reconfiguration that does not follow the current version.
pub const NEW_CONFIG_INCOMPATIBLE: i32 = 103;

/// Server error code for an initiate sent to an already initiated node.
pub const ALREADY_INITIALIZED: i32 = 23;

/// Server error code returned by initiate while other members cannot be reached.
pub const NODE_NOT_FOUND: i32 = 74;

/// Server error code for a step-down request sent to a node that is not primary.
pub const NOT_MASTER: i32 = 10107;

/// Replica set specific error types
#[derive(Debug, thiserror::Error)]
pub enum ReplicaSetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Command failed ({code}): {message}")]
    Command { code: i32, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Replica set not initiated")]
    NotInitiated,

    #[error("master not configured")]
    MasterNotConfigured,

    #[error("timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Replication status unavailable after {attempts} attempts: {source}")]
    StatusUnavailable {
        attempts: usize,
        #[source]
        source: Box<ReplicaSetError>,
    },

    #[error("Replication status reported no members after {attempts} attempts")]
    MembersNotPopulated { attempts: usize },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl ReplicaSetError {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }

    pub fn command<T: Into<String>>(code: i32, msg: T) -> Self {
        Self::Command {
            code,
            message: msg.into(),
        }
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    /// A dropped, reset, refused or timed out connection.
    ///
    /// These are routine while the replica set elects a new primary.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// An established connection was closed under us, which is what a leader
    /// change looks like from the client side.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Whether a caller-owned retry strategy should try the operation again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Configuration(_))
    }

    /// Server error code, if this error came back from a command reply.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Command { code, .. } => Some(*code),
            _ => None,
        }
    }
}
