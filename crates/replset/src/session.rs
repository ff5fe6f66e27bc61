//! Command channel to the replicated store

use crate::error::Result;
use crate::member::Config;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;

/// Read consistency requested for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadConsistency {
    /// May be served by any member and lag a recent write. Fine for polling.
    #[default]
    Monotonic,

    /// Served by the primary; required to observe a configuration that was
    /// just written (e.g. reading members right after `add`).
    Strong,
}

impl fmt::Display for ReadConsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monotonic => write!(f, "monotonic"),
            Self::Strong => write!(f, "strong"),
        }
    }
}

/// Administrative commands the controller issues
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Read the current replica set configuration
    GetConfig,

    /// Read the current replication status
    GetStatus,

    /// Node identity and topology handshake
    IsMaster,

    /// Bootstrap an uninitiated node with its first configuration
    Initiate(Config),

    /// Replace the whole configuration; version checked by the server
    Reconfig(Config),

    /// Ask the primary to relinquish leadership for at least `seconds`
    StepDown { seconds: u64 },
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetConfig => "replSetGetConfig",
            Self::GetStatus => "replSetGetStatus",
            Self::IsMaster => "isMaster",
            Self::Initiate(_) => "replSetInitiate",
            Self::Reconfig(_) => "replSetReconfig",
            Self::StepDown { .. } => "replSetStepDown",
        }
    }

    /// Render the command as a document, for drivers that speak documents.
    pub fn to_document(&self) -> Result<Value> {
        let arg = match self {
            Self::GetConfig | Self::GetStatus | Self::IsMaster => json!(1),
            Self::Initiate(config) | Self::Reconfig(config) => serde_json::to_value(config)?,
            Self::StepDown { seconds } => json!(seconds),
        };
        let mut doc = serde_json::Map::new();
        doc.insert(self.name().to_string(), arg);
        Ok(Value::Object(doc))
    }
}

/// A connection to one store node, owned by the caller.
///
/// Implementations translate [`Command`]s to the store's protocol and return
/// the reply document. Server-side rejections come back as
/// [`ReplicaSetError::Command`](crate::ReplicaSetError::Command); transport
/// failures as [`ReplicaSetError::Io`](crate::ReplicaSetError::Io).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    /// Run a command and return its reply document
    async fn run(&self, command: Command, consistency: ReadConsistency) -> Result<Value>;

    /// Re-establish the underlying connection after it was dropped
    async fn refresh(&self) -> Result<()>;
}
