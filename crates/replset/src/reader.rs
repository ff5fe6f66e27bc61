//! Read-only queries: configuration, status and the isMaster handshake

use crate::error::{ReplicaSetError, Result, NOT_YET_INITIALIZED};
use crate::member::{Config, Member};
use crate::session::{Command, ReadConsistency, Session};
use crate::status::{IsMasterResults, Status};
use serde_json::Value;

/// Read the current replica set configuration.
///
/// Returns [`ReplicaSetError::NotInitiated`] when the node has no
/// configuration yet.
pub async fn current_config(session: &dyn Session, consistency: ReadConsistency) -> Result<Config> {
    let reply = run_read(session, Command::GetConfig, consistency).await?;
    // replSetGetConfig wraps the document in `config`; older servers return it bare.
    let doc = match reply {
        Value::Object(mut map) if map.contains_key("config") => map
            .remove("config")
            .unwrap_or(Value::Null),
        other => other,
    };

    let mut config: Config = serde_json::from_value(doc)?;
    config.normalize_addresses();
    Ok(config)
}

/// Members of the current configuration.
pub async fn current_members(
    session: &dyn Session,
    consistency: ReadConsistency,
) -> Result<Vec<Member>> {
    Ok(current_config(session, consistency).await?.members)
}

/// Read the current replication status.
pub async fn current_status(session: &dyn Session, consistency: ReadConsistency) -> Result<Status> {
    let reply = run_read(session, Command::GetStatus, consistency).await?;
    let mut status: Status = serde_json::from_value(reply)?;
    status.normalize_addresses();
    Ok(status)
}

/// Run the isMaster handshake against the node the session is attached to.
pub async fn is_master(session: &dyn Session) -> Result<IsMasterResults> {
    let reply = session.run(Command::IsMaster, ReadConsistency::Monotonic).await?;
    let mut results: IsMasterResults = serde_json::from_value(reply)?;
    results.normalize_addresses();
    Ok(results)
}

async fn run_read(
    session: &dyn Session,
    command: Command,
    consistency: ReadConsistency,
) -> Result<Value> {
    session
        .run(command, consistency)
        .await
        .map_err(|err| match err.code() {
            Some(NOT_YET_INITIALIZED) => ReplicaSetError::NotInitiated,
            _ => err,
        })
}
