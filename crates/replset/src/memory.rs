//! In-memory replica set
//!
//! Simulates the server side of the commands in [`Command`] closely enough to
//! drive the controller end to end: version-checked reconfiguration, primary
//! election when the primary stops or steps down, and connections that drop
//! on a leader change.

use crate::address::{normalize_address, strip_ipv6_brackets};
use crate::error::{
    ReplicaSetError, Result, ALREADY_INITIALIZED, INVALID_REPLICA_SET_CONFIG,
    NEW_CONFIG_INCOMPATIBLE, NOT_MASTER, NOT_YET_INITIALIZED,
};
use crate::member::Config;
use crate::session::{Command, ReadConsistency, Session};
use crate::status::MemberState;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Reply code when no secondary can take over from a stepping-down primary.
const EXCEEDED_TIME_LIMIT: i32 = 262;

/// Server quirks the simulation can reproduce
#[derive(Debug, Clone, Default)]
pub struct MemoryOptions {
    /// Drop the connection after every accepted reconfiguration
    pub drop_on_reconfig: bool,

    /// Number of status replies with no members right after initiate
    pub status_lag: usize,

    /// Report IPv6 hosts without brackets, like old servers did
    pub unbracketed_ipv6: bool,
}

#[derive(Debug)]
struct NodeState {
    running: bool,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: HashMap<String, NodeState>,
    config: Option<Config>,
    primary: Option<String>,
    status_lag: usize,
}

impl ClusterState {
    fn is_running(&self, address: &str) -> bool {
        self.nodes.get(address).map_or(false, |n| n.running)
    }

    fn running_count(&self) -> usize {
        match &self.config {
            Some(config) => config
                .members
                .iter()
                .filter(|m| self.is_running(&m.address))
                .count(),
            None => 0,
        }
    }

    /// Pick a new primary among running, electable members other than
    /// `exclude`, provided a majority of members can be reached.
    fn elect(&mut self, exclude: Option<&str>) -> Option<String> {
        let config = self.config.as_ref()?;
        if self.running_count() < config.members.len() / 2 + 1 {
            self.primary = None;
            return None;
        }
        let candidate = config
            .members
            .iter()
            .filter(|m| !m.is_arbiter() && Some(m.address.as_str()) != exclude)
            .find(|m| self.is_running(&m.address))
            .map(|m| m.address.clone());
        self.primary = candidate.clone();
        candidate
    }

    fn state_of(&self, address: &str, arbiter: bool) -> MemberState {
        if !self.is_running(address) {
            MemberState::Down
        } else if self.primary.as_deref() == Some(address) {
            MemberState::Primary
        } else if arbiter {
            MemberState::Arbiter
        } else {
            MemberState::Secondary
        }
    }
}

/// A simulated replica set whose nodes share one state
#[derive(Clone, Default)]
pub struct MemoryReplicaSet {
    state: Arc<RwLock<ClusterState>>,
    options: MemoryOptions,
}

impl MemoryReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        Self {
            state: Arc::default(),
            options,
        }
    }

    /// Start (or restart) the node listening on `address`.
    pub async fn start_node(&self, address: &str) {
        let address = normalize_address(address);
        let mut state = self.state.write().await;
        state.nodes.insert(
            address.clone(),
            NodeState {
                running: true,
                started_at: Instant::now(),
            },
        );
        if state.config.is_some() && state.primary.is_none() {
            if let Some(primary) = state.elect(None) {
                tracing::debug!("Node {} came up, elected {} primary", address, primary);
            }
        }
    }

    /// Stop the node on `address`; a stopped primary triggers an election.
    pub async fn stop_node(&self, address: &str) {
        let address = normalize_address(address);
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.get_mut(&address) {
            node.running = false;
        }
        if state.primary.as_deref() == Some(address.as_str()) {
            let primary = state.elect(Some(&address));
            tracing::debug!("Primary {} stopped, new primary: {:?}", address, primary);
        }
    }

    /// Open a session to the node on `address`.
    pub fn connect(&self, address: &str) -> Arc<dyn Session> {
        Arc::new(MemorySession {
            address: normalize_address(address),
            cluster: self.clone(),
        })
    }

    /// Address of the current primary, as the cluster sees it
    pub async fn primary(&self) -> Option<String> {
        self.state.read().await.primary.clone()
    }

    /// The configuration currently in force
    pub async fn config(&self) -> Option<Config> {
        self.state.read().await.config.clone()
    }

    fn report_address(&self, address: &str) -> String {
        if self.options.unbracketed_ipv6 {
            strip_ipv6_brackets(address)
        } else {
            address.to_string()
        }
    }

    fn config_document(&self, config: &Config) -> Result<Value> {
        let mut config = config.clone();
        for member in &mut config.members {
            member.address = self.report_address(&member.address);
        }
        Ok(serde_json::to_value(config)?)
    }
}

/// Session to one node of a [`MemoryReplicaSet`]
pub struct MemorySession {
    address: String,
    cluster: MemoryReplicaSet,
}

impl MemorySession {
    /// The node a command is served by. Strong reads go to the primary once
    /// the set is initiated.
    fn target(&self, state: &ClusterState, consistency: ReadConsistency) -> Result<String> {
        if !state.is_running(&self.address) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no server listening on {}", self.address),
            )
            .into());
        }
        if consistency == ReadConsistency::Monotonic || state.config.is_none() {
            return Ok(self.address.clone());
        }
        match &state.primary {
            Some(primary) if state.is_running(primary) => Ok(primary.clone()),
            _ => Err(io::Error::new(io::ErrorKind::TimedOut, "no reachable servers").into()),
        }
    }

    fn get_config(&self, state: &ClusterState) -> Result<Value> {
        let config = state.config.as_ref().ok_or_else(not_initiated)?;
        Ok(json!({ "config": self.cluster.config_document(config)?, "ok": 1 }))
    }

    fn get_status(&self, state: &mut ClusterState, target: &str) -> Result<Value> {
        let config = state.config.clone().ok_or_else(not_initiated)?;
        if state.status_lag > 0 {
            state.status_lag -= 1;
            return Ok(json!({ "set": config.name, "members": [], "ok": 1 }));
        }

        let members: Vec<Value> = config
            .members
            .iter()
            .map(|m| {
                let running = state.is_running(&m.address);
                let health = if running { 1.0 } else { 0.0 };
                let uptime = state
                    .nodes
                    .get(&m.address)
                    .filter(|n| n.running)
                    .map_or(0, |n| n.started_at.elapsed().as_secs());
                let mut doc = json!({
                    "_id": m.id,
                    "name": self.cluster.report_address(&m.address),
                    "health": health,
                    "state": state.state_of(&m.address, m.is_arbiter()).code(),
                    "uptime": uptime,
                    "pingMs": 0,
                });
                if m.address == target {
                    doc["self"] = json!(true);
                }
                if !running {
                    doc["errmsg"] = json!("no response");
                }
                doc
            })
            .collect();

        Ok(json!({ "set": config.name, "members": members, "ok": 1 }))
    }

    fn is_master(&self, state: &ClusterState, target: &str) -> Value {
        let cluster = &self.cluster;
        let mut doc = json!({
            "ismaster": false,
            "secondary": false,
            "me": cluster.report_address(target),
            "localTime": chrono::Utc::now().to_rfc3339(),
            "ok": 1,
        });
        let config = match &state.config {
            Some(config) => config,
            None => return doc,
        };

        let arbiter = config.member(target).map_or(false, |m| m.is_arbiter());
        let primary = state.primary.as_deref().filter(|p| state.is_running(p));
        doc["ismaster"] = json!(primary == Some(target));
        let member = config.member(target).is_some();
        doc["secondary"] = json!(member && !arbiter && primary != Some(target));
        doc["arbiterOnly"] = json!(arbiter);
        doc["setName"] = json!(config.name);
        doc["hosts"] = config
            .members
            .iter()
            .filter(|m| !m.is_arbiter())
            .map(|m| cluster.report_address(&m.address))
            .collect();
        doc["arbiters"] = config
            .members
            .iter()
            .filter(|m| m.is_arbiter())
            .map(|m| cluster.report_address(&m.address))
            .collect();
        if let Some(primary) = primary {
            doc["primary"] = json!(cluster.report_address(primary));
        }
        doc
    }

    fn initiate(&self, state: &mut ClusterState, target: &str, config: Config) -> Result<Value> {
        if state.config.is_some() {
            return Err(ReplicaSetError::command(ALREADY_INITIALIZED, "already initialized"));
        }
        check_config(&config)?;
        if config.member(target).is_none() {
            return Err(ReplicaSetError::command(
                INVALID_REPLICA_SET_CONFIG,
                format!("{} is not a member of the new configuration", target),
            ));
        }

        tracing::debug!("Node {} initiated replica set {}", target, config.name);
        state.config = Some(config);
        state.primary = Some(target.to_string());
        state.status_lag = self.cluster.options.status_lag;
        Ok(json!({ "ok": 1 }))
    }

    fn reconfig(&self, state: &mut ClusterState, target: &str, config: Config) -> Result<Value> {
        let current = state.config.as_ref().ok_or_else(not_initiated)?;
        if state.primary.as_deref() != Some(target) {
            return Err(ReplicaSetError::command(NOT_MASTER, "not master"));
        }
        if config.version != current.version + 1 {
            return Err(ReplicaSetError::command(
                NEW_CONFIG_INCOMPATIBLE,
                format!(
                    "version field value of {} must be {}",
                    config.version,
                    current.version + 1
                ),
            ));
        }
        if config.name != current.name {
            return Err(ReplicaSetError::command(
                INVALID_REPLICA_SET_CONFIG,
                format!("replica set name cannot change from {}", current.name),
            ));
        }
        check_config(&config)?;

        let primary_kept = config.member(target).is_some();
        tracing::debug!(
            "Replica set {} reconfigured to version {} with {} members",
            config.name,
            config.version,
            config.members.len()
        );
        state.config = Some(config);
        if !primary_kept {
            state.elect(Some(target));
        }

        if self.cluster.options.drop_on_reconfig || !primary_kept {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF").into());
        }
        Ok(json!({ "ok": 1 }))
    }

    fn step_down(&self, state: &mut ClusterState, target: &str) -> Result<Value> {
        state.config.as_ref().ok_or_else(not_initiated)?;
        if state.primary.as_deref() != Some(target) {
            return Err(ReplicaSetError::command(NOT_MASTER, "not primary so can't step down"));
        }
        match state.elect(Some(target)) {
            Some(primary) => {
                tracing::debug!("Primary {} stepped down in favour of {}", target, primary);
                // Stepping down closes every client connection.
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF").into())
            }
            None => {
                state.primary = Some(target.to_string());
                Err(ReplicaSetError::command(
                    EXCEEDED_TIME_LIMIT,
                    "no electable secondaries caught up",
                ))
            }
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn run(&self, command: Command, consistency: ReadConsistency) -> Result<Value> {
        let mut state = self.cluster.state.write().await;
        let target = self.target(&state, consistency)?;
        tracing::trace!("{} on {} ({})", command.name(), target, consistency);

        match command {
            Command::GetConfig => self.get_config(&state),
            Command::GetStatus => self.get_status(&mut state, &target),
            Command::IsMaster => Ok(self.is_master(&state, &target)),
            Command::Initiate(config) => self.initiate(&mut state, &target, config),
            Command::Reconfig(config) => self.reconfig(&mut state, &target, config),
            Command::StepDown { .. } => self.step_down(&mut state, &target),
        }
    }

    async fn refresh(&self) -> Result<()> {
        let state = self.cluster.state.read().await;
        if state.is_running(&self.address) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused).into())
        }
    }
}

fn not_initiated() -> ReplicaSetError {
    ReplicaSetError::command(NOT_YET_INITIALIZED, "no replset config has been received")
}

fn check_config(config: &Config) -> Result<()> {
    config
        .validate()
        .map_err(|e| ReplicaSetError::command(INVALID_REPLICA_SET_CONFIG, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Member;
    use std::collections::BTreeMap;

    async fn initiated(addresses: &[&str]) -> MemoryReplicaSet {
        let cluster = MemoryReplicaSet::new();
        for address in addresses {
            cluster.start_node(address).await;
        }
        let session = cluster.connect(addresses[0]);
        session
            .run(
                Command::Initiate(Config::initial("rs", addresses[0], BTreeMap::new())),
                ReadConsistency::Monotonic,
            )
            .await
            .unwrap();
        cluster
    }

    fn with_members(config: &Config, addresses: &[&str]) -> Config {
        let members = addresses
            .iter()
            .enumerate()
            .map(|(i, a)| Member::new(*a).with_id(i as u32 + 1))
            .collect();
        config.successor(members)
    }

    #[tokio::test]
    async fn test_uninitiated_node() {
        let cluster = MemoryReplicaSet::new();
        cluster.start_node("a:1").await;
        let session = cluster.connect("a:1");

        let err = session
            .run(Command::GetConfig, ReadConsistency::Strong)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(NOT_YET_INITIALIZED));

        let reply = session
            .run(Command::IsMaster, ReadConsistency::Monotonic)
            .await
            .unwrap();
        assert_eq!(reply["ismaster"], json!(false));
        assert!(reply.get("primary").is_none());
    }

    #[tokio::test]
    async fn test_stopped_node_refuses() {
        let cluster = MemoryReplicaSet::new();
        let session = cluster.connect("a:1");
        let err = session
            .run(Command::IsMaster, ReadConsistency::Monotonic)
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(session.refresh().await.is_err());
    }

    #[tokio::test]
    async fn test_initiate_twice() {
        let cluster = initiated(&["a:1"]).await;
        assert_eq!(cluster.primary().await.as_deref(), Some("a:1"));

        let err = cluster
            .connect("a:1")
            .run(
                Command::Initiate(Config::initial("rs", "a:1", BTreeMap::new())),
                ReadConsistency::Monotonic,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ALREADY_INITIALIZED));
    }

    #[tokio::test]
    async fn test_reconfig_requires_next_version() {
        let cluster = initiated(&["a:1", "b:1"]).await;
        let session = cluster.connect("a:1");
        let current = cluster.config().await.unwrap();

        let mut stale = with_members(&current, &["a:1", "b:1"]);
        stale.version = current.version;
        let err = session
            .run(Command::Reconfig(stale), ReadConsistency::Strong)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(NEW_CONFIG_INCOMPATIBLE));

        let next = with_members(&current, &["a:1", "b:1"]);
        session
            .run(Command::Reconfig(next), ReadConsistency::Strong)
            .await
            .unwrap();
        assert_eq!(cluster.config().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_reconfig_rejects_duplicate_hosts() {
        let cluster = initiated(&["a:1"]).await;
        let current = cluster.config().await.unwrap();
        let bad = current.successor(vec![Member::new("a:1").with_id(1), Member::new("a:1").with_id(2)]);

        let err = cluster
            .connect("a:1")
            .run(Command::Reconfig(bad), ReadConsistency::Strong)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(INVALID_REPLICA_SET_CONFIG));
    }

    #[tokio::test]
    async fn test_status_reports_down_members() {
        let cluster = initiated(&["a:1", "b:1", "c:1"]).await;
        let session = cluster.connect("a:1");
        let current = cluster.config().await.unwrap();
        session
            .run(
                Command::Reconfig(with_members(&current, &["a:1", "b:1", "c:1"])),
                ReadConsistency::Strong,
            )
            .await
            .unwrap();
        cluster.stop_node("c:1").await;

        let reply = session
            .run(Command::GetStatus, ReadConsistency::Monotonic)
            .await
            .unwrap();
        let members = reply["members"].as_array().unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0]["self"], json!(true));
        assert_eq!(members[0]["state"], json!(MemberState::Primary.code()));
        assert_eq!(members[1]["state"], json!(MemberState::Secondary.code()));
        assert_eq!(members[2]["state"], json!(MemberState::Down.code()));
        assert_eq!(members[2]["health"], json!(0.0));
    }

    #[tokio::test]
    async fn test_step_down_elects_new_primary() {
        let cluster = initiated(&["a:1", "b:1"]).await;
        let session = cluster.connect("a:1");

        // A lone member has nobody to hand over to.
        let err = session
            .run(Command::StepDown { seconds: 60 }, ReadConsistency::Strong)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(EXCEEDED_TIME_LIMIT));

        let current = cluster.config().await.unwrap();
        session
            .run(
                Command::Reconfig(with_members(&current, &["a:1", "b:1"])),
                ReadConsistency::Strong,
            )
            .await
            .unwrap();
        let err = session
            .run(Command::StepDown { seconds: 60 }, ReadConsistency::Strong)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(cluster.primary().await.as_deref(), Some("b:1"));

        let err = cluster
            .connect("a:1")
            .run(Command::StepDown { seconds: 60 }, ReadConsistency::Monotonic)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(NOT_MASTER));
    }

    #[tokio::test]
    async fn test_unbracketed_ipv6_reports() {
        let cluster = MemoryReplicaSet::with_options(MemoryOptions {
            unbracketed_ipv6: true,
            ..Default::default()
        });
        cluster.start_node("[::1]:37017").await;
        let session = cluster.connect("[::1]:37017");
        session
            .run(
                Command::Initiate(Config::initial("rs", "[::1]:37017", BTreeMap::new())),
                ReadConsistency::Monotonic,
            )
            .await
            .unwrap();

        let reply = session
            .run(Command::GetConfig, ReadConsistency::Strong)
            .await
            .unwrap();
        assert_eq!(reply["config"]["members"][0]["host"], json!("::1:37017"));
    }

    #[tokio::test]
    async fn test_status_lag_after_initiate() {
        let cluster = MemoryReplicaSet::with_options(MemoryOptions {
            status_lag: 2,
            ..Default::default()
        });
        cluster.start_node("a:1").await;
        let session = cluster.connect("a:1");
        session
            .run(
                Command::Initiate(Config::initial("rs", "a:1", BTreeMap::new())),
                ReadConsistency::Monotonic,
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let reply = session
                .run(Command::GetStatus, ReadConsistency::Monotonic)
                .await
                .unwrap();
            assert_eq!(reply["members"], json!([]));
        }
        let reply = session
            .run(Command::GetStatus, ReadConsistency::Monotonic)
            .await
            .unwrap();
        assert_eq!(reply["members"].as_array().unwrap().len(), 1);
    }
}
