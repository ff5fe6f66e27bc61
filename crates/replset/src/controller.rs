//! Replica set membership controller
//!
//! [`ReplicaSet`] issues membership changes and health queries over a
//! caller-owned [`Session`]. It keeps no state of its own between calls.
//!
//! `add`, `remove` and `set` submit a reconfiguration, which may force a new
//! primary to be elected and drop the session. They do not retry; wrap them
//! in [`retry`](crate::retry::retry) with
//! [`ReplicaSetSettings::reconfig_strategy`].

use crate::address::normalize_address;
use crate::allocator::{assign_ids, ensure_unique_addresses};
use crate::error::{ReplicaSetError, Result, NODE_NOT_FOUND};
use crate::member::{Config, Member};
use crate::reader;
use crate::readiness::{self, QuorumReadiness, ReadinessCheck, SessionStatus, StatusSource};
use crate::session::{Command, ReadConsistency, Session};
use crate::settings::ReplicaSetSettings;
use crate::status::{IsMasterResults, Status};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Membership and health operations for one replica set
pub struct ReplicaSet {
    session: Arc<dyn Session>,
    settings: ReplicaSetSettings,
    status_source: Arc<dyn StatusSource>,
    readiness: Option<Arc<dyn ReadinessCheck>>,
}

impl ReplicaSet {
    /// Create a controller over `session` with default settings
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self::with_settings(session, ReplicaSetSettings::default())
    }

    /// Create a controller with explicit settings
    pub fn with_settings(session: Arc<dyn Session>, settings: ReplicaSetSettings) -> Self {
        let status_source = Arc::new(SessionStatus::new(session.clone()));
        Self {
            session,
            settings,
            status_source,
            readiness: None,
        }
    }

    /// Read replication status from `source` instead of the session
    pub fn with_status_source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.status_source = source;
        self
    }

    /// Use `check` when waiting for the replica set to become ready
    pub fn with_readiness_check(mut self, check: Arc<dyn ReadinessCheck>) -> Self {
        self.readiness = Some(check);
        self
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn settings(&self) -> &ReplicaSetSettings {
        &self.settings
    }

    /// Bootstrap an uninitiated node into a one-member replica set.
    ///
    /// After the initiate command, status is polled until it lists at least
    /// one member, since a freshly initiated node briefly reports none.
    pub async fn initiate(
        &self,
        address: &str,
        name: &str,
        tags: BTreeMap<String, String>,
    ) -> Result<()> {
        let config = Config::initial(name, normalize_address(address), tags);
        config.validate()?;
        tracing::info!("Initiating replica set {} with member {}", name, address);

        let initiate_err = self.send_initiate(&config).await;

        // Even if initiate reported an error it may still be in progress, so
        // always look at the status.
        let mut attempt = self.settings.initiate_status_strategy().start();
        let mut status_err = None;
        while attempt.next().await {
            if let Err(err) = self.session.refresh().await {
                tracing::debug!("Initiate: session refresh failed: {}", err);
            }
            match self.status_source.current_status().await {
                Ok(status) if !status.members.is_empty() => {
                    tracing::info!(
                        "Replica set {} initiated after {} status checks",
                        name,
                        attempt.count()
                    );
                    return Ok(());
                }
                Ok(_) => {
                    tracing::debug!("Initiate: replication status has no members yet");
                    status_err = None;
                }
                Err(err) => {
                    tracing::warn!("Initiate: fetching replication status failed: {}", err);
                    status_err = Some(err);
                }
            }
        }

        if let Some(err) = initiate_err {
            return Err(err);
        }
        let attempts = attempt.count();
        Err(match status_err {
            Some(err) => ReplicaSetError::StatusUnavailable {
                attempts,
                source: Box::new(err),
            },
            None => ReplicaSetError::MembersNotPopulated { attempts },
        })
    }

    async fn send_initiate(&self, config: &Config) -> Option<ReplicaSetError> {
        let mut attempt = self.settings.initiate_strategy().start();
        while attempt.next().await {
            if let Err(err) = self.session.refresh().await {
                tracing::debug!("Initiate: session refresh failed: {}", err);
            }
            match self
                .session
                .run(Command::Initiate(config.clone()), ReadConsistency::Monotonic)
                .await
            {
                Ok(_) => return None,
                Err(err) if is_members_unreachable(&err) && attempt.has_next() => {
                    tracing::debug!("Initiate: members unreachable, retrying: {}", err);
                }
                Err(err) => {
                    tracing::warn!("Initiate command failed: {}", err);
                    return Some(err);
                }
            }
        }
        None
    }

    /// Add members to the current configuration.
    ///
    /// A member whose address is already configured is left as it is, so
    /// re-adding an existing member never duplicates it or changes its id.
    pub async fn add(&self, members: Vec<Member>) -> Result<()> {
        let members = normalized(members);
        ensure_unique_addresses(&members)?;

        let config = self.current_config(ReadConsistency::Strong).await?;
        let mut desired = config.members.clone();
        for member in members {
            if config.member(&member.address).is_some() {
                tracing::debug!("Add: {} is already a member, skipping", member.address);
                continue;
            }
            desired.push(member);
        }

        let desired = assign_ids(&config.members, desired)?;
        self.apply_config("Add", &config, config.successor(desired)).await
    }

    /// Remove members by address.
    ///
    /// Addresses that are not configured are ignored; the configuration is
    /// still resubmitted and its version bumped.
    pub async fn remove<S: AsRef<str>>(&self, addresses: &[S]) -> Result<()> {
        let addresses: Vec<String> = addresses
            .iter()
            .map(|a| normalize_address(a.as_ref()))
            .collect();

        let config = self.current_config(ReadConsistency::Strong).await?;
        let desired: Vec<Member> = config
            .members
            .iter()
            .filter(|m| !addresses.contains(&m.address))
            .cloned()
            .collect();

        let absent = absent_addresses(&config, &addresses);
        if !absent.is_empty() {
            tracing::debug!("Remove: {:?} are not members", absent);
        }
        self.apply_config("Remove", &config, config.successor(desired)).await
    }

    /// Replace the member list with `members`.
    ///
    /// Configured members missing from `members` are dropped. The current
    /// configuration is read only to keep the ids of surviving members.
    pub async fn set(&self, members: Vec<Member>) -> Result<()> {
        let members = normalized(members);
        let config = self.current_config(ReadConsistency::Strong).await?;
        let desired = assign_ids(&config.members, members)?;
        self.apply_config("Set", &config, config.successor(desired)).await
    }

    async fn apply_config(&self, op: &str, old: &Config, new: Config) -> Result<()> {
        new.validate()?;
        tracing::debug!(
            "{}() changing replica set {} from version {} ({} members) to version {} ({} members)",
            op,
            new.name,
            old.version,
            old.members.len(),
            new.version,
            new.members.len()
        );

        match self
            .session
            .run(Command::Reconfig(new), ReadConsistency::Strong)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_disconnect() => {
                // A primary change drops every connection; the new config was
                // accepted.
                tracing::debug!("Got {} while running {}(), refreshing session", err, op);
                if let Err(err) = self.session.refresh().await {
                    tracing::warn!("{}(): session refresh failed: {}", op, err);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Current configuration document
    pub async fn current_config(&self, consistency: ReadConsistency) -> Result<Config> {
        reader::current_config(self.session.as_ref(), consistency).await
    }

    /// Members of the current configuration.
    ///
    /// Use [`ReadConsistency::Strong`] right after a reconfiguration.
    pub async fn current_members(&self, consistency: ReadConsistency) -> Result<Vec<Member>> {
        reader::current_members(self.session.as_ref(), consistency).await
    }

    /// Current replication status
    pub async fn current_status(&self) -> Result<Status> {
        self.status_source.current_status().await
    }

    /// isMaster handshake against the connected node
    pub async fn is_master(&self) -> Result<IsMasterResults> {
        reader::is_master(self.session.as_ref()).await
    }

    /// Address of the current primary.
    ///
    /// Fails with [`ReplicaSetError::MasterNotConfigured`] when the replica
    /// set has no primary, e.g. before it was initiated.
    pub async fn master_host_port(&self) -> Result<String> {
        let results = self.is_master().await?;
        if results.primary_address.is_empty() {
            return Err(ReplicaSetError::MasterNotConfigured);
        }
        Ok(results.primary_address)
    }

    /// Whether a majority of members are healthy
    pub async fn is_ready(&self) -> Result<bool> {
        readiness::is_ready(self.status_source.as_ref()).await
    }

    /// Poll readiness until ready, an error, or `timeout_secs` elapses.
    pub async fn wait_until_ready(&self, timeout_secs: u64) -> Result<()> {
        let interval = self.settings.ready_poll_interval();
        match &self.readiness {
            Some(check) => readiness::wait_until_ready(check.as_ref(), timeout_secs, interval).await,
            None => {
                let check = QuorumReadiness::new(self.status_source.clone());
                readiness::wait_until_ready(&check, timeout_secs, interval).await
            }
        }
    }

    /// Ask the connected primary to step down.
    ///
    /// The server usually drops the connection while it steps down; that is
    /// reported as success and the caller must reconnect.
    pub async fn step_down_primary(&self) -> Result<()> {
        let seconds = self.settings.step_down_secs;
        tracing::info!("Asking primary to step down for {}s", seconds);
        match self
            .session
            .run(Command::StepDown { seconds }, ReadConsistency::Strong)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_disconnect() => {
                tracing::debug!("Connection dropped by step down: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn normalized(members: Vec<Member>) -> Vec<Member> {
    members
        .into_iter()
        .map(|mut m| {
            m.address = normalize_address(&m.address);
            m
        })
        .collect()
}

/// Distinct entries of `addresses` that `config` does not list
fn absent_addresses<'a>(config: &Config, addresses: &'a [String]) -> BTreeSet<&'a str> {
    addresses
        .iter()
        .map(String::as_str)
        .filter(|a| config.member(a).is_none())
        .collect()
}

fn is_members_unreachable(err: &ReplicaSetError) -> bool {
    match err {
        ReplicaSetError::Command { code, message } => {
            *code == NODE_NOT_FOUND || message.contains("must be reachable")
        }
        _ => false,
    }
}
