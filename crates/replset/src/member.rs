//! Replica set members and configuration documents

use crate::address::normalize_address;
use crate::error::{ReplicaSetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// A desired or actual participant in the replica set.
///
/// On a member passed to `add` or `set`, an `id` of zero means "not assigned
/// yet" and ids handed out by the controller start at 1. Members read back
/// from the server keep whatever id they carry, zero included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Member id, unique within a [`Config`]
    #[serde(rename = "_id", default)]
    pub id: u32,

    /// `host:port` of the member
    #[serde(rename = "host")]
    pub address: String,

    /// Arbitrary metadata attached to the member
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// Member votes but holds no data
    #[serde(rename = "arbiterOnly", default, skip_serializing_if = "Option::is_none")]
    pub arbiter: Option<bool>,

    #[serde(rename = "buildIndexes", default, skip_serializing_if = "Option::is_none")]
    pub build_indexes: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,

    /// Replication delay in seconds
    #[serde(rename = "slaveDelay", default, skip_serializing_if = "Option::is_none")]
    pub slave_delay: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub votes: Option<u32>,
}

impl Member {
    /// Create a member with no id assigned yet
    pub fn new<T: Into<String>>(address: T) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Replace the tag set
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Add a single tag
    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_arbiter(&self) -> bool {
        self.arbiter.unwrap_or(false)
    }

    /// Whether an explicit id was requested
    pub fn has_id(&self) -> bool {
        self.id != 0
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member{{Id: {}, Address: {}}}", self.id, self.address)
    }
}

/// The replica set configuration document.
///
/// Replaced wholesale by every reconfiguration, never patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Replica set name, fixed at initiate time
    #[serde(rename = "_id")]
    pub name: String,

    /// Monotonic configuration version
    pub version: u64,

    #[serde(rename = "protocolVersion", default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i64>,

    #[serde(default)]
    pub members: Vec<Member>,
}

impl Config {
    /// The bootstrap configuration: a single member with id 1 at version 1.
    pub fn initial<N: Into<String>, A: Into<String>>(
        name: N,
        address: A,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: 1,
            protocol_version: None,
            members: vec![Member::new(address).with_id(1).with_tags(tags)],
        }
    }

    /// Copy of this config carrying `members` at the next version.
    pub fn successor(&self, members: Vec<Member>) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version + 1,
            protocol_version: self.protocol_version,
            members,
        }
    }

    /// Find a member by address
    pub fn member(&self, address: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.address == address)
    }

    /// Highest member id in use, zero for an empty config
    pub fn max_id(&self) -> u32 {
        self.members.iter().map(|m| m.id).max().unwrap_or(0)
    }

    /// Check that member ids and addresses are unique.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ReplicaSetError::validation("Replica set name cannot be empty"));
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for member in &self.members {
            if !ids.insert(member.id) {
                return Err(ReplicaSetError::validation(format!(
                    "duplicate member id {}",
                    member.id
                )));
            }
            if !addresses.insert(member.address.as_str()) {
                return Err(ReplicaSetError::validation(format!(
                    "duplicate member address {}",
                    member.address
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn normalize_addresses(&mut self) {
        for member in &mut self.members {
            member.address = normalize_address(&member.address);
        }
    }
}
