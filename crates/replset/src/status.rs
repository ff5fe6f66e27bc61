//! Replication status and leader discovery snapshots

use crate::address::normalize_address;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Operational state of a member as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
    Recovering,
    Fatal,
    Startup2,
    Unknown,
    Arbiter,
    Down,
    Rollback,
    Shunned,
}

impl MemberState {
    /// Numeric state code used on the wire
    pub fn code(&self) -> i64 {
        match self {
            Self::Startup => 0,
            Self::Primary => 1,
            Self::Secondary => 2,
            Self::Recovering => 3,
            Self::Fatal => 4,
            Self::Startup2 => 5,
            Self::Unknown => 6,
            Self::Arbiter => 7,
            Self::Down => 8,
            Self::Rollback => 9,
            Self::Shunned => 10,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Startup,
            1 => Self::Primary,
            2 => Self::Secondary,
            3 => Self::Recovering,
            4 => Self::Fatal,
            5 => Self::Startup2,
            7 => Self::Arbiter,
            8 => Self::Down,
            9 => Self::Rollback,
            10 => Self::Shunned,
            _ => Self::Unknown,
        }
    }
}

impl Default for MemberState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "STARTUP"),
            Self::Primary => write!(f, "PRIMARY"),
            Self::Secondary => write!(f, "SECONDARY"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Fatal => write!(f, "FATAL"),
            Self::Startup2 => write!(f, "STARTUP2"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Arbiter => write!(f, "ARBITER"),
            Self::Down => write!(f, "DOWN"),
            Self::Rollback => write!(f, "ROLLBACK"),
            Self::Shunned => write!(f, "SHUNNED"),
        }
    }
}

impl Serialize for MemberState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for MemberState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_code(i64::deserialize(deserializer)?))
    }
}

/// Point-in-time observation of one member
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberStatus {
    #[serde(rename = "_id")]
    pub id: u32,

    #[serde(rename = "name")]
    pub address: String,

    /// True on the member that produced the status report
    #[serde(rename = "self", default)]
    pub is_self: bool,

    #[serde(rename = "errmsg", default, skip_serializing_if = "String::is_empty")]
    pub err_msg: String,

    #[serde(rename = "health", with = "health")]
    pub healthy: bool,

    #[serde(default)]
    pub state: MemberState,

    /// Seconds since the member came up
    #[serde(default)]
    pub uptime: u64,

    #[serde(rename = "pingMs", default)]
    pub ping_ms: u64,
}

/// Snapshot of the whole replica set's status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "set", default)]
    pub name: String,

    #[serde(default)]
    pub members: Vec<MemberStatus>,
}

impl Status {
    /// Number of members reporting healthy
    pub fn healthy_count(&self) -> usize {
        self.members.iter().filter(|m| m.healthy).count()
    }

    /// The member currently in the primary state, if any
    pub fn primary(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.state == MemberState::Primary)
    }

    pub(crate) fn normalize_addresses(&mut self) {
        for member in &mut self.members {
            member.address = normalize_address(&member.address);
        }
    }
}

/// Result of the `isMaster` handshake against a single node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IsMasterResults {
    // Facts about the node that answered.
    #[serde(rename = "ismaster", default)]
    pub is_master: bool,

    #[serde(default)]
    pub secondary: bool,

    #[serde(rename = "arbiterOnly", default)]
    pub arbiter: bool,

    #[serde(rename = "me", default)]
    pub address: String,

    #[serde(
        rename = "localTime",
        default,
        deserialize_with = "local_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub local_time: Option<DateTime<Utc>>,

    // Facts about the replica set, as seen by that node.
    #[serde(rename = "setName", default)]
    pub replica_set_name: String,

    #[serde(rename = "hosts", default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub arbiters: Vec<String>,

    #[serde(rename = "primary", default)]
    pub primary_address: String,
}

impl IsMasterResults {
    pub(crate) fn normalize_addresses(&mut self) {
        self.address = normalize_address(&self.address);
        self.primary_address = normalize_address(&self.primary_address);
        for addr in self.addresses.iter_mut().chain(self.arbiters.iter_mut()) {
            *addr = normalize_address(addr);
        }
    }
}

/// `health` is a number on the wire (1 or 0); older fixtures use a bool.
mod health {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Flag(bool),
        Number(f64),
    }

    pub fn serialize<S: Serializer>(healthy: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(if *healthy { 1.0 } else { 0.0 })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(flag) => flag,
            Raw::Number(n) => n != 0.0,
        })
    }
}

fn local_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(DateTime<Utc>),
        Millis(i64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Text(time)) => Ok(Some(time)),
        Some(Raw::Millis(ms)) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid localTime {}", ms))),
    }
}
