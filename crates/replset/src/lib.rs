//! Replica Set Membership Control
//!
//! This crate manages the membership of a primary/secondary replicated
//! document store: bootstrapping a one-member set, adding, removing and
//! replacing members, and answering health and leader questions.
//!
//! All commands go through a caller-owned [`Session`]. [`MemoryReplicaSet`]
//! provides a simulated cluster for tests and local tooling.

pub mod address;
pub mod allocator;
pub mod controller;
pub mod error;
pub mod member;
pub mod memory;
pub mod reader;
pub mod readiness;
pub mod retry;
pub mod session;
pub mod settings;
pub mod status;

pub use address::normalize_address;
pub use allocator::assign_ids;
pub use controller::ReplicaSet;
pub use error::{ReplicaSetError, Result};
pub use member::{Config, Member};
pub use memory::{MemoryOptions, MemoryReplicaSet, MemorySession};
pub use readiness::{QuorumReadiness, ReadinessCheck, SessionStatus, StatusSource};
pub use retry::{retry, Attempt, AttemptStrategy};
pub use session::{Command, ReadConsistency, Session};
pub use settings::ReplicaSetSettings;
pub use status::{IsMasterResults, MemberState, MemberStatus, Status};
