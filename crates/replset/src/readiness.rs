//! Quorum health checks

use crate::error::{ReplicaSetError, Result};
use crate::reader;
use crate::retry::AttemptStrategy;
use crate::session::{ReadConsistency, Session};
use crate::status::Status;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Source of replication status snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn current_status(&self) -> Result<Status>;
}

/// Answers whether the replica set is ready
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn is_ready(&self) -> Result<bool>;
}

/// Status read over a session with monotonic consistency
pub struct SessionStatus {
    session: Arc<dyn Session>,
}

impl SessionStatus {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl StatusSource for SessionStatus {
    async fn current_status(&self) -> Result<Status> {
        reader::current_status(self.session.as_ref(), ReadConsistency::Monotonic).await
    }
}

/// Majority-health readiness over a [`StatusSource`]
pub struct QuorumReadiness {
    source: Arc<dyn StatusSource>,
}

impl QuorumReadiness {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ReadinessCheck for QuorumReadiness {
    async fn is_ready(&self) -> Result<bool> {
        is_ready(self.source.as_ref()).await
    }
}

/// Strictly more than half of the members report healthy.
///
/// An empty member list is never ready.
pub fn has_healthy_majority(status: &Status) -> bool {
    let majority = status.members.len() / 2 + 1;
    status.healthy_count() >= majority
}

/// Fetch status and evaluate [`has_healthy_majority`].
///
/// Connection-class failures mean an election is probably in progress and
/// are reported as "not ready" rather than as an error.
pub async fn is_ready(source: &dyn StatusSource) -> Result<bool> {
    match source.current_status().await {
        Ok(status) => {
            let ready = has_healthy_majority(&status);
            tracing::debug!(
                "Replica set {} has {}/{} healthy members, ready: {}",
                status.name,
                status.healthy_count(),
                status.members.len(),
                ready
            );
            Ok(ready)
        }
        Err(err) if err.is_connection_error() => {
            tracing::debug!("Replica set not ready, connection unavailable: {}", err);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Poll `check` every `poll_interval` until it reports ready.
///
/// A check error is returned immediately. A zero `timeout_secs` still makes
/// one attempt.
pub async fn wait_until_ready(
    check: &dyn ReadinessCheck,
    timeout_secs: u64,
    poll_interval: Duration,
) -> Result<()> {
    let strategy = AttemptStrategy::new(Duration::from_secs(timeout_secs), poll_interval);
    let mut attempt = strategy.start();
    while attempt.next().await {
        if check.is_ready().await? {
            tracing::info!(
                "Replica set ready after {} checks in {:?}",
                attempt.count(),
                attempt.elapsed()
            );
            return Ok(());
        }
    }
    Err(ReplicaSetError::timeout(timeout_secs))
}
