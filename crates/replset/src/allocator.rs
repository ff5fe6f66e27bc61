//! Member id assignment
//!
//! Ids are resolved in three passes over the desired list:
//! 1. a member whose address already exists takes the existing id,
//! 2. an explicit id on a new member is kept,
//! 3. the remaining members get `max(id in use) + 1`, in list order.
//!
//! The output keeps the order of the desired list.

use crate::error::{ReplicaSetError, Result};
use crate::member::Member;
use std::collections::{HashMap, HashSet};

/// Reject a member list that names the same address twice.
pub fn ensure_unique_addresses(members: &[Member]) -> Result<()> {
    let mut seen = HashSet::new();
    for member in members {
        if !seen.insert(member.address.as_str()) {
            return Err(ReplicaSetError::validation(format!(
                "duplicate member address {}",
                member.address
            )));
        }
    }
    Ok(())
}

/// Resolve ids for `desired` against the members of the current config.
pub fn assign_ids(existing: &[Member], desired: Vec<Member>) -> Result<Vec<Member>> {
    ensure_unique_addresses(&desired)?;

    let existing_ids: HashMap<&str, u32> = existing
        .iter()
        .map(|m| (m.address.as_str(), m.id))
        .collect();

    let mut resolved: Vec<Option<u32>> = vec![None; desired.len()];
    let mut taken = HashSet::new();

    for (slot, member) in resolved.iter_mut().zip(&desired) {
        if let Some(&id) = existing_ids.get(member.address.as_str()) {
            if member.has_id() && member.id != id {
                tracing::debug!(
                    "Ignoring id {} for existing member {}, keeping {}",
                    member.id,
                    member.address,
                    id
                );
            }
            *slot = Some(id);
            taken.insert(id);
        }
    }

    for (slot, member) in resolved.iter_mut().zip(&desired) {
        if slot.is_some() || !member.has_id() {
            continue;
        }
        if !taken.insert(member.id) {
            return Err(ReplicaSetError::validation(format!(
                "member {} requests id {} which is already in use",
                member.address, member.id
            )));
        }
        *slot = Some(member.id);
    }

    let mut max = existing
        .iter()
        .map(|m| m.id)
        .chain(taken.iter().copied())
        .max()
        .unwrap_or(0);

    Ok(desired
        .into_iter()
        .zip(resolved)
        .map(|(mut member, slot)| {
            member.id = slot.unwrap_or_else(|| {
                max += 1;
                max
            });
            member
        })
        .collect())
}
