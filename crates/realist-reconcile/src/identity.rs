//! Classifies a batch of source candidates against the destination.

use std::collections::{HashMap, HashSet};

use realist_core::{NaturalKey, OfferIdentity};
use realist_storage::OfferStore;
use tracing::{debug, info};

use crate::ReconcileError;

/// A source candidate whose natural key already exists in the destination
/// under another id. The destination offer is the one updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTarget {
    pub candidate: OfferIdentity,
    pub destination: OfferIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityPartition {
    pub already_present: Vec<OfferIdentity>,
    pub merge_targets: Vec<MergeTarget>,
    pub new: Vec<OfferIdentity>,
}

pub async fn classify_candidates(
    destination: &dyn OfferStore,
    candidates: &[OfferIdentity],
) -> Result<IdentityPartition, ReconcileError> {
    let mut partition = IdentityPartition::default();
    if candidates.is_empty() {
        return Ok(partition);
    }

    let candidate_ids = candidates.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
    let present: HashSet<String> = destination
        .find_identities_by_ids(&candidate_ids)
        .await?
        .into_iter()
        .map(|offer| offer.id)
        .collect();

    let mut remaining = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if present.contains(&candidate.id) {
            partition.already_present.push(candidate.clone());
        } else {
            remaining.push(candidate);
        }
    }
    info!(
        to_import = remaining.len(),
        candidates = candidates.len(),
        "after removing offers present by id"
    );
    if remaining.is_empty() {
        return Ok(partition);
    }

    let mut by_key: HashMap<NaturalKey, &OfferIdentity> = HashMap::with_capacity(remaining.len());
    for &candidate in &remaining {
        if let Some(previous) = by_key.insert(candidate.natural_key(), candidate) {
            return Err(ReconcileError::NaturalKeyConflict {
                key: candidate.natural_key(),
                ids: vec![previous.id.clone(), candidate.id.clone()],
            });
        }
    }

    let keys = by_key.keys().cloned().collect::<Vec<_>>();
    let mut matched: HashMap<NaturalKey, OfferIdentity> = HashMap::new();
    for existing in destination.find_identities_by_natural_keys(&keys).await? {
        let key = existing.natural_key();
        if !by_key.contains_key(&key) {
            debug!(
                offer_id = %existing.id,
                natural_key = %key,
                "ignoring unrequested natural-key match"
            );
            continue;
        }
        if let Some(previous) = matched.insert(key.clone(), existing) {
            return Err(ReconcileError::NaturalKeyConflict {
                ids: vec![previous.id, matched[&key].id.clone()],
                key,
            });
        }
    }

    for candidate in remaining {
        match matched.remove(&candidate.natural_key()) {
            Some(existing) => partition.merge_targets.push(MergeTarget {
                candidate: candidate.clone(),
                destination: existing,
            }),
            None => partition.new.push(candidate.clone()),
        }
    }
    info!(
        to_import = partition.new.len(),
        to_merge = partition.merge_targets.len(),
        candidates = candidates.len(),
        "after removing offers matched by natural key"
    );
    Ok(partition)
}
