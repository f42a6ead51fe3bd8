//! Version-history merge for offers matched by natural key.
//!
//! The source offer's history is the base; the destination offer's history is
//! appended after it with every version number shifted by the history offset.
//! The destination keeps its own id and natural key and its current payload.

use realist_core::{Offer, OfferVersionsPatch, VersionedBlock};

use crate::ReconcileError;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// `createdAt` already equals the source's: a previous run merged it.
    AlreadyMerged,
    Update(OfferVersionsPatch),
}

pub fn history_offset(source: &Offer) -> u64 {
    source.meta_history.len() as u64
}

pub fn merge_offer_versions(
    source: &Offer,
    destination: &Offer,
) -> Result<MergeDecision, ReconcileError> {
    if source.natural_key() != destination.natural_key() {
        return Err(ReconcileError::NaturalKeyConflict {
            key: destination.natural_key(),
            ids: vec![destination.id.clone(), source.id.clone()],
        });
    }
    if source.created_at == destination.created_at {
        return Ok(MergeDecision::AlreadyMerged);
    }

    let offset = history_offset(source);
    let data_history = concat_history(&source.data_history, &destination.data_history, offset);
    let meta_history = concat_history(&source.meta_history, &destination.meta_history, offset);
    let data = current_block(&destination.data, &data_history, offset);
    let meta = current_block(&destination.meta, &meta_history, offset);

    Ok(MergeDecision::Update(OfferVersionsPatch {
        created_at: source.created_at,
        data,
        meta,
        data_history,
        meta_history,
    }))
}

fn concat_history(
    base: &[VersionedBlock],
    appended: &[VersionedBlock],
    offset: u64,
) -> Vec<VersionedBlock> {
    base.iter()
        .cloned()
        .chain(appended.iter().map(|block| block.renumbered(offset)))
        .collect()
}

fn current_block(
    current: &VersionedBlock,
    merged_history: &[VersionedBlock],
    offset: u64,
) -> VersionedBlock {
    if merged_history.is_empty() {
        let mut block = current.clone();
        block.version_number = 0;
        block
    } else {
        current.renumbered(offset)
    }
}
