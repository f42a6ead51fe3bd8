//! Duplicate-record carry-over for offers imported into the destination.

use std::collections::HashMap;

use realist_core::{DuplicateRecord, LegacyDuplicateRecord};
use realist_storage::{OfferStore, StoreError};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DuplicateResolution {
    pub records: Vec<DuplicateRecord>,
    pub offers_with_multiple_duplicates: Vec<String>,
}

pub fn record_from_legacy_clusters(
    offer_id: &str,
    clusters: &[LegacyDuplicateRecord],
) -> Option<DuplicateRecord> {
    let cluster = clusters.first()?;
    Some(DuplicateRecord {
        id: offer_id.to_string(),
        duplicate_offer_ids: cluster
            .offer_ids
            .iter()
            .filter(|id| id.as_str() != offer_id)
            .cloned()
            .collect(),
        modified_at: cluster.modified_at,
        extra: Default::default(),
    })
}

/// Resolve the duplicate record of every offer in `offer_ids` from the source.
///
/// A current-shape record wins verbatim. Otherwise the legacy clusters are
/// searched; an offer in several clusters takes the first and is flagged.
pub async fn resolve_duplicates(
    source: &dyn OfferStore,
    offer_ids: &[String],
) -> Result<DuplicateResolution, StoreError> {
    let mut current: HashMap<String, DuplicateRecord> = source
        .find_duplicates_by_ids(offer_ids)
        .await?
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect();

    let mut resolution = DuplicateResolution::default();
    for offer_id in offer_ids {
        if let Some(record) = current.remove(offer_id) {
            resolution.records.push(record);
            continue;
        }

        let clusters = source.find_legacy_duplicates_containing(offer_id).await?;
        let Some(record) = record_from_legacy_clusters(offer_id, &clusters) else {
            continue;
        };
        if clusters.len() > 1 {
            warn!(
                offer_id = %offer_id,
                clusters = clusters.len(),
                "offer belongs to several legacy duplicate clusters; keeping the first"
            );
            resolution.offers_with_multiple_duplicates.push(offer_id.clone());
        }
        resolution.records.push(record);
    }
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use realist_storage::MemoryOfferStore;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, day, 0, 0, 0).single().unwrap()
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn cluster(id: &str, members: &[&str], day: u32) -> LegacyDuplicateRecord {
        LegacyDuplicateRecord {
            id: id.to_string(),
            offer_ids: ids(members),
            modified_at: ts(day),
        }
    }

    #[test]
    fn legacy_cluster_drops_the_offer_itself() {
        let record =
            record_from_legacy_clusters("o2", &[cluster("k", &["o1", "o2", "o3"], 4)]).unwrap();
        assert_eq!(record.id, "o2");
        assert_eq!(record.duplicate_offer_ids, ids(&["o1", "o3"]));
        assert_eq!(record.modified_at, ts(4));
    }

    #[test]
    fn no_cluster_means_no_record() {
        assert!(record_from_legacy_clusters("o2", &[]).is_none());
    }

    #[tokio::test]
    async fn current_record_takes_precedence_over_legacy() {
        let current = DuplicateRecord {
            id: "o1".into(),
            duplicate_offer_ids: ids(&["o7"]),
            modified_at: ts(9),
            extra: [("reviewedBy".to_string(), serde_json::Value::from("ops"))]
                .into_iter()
                .collect(),
        };
        let source = MemoryOfferStore::new()
            .with_duplicates([current.clone()])
            .with_legacy_duplicates([cluster("k", &["o1", "o2"], 1)]);

        let resolution = resolve_duplicates(&source, &ids(&["o1"])).await.unwrap();
        assert_eq!(resolution.records, vec![current]);
        assert!(resolution.offers_with_multiple_duplicates.is_empty());
    }

    #[tokio::test]
    async fn multiple_legacy_clusters_keep_first_and_flag_offer() {
        let source = MemoryOfferStore::new().with_legacy_duplicates([
            cluster("k2", &["o5", "o9"], 2),
            cluster("k1", &["o5", "o6"], 1),
        ]);

        let resolution = resolve_duplicates(&source, &ids(&["o5", "o8"])).await.unwrap();
        assert_eq!(resolution.records.len(), 1);
        assert_eq!(resolution.records[0].id, "o5");
        assert_eq!(resolution.records[0].duplicate_offer_ids, ids(&["o6"]));
        assert_eq!(resolution.records[0].modified_at, ts(1));
        assert_eq!(resolution.offers_with_multiple_duplicates, ids(&["o5"]));
    }
}
