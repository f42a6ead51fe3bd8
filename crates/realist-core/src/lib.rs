//! Offer documents, duplicate records and the migration checkpoint shared by the
//! reconciliation crates.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "realist-core";

/// Cursor used when neither a checkpoint nor a configured `fromId` exists.
pub const DEFAULT_FROM_ID: &str = "000000000000000";

/// `(siteId, localUniqueId)`: identifies one real-world listing across stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NaturalKey {
    pub site_id: String,
    pub local_unique_id: String,
}

impl NaturalKey {
    pub fn new(site_id: impl Into<String>, local_unique_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            local_unique_id: local_unique_id.into(),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.site_id, self.local_unique_id)
    }
}

/// One payload snapshot (`data`, `meta` or an entry of their histories).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedBlock {
    #[serde(rename = "versionNumber")]
    pub version_number: u64,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl VersionedBlock {
    pub fn new(version_number: u64) -> Self {
        Self {
            version_number,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn renumbered(&self, offset: u64) -> Self {
        Self {
            version_number: self.version_number + offset,
            fields: self.fields.clone(),
        }
    }

    pub fn into_json(self) -> JsonValue {
        let mut fields = self.fields;
        fields.insert("versionNumber".to_string(), self.version_number.into());
        JsonValue::Object(fields)
    }
}

/// Versioned view of an offer, decoded only for a history merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    #[serde(rename = "_id")]
    pub id: String,
    pub site_id: String,
    pub local_unique_id: String,
    pub created_at: DateTime<Utc>,
    pub data: VersionedBlock,
    pub meta: VersionedBlock,
    #[serde(default)]
    pub data_history: Vec<VersionedBlock>,
    #[serde(default)]
    pub meta_history: Vec<VersionedBlock>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Offer {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.site_id.clone(), self.local_unique_id.clone())
    }

    pub fn identity(&self) -> OfferIdentity {
        OfferIdentity {
            id: self.id.clone(),
            site_id: self.site_id.clone(),
            local_unique_id: self.local_unique_id.clone(),
        }
    }
}

/// An offer exactly as stored. Only the identity keys are interpreted, so
/// imports copy the rest of the document untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub site_id: String,
    pub local_unique_id: String,
    #[serde(flatten)]
    pub body: Map<String, JsonValue>,
}

impl OfferDocument {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.site_id.clone(), self.local_unique_id.clone())
    }

    pub fn identity(&self) -> OfferIdentity {
        OfferIdentity::new(
            self.id.clone(),
            self.site_id.clone(),
            self.local_unique_id.clone(),
        )
    }

    pub fn to_offer(&self) -> Result<Offer, serde_json::Error> {
        serde_json::to_value(self).and_then(serde_json::from_value)
    }

    /// Overwrites the five versioned keys, leaving every other key as stored.
    pub fn apply_versions(&mut self, patch: &OfferVersionsPatch) -> Result<(), serde_json::Error> {
        if let JsonValue::Object(fields) = serde_json::to_value(patch)? {
            self.body.extend(fields);
        }
        Ok(())
    }
}

fn history_json(history: Vec<VersionedBlock>) -> JsonValue {
    JsonValue::Array(history.into_iter().map(VersionedBlock::into_json).collect())
}

impl From<Offer> for OfferDocument {
    fn from(offer: Offer) -> Self {
        let mut body = offer.extra;
        body.insert(
            "createdAt".to_string(),
            JsonValue::String(offer.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        body.insert("data".to_string(), offer.data.into_json());
        body.insert("meta".to_string(), offer.meta.into_json());
        body.insert("dataHistory".to_string(), history_json(offer.data_history));
        body.insert("metaHistory".to_string(), history_json(offer.meta_history));
        Self {
            id: offer.id,
            site_id: offer.site_id,
            local_unique_id: offer.local_unique_id,
            body,
        }
    }
}

/// Identity projection of an offer: `_id` plus its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferIdentity {
    #[serde(rename = "_id")]
    pub id: String,
    pub site_id: String,
    pub local_unique_id: String,
}

impl OfferIdentity {
    pub fn new(
        id: impl Into<String>,
        site_id: impl Into<String>,
        local_unique_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            site_id: site_id.into(),
            local_unique_id: local_unique_id.into(),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.site_id.clone(), self.local_unique_id.clone())
    }
}

/// The five fields a history merge rewrites on the destination offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferVersionsPatch {
    pub created_at: DateTime<Utc>,
    pub data: VersionedBlock,
    pub meta: VersionedBlock,
    pub data_history: Vec<VersionedBlock>,
    pub meta_history: Vec<VersionedBlock>,
}

/// Current-shape duplicate record (`offerDuplicatesV2`), keyed by offer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub duplicate_offer_ids: Vec<String>,
    pub modified_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Legacy duplicate cluster (`offerDuplicates`), matched by membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDuplicateRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub offer_ids: Vec<String>,
    pub modified_at: DateTime<Utc>,
}

impl LegacyDuplicateRecord {
    pub fn contains(&self, offer_id: &str) -> bool {
        self.offer_ids.iter().any(|id| id == offer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    /// Exclusive lower bound for the next candidate fetch.
    pub from_id: String,
    pub processed_offers: u64,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub offers_with_multiple_duplicates: Vec<String>,
}

impl MigrationState {
    pub fn initial(
        from_id: Option<String>,
        processed_offers: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            from_id: from_id.unwrap_or_else(|| DEFAULT_FROM_ID.to_string()),
            processed_offers: processed_offers.unwrap_or(0),
            modified_at: now,
            offers_with_multiple_duplicates: Vec::new(),
        }
    }

    /// State after a fully committed batch that ended at `last_id`.
    pub fn advanced(
        &self,
        last_id: &str,
        candidates: u64,
        offers_with_multiple_duplicates: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        let mut flagged = self.offers_with_multiple_duplicates.clone();
        for id in offers_with_multiple_duplicates {
            if !flagged.contains(id) {
                flagged.push(id.clone());
            }
        }
        Self {
            from_id: last_id.to_string(),
            processed_offers: self.processed_offers + candidates,
            modified_at: now,
            offers_with_multiple_duplicates: flagged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn offer_document_keeps_unknown_keys() {
        let raw = serde_json::json!({
            "_id": "5a1b",
            "siteId": "sreality",
            "localUniqueId": "991",
            "createdAt": "2024-03-01T10:00:00Z",
            "data": { "versionNumber": 2, "price": 1200 },
            "meta": { "versionNumber": 2, "active": true },
            "metaHistory": [{ "versionNumber": 0 }, { "versionNumber": 1 }],
            "url": "https://example.test/991"
        });

        let offer: Offer = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(offer.id, "5a1b");
        assert_eq!(offer.natural_key(), NaturalKey::new("sreality", "991"));
        assert!(offer.data_history.is_empty());
        assert_eq!(offer.meta_history.len(), 2);
        assert_eq!(offer.data.fields["price"], 1200);
        assert_eq!(offer.extra["url"], "https://example.test/991");

        let back = serde_json::to_value(&offer).unwrap();
        assert_eq!(back["url"], raw["url"]);
        assert_eq!(back["data"], raw["data"]);
        assert_eq!(back["_id"], "5a1b");
    }

    #[test]
    fn stored_document_without_versioned_blocks_is_kept_whole() {
        let raw = serde_json::json!({
            "_id": "7c",
            "siteId": "bezrealitky",
            "localUniqueId": "12",
            "createdAt": "2024-03-01T10:00:00Z",
            "meta": { "versionNumber": 0 },
            "url": "https://example.test/12"
        });

        let doc: OfferDocument = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.natural_key(), NaturalKey::new("bezrealitky", "12"));
        assert!(doc.to_offer().is_err());
        assert_eq!(serde_json::to_value(&doc).unwrap(), raw);
    }

    #[test]
    fn offer_converts_to_a_document_that_decodes_back() {
        let offer = Offer {
            id: "o1".into(),
            site_id: "sreality".into(),
            local_unique_id: "5".into(),
            created_at: ts(4),
            data: VersionedBlock::new(1).with_field("price", 10),
            meta: VersionedBlock::new(1),
            data_history: vec![VersionedBlock::new(0).with_field("price", 9)],
            meta_history: vec![VersionedBlock::new(0)],
            extra: Map::from_iter([("url".to_string(), JsonValue::from("u"))]),
        };

        let doc = OfferDocument::from(offer.clone());
        assert_eq!(doc.body["createdAt"], "2024-03-01T04:00:00Z");
        assert_eq!(doc.to_offer().unwrap(), offer);
    }

    #[test]
    fn applying_versions_keeps_unrelated_keys() {
        let mut doc: OfferDocument = serde_json::from_value(serde_json::json!({
            "_id": "d1",
            "siteId": "s",
            "localUniqueId": "1",
            "createdAt": "2024-03-01T10:00:00Z",
            "data": { "versionNumber": 0 },
            "meta": { "versionNumber": 0 },
            "images": ["a.jpg"]
        }))
        .unwrap();
        let patch = OfferVersionsPatch {
            created_at: ts(2),
            data: VersionedBlock::new(3),
            meta: VersionedBlock::new(3),
            data_history: vec![VersionedBlock::new(0)],
            meta_history: vec![VersionedBlock::new(0)],
        };

        doc.apply_versions(&patch).unwrap();
        assert_eq!(doc.body["images"][0], "a.jpg");
        assert_eq!(doc.to_offer().unwrap().data.version_number, 3);
        assert_eq!(doc.to_offer().unwrap().created_at, ts(2));
    }

    #[test]
    fn duplicate_record_keeps_unknown_keys() {
        let raw = serde_json::json!({
            "_id": "o1",
            "duplicateOfferIds": ["o2"],
            "modifiedAt": "2024-03-01T10:00:00Z",
            "source": "manual"
        });
        let record: DuplicateRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.extra["source"], "manual");
        assert_eq!(serde_json::to_value(&record).unwrap(), raw);
    }

    #[test]
    fn initial_state_uses_defaults() {
        let state = MigrationState::initial(None, None, ts(1));
        assert_eq!(state.from_id, DEFAULT_FROM_ID);
        assert_eq!(state.processed_offers, 0);
        assert!(state.offers_with_multiple_duplicates.is_empty());
    }

    #[test]
    fn advancing_folds_flagged_offers_once() {
        let state = MigrationState::initial(Some("a".into()), Some(10), ts(1));
        let next = state.advanced("c", 3, &["b".to_string()], ts(2));
        let next = next.advanced("f", 2, &["b".to_string(), "e".to_string()], ts(3));

        assert_eq!(next.from_id, "f");
        assert_eq!(next.processed_offers, 15);
        assert_eq!(next.modified_at, ts(3));
        assert_eq!(next.offers_with_multiple_duplicates, vec!["b", "e"]);
    }

    #[test]
    fn checkpoint_uses_camel_case_keys() {
        let state = MigrationState::initial(Some("abc".into()), Some(4), ts(5));
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["fromId"], "abc");
        assert_eq!(value["processedOffers"], 4);
        assert!(value["offersWithMultipleDuplicates"].is_array());
    }
}
