//! Document store and checkpoint collaborators for offer reconciliation.
//!
//! Both sides of a migration (the scraped source and the merged destination)
//! are reached through [`OfferStore`]. The PostgreSQL adapter keeps every
//! document as `jsonb`; the in-memory adapter backs tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use realist_core::{
    DuplicateRecord, LegacyDuplicateRecord, MigrationState, NaturalKey, Offer, OfferDocument,
    OfferIdentity, OfferVersionsPatch,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "realist-storage";

pub const OFFERS: &str = "offers";
pub const DUPLICATES: &str = "offerDuplicatesV2";
pub const LEGACY_DUPLICATES: &str = "offerDuplicates";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document {collection}/{id} does not match the offer schema: {source}")]
    Document {
        collection: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("document {collection}/{id} not found")]
    NotFound { collection: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("checkpoint I/O failed for {path}: {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint encoding failed: {0}")]
    CheckpointEncoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Database(err) => classify_sqlx_error(err),
            Self::Unavailable(_) => RetryDisposition::Retryable,
            Self::CheckpointIo { source, .. } => classify_io_error(source),
            Self::Document { .. } | Self::NotFound { .. } | Self::CheckpointEncoding(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
            RetryDisposition::Retryable
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code)
                if code.starts_with("08") || matches!(code, "40001" | "40P01" | "57P01") =>
            {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

fn classify_io_error(err: &std::io::Error) -> RetryDisposition {
    match err.kind() {
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[async_trait]
pub trait OfferStore: Send + Sync {
    /// Identities with `id > after_id` in byte order of `id`, at most `limit`.
    async fn find_identities_after(
        &self,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<OfferIdentity>, StoreError>;

    async fn find_identities_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<OfferIdentity>, StoreError>;

    async fn find_identities_by_natural_keys(
        &self,
        keys: &[NaturalKey],
    ) -> Result<Vec<OfferIdentity>, StoreError>;

    /// Stored documents, undecoded, for a verbatim copy.
    async fn find_offer_documents_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<OfferDocument>, StoreError>;

    async fn find_offer_by_id(&self, id: &str) -> Result<Option<Offer>, StoreError>;

    async fn find_offer_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<Offer>, StoreError>;

    async fn find_duplicates_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<DuplicateRecord>, StoreError>;

    /// Legacy clusters whose `offerIds` contain `offer_id`, ascending by cluster id.
    async fn find_legacy_duplicates_containing(
        &self,
        offer_id: &str,
    ) -> Result<Vec<LegacyDuplicateRecord>, StoreError>;

    // Inserts skip ids already present and return how many were written.
    async fn insert_offers(&self, offers: &[OfferDocument]) -> Result<usize, StoreError>;

    async fn insert_duplicates(&self, records: &[DuplicateRecord]) -> Result<usize, StoreError>;

    async fn update_offer_versions(
        &self,
        id: &str,
        patch: &OfferVersionsPatch,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryCollections {
    offers: BTreeMap<String, OfferDocument>,
    duplicates: BTreeMap<String, DuplicateRecord>,
    legacy_duplicates: BTreeMap<String, LegacyDuplicateRecord>,
    writes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryOfferStore {
    state: Mutex<MemoryCollections>,
}

impl MemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offers<D>(mut self, offers: impl IntoIterator<Item = D>) -> Self
    where
        D: Into<OfferDocument>,
    {
        let state = self.state.get_mut();
        for offer in offers {
            let doc = offer.into();
            state.offers.insert(doc.id.clone(), doc);
        }
        self
    }

    pub fn with_duplicates(mut self, records: impl IntoIterator<Item = DuplicateRecord>) -> Self {
        let state = self.state.get_mut();
        for record in records {
            state.duplicates.insert(record.id.clone(), record);
        }
        self
    }

    pub fn with_legacy_duplicates(
        mut self,
        records: impl IntoIterator<Item = LegacyDuplicateRecord>,
    ) -> Self {
        let state = self.state.get_mut();
        for record in records {
            state.legacy_duplicates.insert(record.id.clone(), record);
        }
        self
    }

    pub async fn offer(&self, id: &str) -> Option<Offer> {
        let state = self.state.lock().await;
        state.offers.get(id).and_then(|doc| doc.to_offer().ok())
    }

    pub async fn document(&self, id: &str) -> Option<OfferDocument> {
        self.state.lock().await.offers.get(id).cloned()
    }

    pub async fn duplicate(&self, id: &str) -> Option<DuplicateRecord> {
        self.state.lock().await.duplicates.get(id).cloned()
    }

    pub async fn offer_count(&self) -> usize {
        self.state.lock().await.offers.len()
    }

    pub async fn duplicate_count(&self) -> usize {
        self.state.lock().await.duplicates.len()
    }

    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl OfferStore for MemoryOfferStore {
    async fn find_identities_after(
        &self,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<OfferIdentity>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .offers
            .values()
            .filter(|offer| offer.id.as_str() > after_id)
            .take(limit)
            .map(OfferDocument::identity)
            .collect())
    }

    async fn find_identities_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<OfferIdentity>, StoreError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.offers.get(id))
            .map(OfferDocument::identity)
            .collect())
    }

    async fn find_identities_by_natural_keys(
        &self,
        keys: &[NaturalKey],
    ) -> Result<Vec<OfferIdentity>, StoreError> {
        let wanted: HashSet<&NaturalKey> = keys.iter().collect();
        let state = self.state.lock().await;
        Ok(state
            .offers
            .values()
            .filter(|offer| wanted.contains(&offer.natural_key()))
            .map(OfferDocument::identity)
            .collect())
    }

    async fn find_offer_documents_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<OfferDocument>, StoreError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        Ok(state
            .offers
            .values()
            .filter(|offer| wanted.contains(offer.id.as_str()))
            .cloned()
            .collect())
    }

    async fn find_offer_by_id(&self, id: &str) -> Result<Option<Offer>, StoreError> {
        let state = self.state.lock().await;
        state.offers.get(id).map(decode_offer).transpose()
    }

    async fn find_offer_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<Offer>, StoreError> {
        let state = self.state.lock().await;
        state
            .offers
            .values()
            .find(|offer| offer.natural_key() == *key)
            .map(decode_offer)
            .transpose()
    }

    async fn find_duplicates_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<DuplicateRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.duplicates.get(id))
            .cloned()
            .collect())
    }

    async fn find_legacy_duplicates_containing(
        &self,
        offer_id: &str,
    ) -> Result<Vec<LegacyDuplicateRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .legacy_duplicates
            .values()
            .filter(|record| record.contains(offer_id))
            .cloned()
            .collect())
    }

    async fn insert_offers(&self, offers: &[OfferDocument]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for offer in offers {
            if state.offers.contains_key(&offer.id) {
                continue;
            }
            state.offers.insert(offer.id.clone(), offer.clone());
            inserted += 1;
        }
        state.writes += inserted;
        Ok(inserted)
    }

    async fn insert_duplicates(&self, records: &[DuplicateRecord]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for record in records {
            if state.duplicates.contains_key(&record.id) {
                continue;
            }
            state.duplicates.insert(record.id.clone(), record.clone());
            inserted += 1;
        }
        state.writes += inserted;
        Ok(inserted)
    }

    async fn update_offer_versions(
        &self,
        id: &str,
        patch: &OfferVersionsPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let offer = state.offers.get_mut(id).ok_or_else(|| StoreError::NotFound {
            collection: OFFERS,
            id: id.to_string(),
        })?;
        offer
            .apply_versions(patch)
            .map_err(|source| StoreError::Document {
                collection: OFFERS,
                id: id.to_string(),
                source,
            })?;
        state.writes += 1;
        Ok(())
    }
}

fn decode_offer(doc: &OfferDocument) -> Result<Offer, StoreError> {
    doc.to_offer().map_err(|source| StoreError::Document {
        collection: OFFERS,
        id: doc.id.clone(),
        source,
    })
}

const SCHEMA_STATEMENTS: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS offers (
        id TEXT PRIMARY KEY,
        site_id TEXT NOT NULL,
        local_unique_id TEXT NOT NULL,
        doc JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS offers_natural_key_idx
        ON offers (site_id, local_unique_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offer_duplicates_v2 (
        id TEXT PRIMARY KEY,
        doc JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS offer_duplicates (
        id TEXT PRIMARY KEY,
        doc JSONB NOT NULL
    )
    "#,
];

/// Ids compare with `COLLATE "C"` so paging matches the in-memory byte order
/// whatever the database default collation is.
#[derive(Debug, Clone)]
pub struct PgOfferStore {
    pool: PgPool,
}

impl PgOfferStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("offer store schema ready");
        Ok(())
    }
}

fn identity_from_row(row: &PgRow) -> Result<OfferIdentity, StoreError> {
    Ok(OfferIdentity {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        local_unique_id: row.try_get("local_unique_id")?,
    })
}

fn decode_row<T: serde::de::DeserializeOwned>(
    collection: &'static str,
    row: &PgRow,
) -> Result<T, StoreError> {
    let id: String = row.try_get("id")?;
    let doc: JsonValue = row.try_get("doc")?;
    serde_json::from_value(doc).map_err(|source| StoreError::Document {
        collection,
        id,
        source,
    })
}

fn encode_document<T: serde::Serialize>(
    collection: &'static str,
    id: &str,
    doc: &T,
) -> Result<JsonValue, StoreError> {
    serde_json::to_value(doc).map_err(|source| StoreError::Document {
        collection,
        id: id.to_string(),
        source,
    })
}

#[async_trait]
impl OfferStore for PgOfferStore {
    async fn find_identities_after(
        &self,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<OfferIdentity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, site_id, local_unique_id
              FROM offers
             WHERE id COLLATE "C" > $1
             ORDER BY id COLLATE "C"
             LIMIT $2
            "#,
        )
        .bind(after_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(identity_from_row).collect()
    }

    async fn find_identities_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<OfferIdentity>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, site_id, local_unique_id
              FROM offers
             WHERE id = ANY($1)
             ORDER BY id COLLATE "C"
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(identity_from_row).collect()
    }

    async fn find_identities_by_natural_keys(
        &self,
        keys: &[NaturalKey],
    ) -> Result<Vec<OfferIdentity>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let site_ids = keys.iter().map(|k| k.site_id.clone()).collect::<Vec<_>>();
        let local_ids = keys
            .iter()
            .map(|k| k.local_unique_id.clone())
            .collect::<Vec<_>>();
        let rows = sqlx::query(
            r#"
            SELECT id, site_id, local_unique_id
              FROM offers
             WHERE (site_id, local_unique_id) IN (
                   SELECT * FROM UNNEST($1::text[], $2::text[])
             )
             ORDER BY id COLLATE "C"
            "#,
        )
        .bind(site_ids)
        .bind(local_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(identity_from_row).collect()
    }

    async fn find_offer_documents_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<OfferDocument>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"SELECT id, doc FROM offers WHERE id = ANY($1) ORDER BY id COLLATE "C""#,
        )
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| decode_row(OFFERS, row)).collect()
    }

    async fn find_offer_by_id(&self, id: &str) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query("SELECT id, doc FROM offers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|row| decode_row(OFFERS, row)).transpose()
    }

    async fn find_offer_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, doc
              FROM offers
             WHERE site_id = $1 AND local_unique_id = $2
             ORDER BY id COLLATE "C"
             LIMIT 1
            "#,
        )
        .bind(&key.site_id)
        .bind(&key.local_unique_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(|row| decode_row(OFFERS, row)).transpose()
    }

    async fn find_duplicates_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<DuplicateRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, doc
              FROM offer_duplicates_v2
             WHERE id = ANY($1)
             ORDER BY id COLLATE "C"
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode_row(DUPLICATES, row)).collect()
    }

    async fn find_legacy_duplicates_containing(
        &self,
        offer_id: &str,
    ) -> Result<Vec<LegacyDuplicateRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, doc
              FROM offer_duplicates
             WHERE doc -> 'offerIds' @> jsonb_build_array($1::text)
             ORDER BY id COLLATE "C"
            "#,
        )
        .bind(offer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode_row(LEGACY_DUPLICATES, row)).collect()
    }

    async fn insert_offers(&self, offers: &[OfferDocument]) -> Result<usize, StoreError> {
        if offers.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for offer in offers {
            let doc = encode_document(OFFERS, &offer.id, offer)?;
            inserted += sqlx::query(
                r#"
                INSERT INTO offers (id, site_id, local_unique_id, doc)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&offer.id)
            .bind(&offer.site_id)
            .bind(&offer.local_unique_id)
            .bind(doc)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        debug!(requested = offers.len(), inserted, "inserted offers");
        Ok(inserted as usize)
    }

    async fn insert_duplicates(&self, records: &[DuplicateRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            let doc = encode_document(DUPLICATES, &record.id, record)?;
            inserted += sqlx::query(
                r#"
                INSERT INTO offer_duplicates_v2 (id, doc)
                VALUES ($1, $2)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&record.id)
            .bind(doc)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        debug!(requested = records.len(), inserted, "inserted duplicate records");
        Ok(inserted as usize)
    }

    async fn update_offer_versions(
        &self,
        id: &str,
        patch: &OfferVersionsPatch,
    ) -> Result<(), StoreError> {
        let patch = encode_document(OFFERS, id, patch)?;
        let result = sqlx::query("UPDATE offers SET doc = doc || $2 WHERE id = $1")
            .bind(id)
            .bind(patch)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                collection: OFFERS,
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<MigrationState>, StoreError>;
    async fn save(&self, state: &MigrationState) -> Result<(), StoreError>;
}

/// Checkpoint kept as a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::CheckpointIo {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<MigrationState>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(err)),
        }
    }

    async fn save(&self, state: &MigrationState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| self.io_error(err))?;

        let temp_path = parent.join(format!(".{}.checkpoint.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| self.io_error(err))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(err));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryCheckpoint {
    state: Option<MigrationState>,
    saves: usize,
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryCheckpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MigrationState) -> Self {
        Self {
            inner: Mutex::new(MemoryCheckpoint {
                state: Some(state),
                saves: 0,
            }),
        }
    }

    pub async fn save_count(&self) -> usize {
        self.inner.lock().await.saves
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<MigrationState>, StoreError> {
        Ok(self.inner.lock().await.state.clone())
    }

    async fn save(&self, state: &MigrationState) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state = Some(state.clone());
        inner.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use realist_core::VersionedBlock;
    use tempfile::tempdir;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 9, minute, 0).single().unwrap()
    }

    fn offer(id: &str, site: &str, local: &str) -> Offer {
        Offer {
            id: id.to_string(),
            site_id: site.to_string(),
            local_unique_id: local.to_string(),
            created_at: ts(0),
            data: VersionedBlock::new(0),
            meta: VersionedBlock::new(0),
            data_history: vec![],
            meta_history: vec![],
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn memory_store_pages_by_exclusive_cursor() {
        let store = MemoryOfferStore::new().with_offers([
            offer("003", "s", "3"),
            offer("001", "s", "1"),
            offer("002", "s", "2"),
        ]);

        let page = store.find_identities_after("001", 10).await.unwrap();
        let ids = page.iter().map(|o| o.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["002", "003"]);

        let page = store.find_identities_after("000", 1).await.unwrap();
        assert_eq!(page[0].id, "001");
    }

    #[tokio::test]
    async fn memory_store_matches_natural_keys_in_one_query() {
        let store = MemoryOfferStore::new().with_offers([
            offer("a", "bezrealitky", "10"),
            offer("b", "sreality", "10"),
            offer("c", "sreality", "11"),
        ]);

        let found = store
            .find_identities_by_natural_keys(&[
                NaturalKey::new("sreality", "10"),
                NaturalKey::new("sreality", "99"),
            ])
            .await
            .unwrap();
        assert_eq!(found, vec![OfferIdentity::new("b", "sreality", "10")]);
    }

    #[tokio::test]
    async fn memory_inserts_skip_existing_ids() {
        let store = MemoryOfferStore::new().with_offers([offer("a", "s", "1")]);
        let inserted = store
            .insert_offers(&[offer("a", "s", "1").into(), offer("b", "s", "2").into()])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.offer_count().await, 2);
        assert_eq!(store.write_count().await, 1);
    }

    #[tokio::test]
    async fn memory_update_rewrites_versions_and_keeps_other_keys() {
        let mut stored = offer("a", "s", "1");
        stored.extra.insert("url".into(), "https://example.test/a".into());
        let store = MemoryOfferStore::new().with_offers([stored]);
        let patch = OfferVersionsPatch {
            created_at: ts(7),
            data: VersionedBlock::new(2),
            meta: VersionedBlock::new(2),
            data_history: vec![VersionedBlock::new(0), VersionedBlock::new(1)],
            meta_history: vec![VersionedBlock::new(0), VersionedBlock::new(1)],
        };

        store.update_offer_versions("a", &patch).await.unwrap();

        let updated = store.offer("a").await.unwrap();
        assert_eq!(updated.created_at, ts(7));
        assert_eq!(updated.meta_history.len(), 2);
        assert_eq!(updated.extra["url"], "https://example.test/a");
        assert_eq!(store.write_count().await, 1);
    }

    #[tokio::test]
    async fn undecodable_offer_fails_the_merge_read_but_not_the_raw_read() {
        let raw: OfferDocument = serde_json::from_value(serde_json::json!({
            "_id": "r1",
            "siteId": "s",
            "localUniqueId": "1",
            "url": "https://example.test/r1"
        }))
        .unwrap();
        let store = MemoryOfferStore::new().with_offers([raw.clone()]);

        let docs = store.find_offer_documents_by_ids(&["r1".to_string()]).await.unwrap();
        assert_eq!(docs, vec![raw]);

        let err = store.find_offer_by_id("r1").await.unwrap_err();
        assert!(matches!(err, StoreError::Document { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn memory_update_of_missing_offer_is_not_found() {
        let store = MemoryOfferStore::new();
        let patch = OfferVersionsPatch {
            created_at: ts(1),
            data: VersionedBlock::new(0),
            meta: VersionedBlock::new(0),
            data_history: vec![],
            meta_history: vec![],
        };
        let err = store.update_offer_versions("zzz", &patch).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn legacy_clusters_come_back_in_id_order() {
        let store = MemoryOfferStore::new().with_legacy_duplicates([
            LegacyDuplicateRecord {
                id: "k2".into(),
                offer_ids: vec!["x".into(), "y".into()],
                modified_at: ts(2),
            },
            LegacyDuplicateRecord {
                id: "k1".into(),
                offer_ids: vec!["x".into(), "z".into()],
                modified_at: ts(1),
            },
            LegacyDuplicateRecord {
                id: "k3".into(),
                offer_ids: vec!["q".into()],
                modified_at: ts(3),
            },
        ]);

        let clusters = store.find_legacy_duplicates_containing("x").await.unwrap();
        let ids = clusters.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn file_checkpoint_round_trips_and_replaces_atomically() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path().join("state/migration_state.json"));
        assert!(store.load().await.unwrap().is_none());

        let first = MigrationState::initial(None, None, ts(0));
        store.save(&first).await.unwrap();
        let second = first.advanced("00ff", 1000, &[], ts(5));
        store.save(&second).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(second));
        let leftovers = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_not_retryable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let err = FileCheckpointStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StoreError::CheckpointEncoding(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn unavailable_and_pool_timeouts_are_retryable() {
        assert!(StoreError::Unavailable("socket closed".into()).is_retryable());
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::RowNotFound),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }
}
