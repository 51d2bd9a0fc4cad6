use crate::entities::cache_item::{ActiveModel, Column, Entity};
use crate::errors::Result;
use crate::settings;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// TTL-keyed cache stored in the `cache_items` table.
///
/// Values are opaque JSON blobs. Expired rows are never returned and are
/// removed by the purge job.
#[derive(Clone)]
pub struct Cache {
    db: DatabaseConnection,
    cfg: settings::Cache,
}

impl Cache {
    pub fn new(db: DatabaseConnection, cfg: settings::Cache) -> Self {
        Self { db, cfg }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enable_cache
    }

    pub fn settings(&self) -> &settings::Cache {
        &self.cfg
    }

    /// Content hash of the canonical JSON form of `lookup`.
    pub fn key<T: Serialize + ?Sized>(lookup: &T) -> Result<String> {
        // Value maps are ordered, so the encoding is stable across field order.
        let canonical = serde_json::to_vec(&serde_json::to_value(lookup)?)?;
        let digest = Sha256::digest(&canonical);
        Ok(Base64UrlUnpadded::encode_string(&digest))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let now = Utc::now().timestamp();
        let Some(item) = Entity::find_by_id(key.to_string())
            .filter(Column::ExpiresAt.gt(now))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        match serde_json::from_str(&item.value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "dropping undecodable cache entry");
                self.delete(key).await?;
                Ok(None)
            }
        }
    }

    /// Store `value` for `ttl` seconds, or the configured default when `None`.
    ///
    /// Returns `false` when nothing was written: a non-positive TTL or a value
    /// larger than `cache_size`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<i64>,
    ) -> Result<bool> {
        let ttl = ttl.unwrap_or(self.cfg.cache_expire_in);
        if ttl <= 0 {
            return Ok(false);
        }

        let json = serde_json::to_string(value)?;
        if json.len() > self.cfg.cache_size {
            tracing::debug!(key, size = json.len(), "value exceeds cache_size, not cached");
            return Ok(false);
        }

        let now = Utc::now().timestamp();
        let item = ActiveModel {
            key: Set(key.to_string()),
            value: Set(json),
            expires_at: Set(now + ttl),
            created_at: Set(now),
        };

        Entity::insert(item)
            .on_conflict(
                OnConflict::column(Column::Key)
                    .update_columns([Column::Value, Column::ExpiresAt, Column::CreatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        self.enforce_max().await?;
        Ok(true)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        Entity::delete_by_id(key.to_string()).exec(&self.db).await?;
        Ok(())
    }

    /// Evict the entries closest to expiry until at most `cache_max` remain.
    async fn enforce_max(&self) -> Result<()> {
        let count = Entity::find().count(&self.db).await?;
        if count <= self.cfg.cache_max {
            return Ok(());
        }

        let excess = count - self.cfg.cache_max;
        let victims: Vec<String> = Entity::find()
            .select_only()
            .column(Column::Key)
            .order_by_asc(Column::ExpiresAt)
            .limit(excess)
            .into_tuple()
            .all(&self.db)
            .await?;

        Entity::delete_many()
            .filter(Column::Key.is_in(victims))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

/// Drop every entry, live or not.
///
/// Everything cached is derived from locations, resolvers and entities, so
/// the storage write paths for those call this.
pub async fn clear(db: &DatabaseConnection) -> Result<u64> {
    let result = Entity::delete_many().exec(db).await?;
    if result.rows_affected > 0 {
        tracing::debug!(entries = result.rows_affected, "cache cleared");
    }
    Ok(result.rows_affected)
}

pub async fn purge_expired(db: &DatabaseConnection) -> Result<u64> {
    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lte(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}
