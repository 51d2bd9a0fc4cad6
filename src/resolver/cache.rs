use crate::cache::Cache;
use crate::errors::{MeridianError, Result};
use crate::location::Location;
use crate::resolver::engine::ResolverEngine;
use crate::storage;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOptions {
    /// Run only this resolver instead of the whole chain
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub no_cache: bool,
}

/// The chain engine behind the keyed cache.
///
/// Concurrent misses for the same key both run the engine; the later write
/// replaces the earlier one.
#[derive(Clone)]
pub struct Resolution {
    engine: ResolverEngine,
    cache: Cache,
}

impl Resolution {
    pub fn new(engine: ResolverEngine, cache: Cache) -> Self {
        Self { engine, cache }
    }

    pub fn engine(&self) -> &ResolverEngine {
        &self.engine
    }

    pub async fn resolve(&self, input: &Location, options: &ResolveOptions) -> Result<Option<Location>> {
        let mut location = input.clone();
        location.canonicalize()?;

        let use_cache = self.cache.enabled() && !options.no_cache;
        let key = if use_cache {
            let key = Cache::key(&json!({
                "location": location.lookup_view()?,
                "resolver": options.id,
            }))?;
            if let Some(hit) = self.cache.get::<Location>(&key).await? {
                tracing::debug!(href = %location.href, "resolve cache hit");
                return Ok(Some(hit));
            }
            Some(key)
        } else {
            None
        };

        let found = self.resolve_uncached(&location, options.id.as_deref()).await?;

        if let (Some(key), Some(found)) = (key, found.as_ref()) {
            let ttl = found.cache_expire_in.or(location.cache_expire_in);
            if !matches!(ttl, Some(t) if t <= 0) {
                self.cache.set(&key, found, ttl).await?;
            }
        }
        Ok(found)
    }

    async fn resolve_uncached(&self, location: &Location, id: Option<&str>) -> Result<Option<Location>> {
        let Some(id) = id else {
            return self.engine.resolve(location).await;
        };

        let resolver = storage::get_resolver(self.engine.db(), id)
            .await?
            .ok_or_else(|| MeridianError::NotFound(format!("resolver {id}")))?;
        if resolver.is_root_resolver {
            return self.engine.resolve(location).await;
        }
        self.engine.resolve_with(&resolver, location, &[]).await
    }
}
