use crate::entities;
use crate::errors::Result;
use crate::location::Location;
use crate::mount_point::MountPoint;
use crate::resolver::strategies::{
    AliasStrategy, PrefixStrategy, ResolveStrategy, RootStrategy, ALIAS_RESOLVER_TYPE,
    PREFIX_RESOLVER_TYPE,
};
use crate::storage::{self, ResolverRecord, ROOT_RESOLVER_TYPE};
use dashmap::DashMap;
use regex::Regex;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolver discriminator to strategy. Filled at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn ResolveStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in strategies whose names appear in `installed`. The root
    /// strategy is always present.
    pub fn with_installed(installed: &[String]) -> Self {
        let mut registry = Self::new();
        registry.register(ROOT_RESOLVER_TYPE, Arc::new(RootStrategy));
        for name in installed {
            match name.as_str() {
                ROOT_RESOLVER_TYPE => {}
                ALIAS_RESOLVER_TYPE => registry.register(name, Arc::new(AliasStrategy)),
                PREFIX_RESOLVER_TYPE => registry.register(name, Arc::new(PrefixStrategy)),
                other => tracing::warn!(resolver_type = %other, "unknown resolver type, skipped"),
            }
        }
        registry
    }

    pub fn register(&mut self, name: &str, strategy: Arc<dyn ResolveStrategy>) {
        self.strategies.insert(name.to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ResolveStrategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }
}

/// Compiled mount points kept before the map is emptied and refilled.
const MAX_COMPILED_MOUNT_POINTS: usize = 4096;

/// Walks the resolver chain for a location.
#[derive(Clone)]
pub struct ResolverEngine {
    db: DatabaseConnection,
    batch_size: u64,
    strategies: Arc<StrategyRegistry>,
    compiled: Arc<DashMap<MountPoint, Regex>>,
}

impl ResolverEngine {
    pub fn new(db: DatabaseConnection, batch_size: u64, strategies: StrategyRegistry) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
            strategies: Arc::new(strategies),
            compiled: Arc::new(DashMap::new()),
        }
    }

    /// The compiled regex for `mount`, built on first use.
    pub fn matcher(&self, mount: &MountPoint) -> Result<Regex> {
        if let Some(regex) = self.compiled.get(mount) {
            return Ok(regex.clone());
        }

        let regex = mount.compile()?;
        if self.compiled.len() >= MAX_COMPILED_MOUNT_POINTS {
            self.compiled.clear();
        }
        self.compiled.insert(mount.clone(), regex.clone());
        Ok(regex)
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub async fn resolve(&self, location: &Location) -> Result<Option<Location>> {
        self.resolve_excluding(location, &[]).await
    }

    /// Try every resolver whose mount point matches `location.href`, except
    /// those in `excluded`, and return the first result.
    ///
    /// Resolvers are streamed in batches: typed resolvers before the root,
    /// then mount point descending so longer, more specific literals sort
    /// ahead of shorter ones, then lower priority first.
    pub async fn resolve_excluding(
        &self,
        location: &Location,
        excluded: &[String],
    ) -> Result<Option<Location>> {
        use entities::resolver::Column;

        let mut query = entities::Resolver::find();
        if !excluded.is_empty() {
            query = query.filter(Column::Id.is_not_in(excluded.iter().cloned()));
        }
        let mut pages = query
            .order_by_asc(Column::IsRootResolver)
            .order_by_desc(Column::MountPoint)
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::Id)
            .paginate(&self.db, self.batch_size);

        while let Some(batch) = pages.fetch_and_next().await? {
            let mut candidates = Vec::new();
            for model in batch {
                let resolver = storage::resolver_from_model(model)?;
                match self
                    .matcher(&resolver.mount_point)
                    .map(|regex| regex.is_match(&location.href))
                {
                    Ok(true) => candidates.push(resolver),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(resolver = %resolver.id, error = %e, "skipping resolver with bad mount point")
                    }
                }
            }

            for resolver in candidates {
                if let Some(found) = self.resolve_with(&resolver, location, excluded).await? {
                    tracing::debug!(href = %location.href, resolver = %resolver.id, "resolved");
                    return Ok(Some(found));
                }
            }
        }

        Ok(None)
    }

    /// Run a single resolver. A typed resolver that yields nothing falls back
    /// to the root lookup for the same location.
    pub async fn resolve_with(
        &self,
        resolver: &ResolverRecord,
        location: &Location,
        excluded: &[String],
    ) -> Result<Option<Location>> {
        let Some(strategy) = self.strategies.get(&resolver.resolver_type) else {
            tracing::warn!(
                resolver = %resolver.id,
                resolver_type = %resolver.resolver_type,
                "resolver type not installed"
            );
            return Ok(None);
        };

        let found = strategy.resolve(self, resolver, location, excluded).await?;
        if found.is_some() || resolver.is_root_resolver {
            return Ok(found);
        }
        RootStrategy.resolve(self, resolver, location, excluded).await
    }
}
