use crate::errors::{MeridianError, Result};
use crate::location::Location;
use crate::resolver::engine::ResolverEngine;
use crate::storage::{self, ResolverRecord};
use async_trait::async_trait;
use serde::Deserialize;

pub const ALIAS_RESOLVER_TYPE: &str = "AliasResolver";
pub const PREFIX_RESOLVER_TYPE: &str = "PrefixResolver";

/// How one resolver type turns a location into a resolved one.
///
/// `excluded` holds the resolvers already on the current resolution path;
/// strategies that recurse pass it on with their own id added.
#[async_trait]
pub trait ResolveStrategy: Send + Sync {
    async fn resolve(
        &self,
        engine: &ResolverEngine,
        resolver: &ResolverRecord,
        location: &Location,
        excluded: &[String],
    ) -> Result<Option<Location>>;
}

/// Terminal lookup: a stored location with this exact href and a driver.
pub struct RootStrategy;

#[async_trait]
impl ResolveStrategy for RootStrategy {
    async fn resolve(
        &self,
        engine: &ResolverEngine,
        _resolver: &ResolverRecord,
        location: &Location,
        _excluded: &[String],
    ) -> Result<Option<Location>> {
        let db = engine.db();
        let Some(mut found) = storage::get_location_by_href(db, &location.href)
            .await?
            .filter(|l| l.driver.is_some())
        else {
            return Ok(None);
        };
        storage::populate_entity(db, &mut found).await?;
        Ok(Some(found))
    }
}

#[derive(Debug, Deserialize)]
struct AliasConfig {
    /// Replacement for the mount point match; `$1`, `${name}` refer to captures
    replacement: String,
}

/// Rewrites the href through the mount point regex, then resolves the result.
pub struct AliasStrategy;

#[async_trait]
impl ResolveStrategy for AliasStrategy {
    async fn resolve(
        &self,
        engine: &ResolverEngine,
        resolver: &ResolverRecord,
        location: &Location,
        excluded: &[String],
    ) -> Result<Option<Location>> {
        let config: AliasConfig = serde_json::from_value(resolver.config.clone()).map_err(|e| {
            MeridianError::MisconfiguredLocation(format!("alias resolver {}: {e}", resolver.id))
        })?;

        let regex = engine.matcher(&resolver.mount_point)?;
        let rewritten = regex.replace(&location.href, config.replacement.as_str());
        if rewritten == location.href {
            return Ok(None);
        }

        tracing::debug!(from = %location.href, to = %rewritten, resolver = %resolver.id, "alias rewrite");
        let target = Location::from_href(&rewritten)?;
        engine.resolve_excluding(&target, &with(excluded, &resolver.id)).await
    }
}

#[derive(Debug, Deserialize)]
struct PrefixConfig {
    /// Href the unmatched remainder is appended to
    base: String,
}

/// Strips the part of the href the mount point matched and grafts the rest
/// onto a configured base.
pub struct PrefixStrategy;

#[async_trait]
impl ResolveStrategy for PrefixStrategy {
    async fn resolve(
        &self,
        engine: &ResolverEngine,
        resolver: &ResolverRecord,
        location: &Location,
        excluded: &[String],
    ) -> Result<Option<Location>> {
        let config: PrefixConfig = serde_json::from_value(resolver.config.clone()).map_err(|e| {
            MeridianError::MisconfiguredLocation(format!("prefix resolver {}: {e}", resolver.id))
        })?;

        let regex = engine.matcher(&resolver.mount_point)?;
        let Some(matched) = regex.find(&location.href) else {
            return Ok(None);
        };

        let rest = &location.href[matched.end()..];
        let href = match (config.base.ends_with('/'), rest.starts_with('/')) {
            (true, true) => format!("{}{}", config.base, &rest[1..]),
            _ => format!("{}{}", config.base, rest),
        };

        tracing::debug!(from = %location.href, to = %href, resolver = %resolver.id, "prefix graft");
        let target = Location::from_href(&href)?;
        engine.resolve_excluding(&target, &with(excluded, &resolver.id)).await
    }
}

fn with(excluded: &[String], id: &str) -> Vec<String> {
    let mut next = excluded.to_vec();
    next.push(id.to_string());
    next
}
