use super::backends::ContentStore;
use super::{dispatch, load_location, Capabilities, Driver, DriverMethod, DriverRegistry, DriverRequest, DriverResponse};
use crate::errors::{MeridianError, Result};
use crate::location::{Entity, EntityKind};
use crate::storage;
use async_trait::async_trait;
use axum::http::StatusCode;
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::Arc;

/// Serves content-addressed blobs named by the location's `Ipfs` entity.
pub struct IpfsDriver {
    db: DatabaseConnection,
    store: Arc<dyn ContentStore>,
}

impl IpfsDriver {
    pub fn new(db: DatabaseConnection, store: Arc<dyn ContentStore>) -> Self {
        Self { db, store }
    }

    fn content(req: &DriverRequest) -> Result<(&Entity, &str, bool)> {
        match req.location.entity.as_deref() {
            Some(entity) => match &entity.kind {
                EntityKind::Ipfs { cid, pinned } => Ok((entity, cid.as_str(), *pinned)),
                _ => Err(misconfigured(&req.location.href)),
            },
            None => Err(misconfigured(&req.location.href)),
        }
    }
}

fn misconfigured(href: &str) -> MeridianError {
    MeridianError::MisconfiguredLocation(format!("{href} has no IPFS entity"))
}

#[async_trait]
impl Driver for IpfsDriver {
    fn name(&self) -> &'static str {
        super::IPFS_DRIVER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            get: true,
            head: true,
            put: true,
            delete: false,
            list: true,
        }
    }

    async fn get(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (_, cid, _) = Self::content(req)?;
        let body = self
            .store
            .cat(cid)
            .await?
            .ok_or_else(|| MeridianError::NotFound(format!("content {cid}")))?;
        Ok(DriverResponse::new(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .header("etag", format!("\"{cid}\""))
            .body(body))
    }

    async fn head(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (_, cid, _) = Self::content(req)?;
        let size = self
            .store
            .stat(cid)
            .await?
            .ok_or_else(|| MeridianError::NotFound(format!("content {cid}")))?;
        Ok(DriverResponse::new(StatusCode::OK)
            .header("content-length", size.to_string())
            .header("etag", format!("\"{cid}\"")))
    }

    /// Store the body as new content and point the entity at it. A pinned
    /// entity keeps its new content pinned.
    async fn put(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (entity, _, pinned) = Self::content(req)?;
        let cid = self.store.add(&req.body).await?;
        if pinned {
            self.store.pin(&cid).await?;
        }
        storage::update_entity(
            &self.db,
            &entity.id,
            EntityKind::Ipfs {
                cid: cid.clone(),
                pinned,
            },
            None,
        )
        .await?;

        tracing::info!(entity = %entity.id, cid = %cid, "stored content");
        DriverResponse::json(StatusCode::CREATED, &json!({ "cid": cid }))
    }

    async fn list(&self, req: &DriverRequest) -> Result<DriverResponse> {
        Self::content(req)?;
        let pins = self.store.pins().await?;
        DriverResponse::json(StatusCode::OK, &pins)
    }
}

/// Copy the current content of `href` into the content store and turn the
/// location into an `IPFS` location owning an `Ipfs` entity.
pub async fn create_entity_from_location(
    registry: &Arc<DriverRegistry>,
    href: &str,
    user: Option<String>,
) -> Result<Entity> {
    let ctx = registry.context();
    let location = load_location(&ctx.db, href).await?;
    let location_id = location
        .id
        .clone()
        .ok_or_else(|| MeridianError::Other(format!("stored location {href} has no id")))?;

    let driver = registry.for_location(&location)?;
    let read = dispatch(driver.as_ref(), &DriverRequest::new(location.clone(), DriverMethod::Get)).await?;
    if !(200..300).contains(&read.status) {
        return Err(MeridianError::MisconfiguredLocation(format!(
            "{href} answered {} instead of content",
            read.status
        )));
    }
    let cid = ctx.content_store.add(&read.body).await?;
    let kind = EntityKind::Ipfs { cid, pinned: false };

    // The entity keyed on this href is reused so its id stays stable.
    let entity = match location.entity.as_deref() {
        Some(existing) if existing.source_href == href => {
            storage::update_entity(&ctx.db, &existing.id, kind, user).await?
        }
        _ => storage::create_entity(&ctx.db, href, kind, user).await?,
    };

    let mut updated = location;
    updated.entity = None;
    updated.entity_id = Some(entity.id.clone());
    updated.driver = Some(super::IPFS_DRIVER.to_string());
    storage::update_location(&ctx.db, &location_id, updated).await?;

    tracing::info!(href, entity = %entity.id, "materialized location into content store");
    Ok(entity)
}

async fn set_pinned(registry: &Arc<DriverRegistry>, entity_id: &str, pinned: bool) -> Result<Entity> {
    let ctx = registry.context();
    let entity = storage::get_entity(&ctx.db, entity_id)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("entity {entity_id}")))?;
    let kind_name = entity.kind.type_name();
    let EntityKind::Ipfs { cid, .. } = entity.kind else {
        return Err(MeridianError::MisconfiguredLocation(format!(
            "entity {entity_id} is a {kind_name} entity, expected Ipfs"
        )));
    };

    if pinned {
        ctx.content_store.pin(&cid).await?;
    } else {
        ctx.content_store.unpin(&cid).await?;
    }
    storage::update_entity(&ctx.db, entity_id, EntityKind::Ipfs { cid, pinned }, None).await
}

pub async fn pin_entity(registry: &Arc<DriverRegistry>, entity_id: &str) -> Result<Entity> {
    set_pinned(registry, entity_id, true).await
}

pub async fn unpin_entity(registry: &Arc<DriverRegistry>, entity_id: &str) -> Result<Entity> {
    set_pinned(registry, entity_id, false).await
}
