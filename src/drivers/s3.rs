use super::backends::ObjectStore;
use super::{Capabilities, Driver, DriverRequest, DriverResponse};
use crate::errors::{MeridianError, Result};
use crate::location::{Entity, EntityKind};
use crate::storage;
use async_trait::async_trait;
use axum::http::StatusCode;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Serves the object named by the location's `S3` entity.
pub struct S3Driver {
    store: Arc<dyn ObjectStore>,
}

impl S3Driver {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn object(req: &DriverRequest) -> Result<(&str, &str)> {
        match req.location.entity.as_deref().map(|e| &e.kind) {
            Some(EntityKind::S3 { bucket, key }) => Ok((bucket.as_str(), key.as_str())),
            _ => Err(MeridianError::MisconfiguredLocation(format!(
                "{} has no S3 entity",
                req.location.href
            ))),
        }
    }
}

#[async_trait]
impl Driver for S3Driver {
    fn name(&self) -> &'static str {
        super::S3_DRIVER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            get: true,
            head: true,
            put: true,
            delete: true,
            list: true,
        }
    }

    async fn get(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (bucket, key) = Self::object(req)?;
        let body = self
            .store
            .get_object(bucket, key)
            .await?
            .ok_or_else(|| MeridianError::NotFound(format!("object {bucket}/{key}")))?;
        Ok(DriverResponse::new(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(body))
    }

    async fn head(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (bucket, key) = Self::object(req)?;
        let size = self
            .store
            .head_object(bucket, key)
            .await?
            .ok_or_else(|| MeridianError::NotFound(format!("object {bucket}/{key}")))?;
        Ok(DriverResponse::new(StatusCode::OK).header("content-length", size.to_string()))
    }

    async fn put(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (bucket, key) = Self::object(req)?;
        let existed = self.store.head_object(bucket, key).await?.is_some();
        self.store.put_object(bucket, key, &req.body).await?;
        tracing::info!(bucket, key, size = req.body.len(), "stored object");
        Ok(DriverResponse::new(if existed {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        }))
    }

    async fn delete(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (bucket, key) = Self::object(req)?;
        if !self.store.delete_object(bucket, key).await? {
            return Err(MeridianError::NotFound(format!("object {bucket}/{key}")));
        }
        Ok(DriverResponse::new(StatusCode::NO_CONTENT))
    }

    /// Keys in the bucket under the entity key, which acts as a prefix.
    async fn list(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let (bucket, key) = Self::object(req)?;
        let keys = self.store.list_objects(bucket, key).await?;
        DriverResponse::json(StatusCode::OK, &keys)
    }
}

/// Bind the stored location `href` to `bucket/key`, creating its `S3` entity.
pub async fn create_entity_from_location(
    db: &DatabaseConnection,
    href: &str,
    bucket: &str,
    key: &str,
    user: Option<String>,
) -> Result<Entity> {
    let location = storage::get_location_by_href(db, href)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("location {href}")))?;
    let location_id = location
        .id
        .clone()
        .ok_or_else(|| MeridianError::Other(format!("stored location {href} has no id")))?;

    let entity = storage::create_entity(
        db,
        href,
        EntityKind::S3 {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        user,
    )
    .await?;

    let mut updated = location;
    updated.entity_id = Some(entity.id.clone());
    updated.driver.get_or_insert_with(|| super::S3_DRIVER.to_string());
    storage::update_location(db, &location_id, updated).await?;

    tracing::info!(href, bucket, key, entity = %entity.id, "bound location to object");
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::backends::FsObjectStore;
    use crate::drivers::{dispatch, load_location, DriverMethod};
    use crate::location::Location;
    use crate::test_support::TestDb;

    #[tokio::test]
    async fn test_object_lifecycle_through_driver() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let dir = tempfile::tempdir().unwrap();
        let driver = S3Driver::new(Arc::new(FsObjectStore::new(dir.path())));

        storage::create_location(db, Location::from_href("http://gw/reports/q1").unwrap())
            .await
            .unwrap();
        let entity = create_entity_from_location(db, "http://gw/reports/q1", "reports", "2024/q1.csv", None)
            .await
            .expect("Failed to create S3 entity");
        assert_eq!(entity.kind.type_name(), "S3");

        let location = load_location(db, "http://gw/reports/q1").await.unwrap();
        assert_eq!(location.driver.as_deref(), Some("S3"));

        let missing = dispatch(&driver, &DriverRequest::new(location.clone(), DriverMethod::Get)).await;
        assert!(matches!(missing, Err(MeridianError::NotFound(_))));

        let put = DriverRequest::new(location.clone(), DriverMethod::Put).with_body("a,b\n1,2\n");
        assert_eq!(dispatch(&driver, &put).await.unwrap().status, 201);
        assert_eq!(dispatch(&driver, &put).await.unwrap().status, 204);

        let got = dispatch(&driver, &DriverRequest::new(location.clone(), DriverMethod::Get))
            .await
            .unwrap();
        assert_eq!(got.body, b"a,b\n1,2\n");

        let head = dispatch(&driver, &DriverRequest::new(location.clone(), DriverMethod::Head))
            .await
            .unwrap();
        assert_eq!(head.header_value("content-length"), Some("8"));

        let listed = dispatch(&driver, &DriverRequest::new(location.clone(), DriverMethod::List))
            .await
            .unwrap();
        let keys: Vec<String> = serde_json::from_slice(&listed.body).unwrap();
        assert_eq!(keys, vec!["2024/q1.csv".to_string()]);

        let deleted = dispatch(&driver, &DriverRequest::new(location, DriverMethod::Delete))
            .await
            .unwrap();
        assert_eq!(deleted.status, 204);
    }

    #[tokio::test]
    async fn test_unknown_location_is_not_found() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        let result = create_entity_from_location(db, "http://gw/none", "b", "k", None).await;
        assert!(matches!(result, Err(MeridianError::NotFound(_))));
    }
}
