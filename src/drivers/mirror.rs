use super::{dispatch, load_location, Capabilities, Driver, DriverRegistry, DriverRequest, DriverResponse};
use crate::errors::{MeridianError, Result};
use crate::location::EntityKind;
use async_trait::async_trait;
use std::sync::Arc;

/// Tries each mirror location in order and returns the first success.
pub struct MirrorDriver {
    registry: Arc<DriverRegistry>,
}

impl MirrorDriver {
    pub fn new(registry: Arc<DriverRegistry>) -> Self {
        Self { registry }
    }

    async fn try_mirror(&self, href: &str, req: &DriverRequest) -> Result<DriverResponse> {
        let location = load_location(&self.registry.context().db, href).await?;
        if location.driver.as_deref() == Some(super::MIRROR_DRIVER) {
            return Err(MeridianError::MisconfiguredLocation(format!(
                "mirror {href} is itself a mirror set"
            )));
        }
        let driver = self.registry.for_location(&location)?;
        dispatch(driver.as_ref(), &req.retarget(location)).await
    }

    async fn fan_out(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let mirrors = match req.location.entity.as_deref().map(|e| &e.kind) {
            Some(EntityKind::Mirror { mirrors }) if !mirrors.is_empty() => mirrors,
            _ => {
                return Err(MeridianError::MisconfiguredLocation(format!(
                    "{} has no mirrors",
                    req.location.href
                )))
            }
        };

        let mut last = None;
        for href in mirrors {
            match self.try_mirror(href, req).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => {
                    tracing::debug!(mirror = %href, status = response.status, "mirror answered with failure");
                    last = Some(Ok(response));
                }
                Err(e) => {
                    tracing::debug!(mirror = %href, error = %e, "mirror failed");
                    last = Some(Err(e));
                }
            }
        }

        last.unwrap_or_else(|| {
            Err(MeridianError::MisconfiguredLocation(format!(
                "{} has no mirrors",
                req.location.href
            )))
        })
    }
}

#[async_trait]
impl Driver for MirrorDriver {
    fn name(&self) -> &'static str {
        super::MIRROR_DRIVER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn get(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.fan_out(req).await
    }

    async fn head(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.fan_out(req).await
    }
}
