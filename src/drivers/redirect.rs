use super::{Capabilities, Driver, DriverRequest, DriverResponse};
use crate::errors::{MeridianError, Result};
use crate::location::EntityKind;
use async_trait::async_trait;
use axum::http::StatusCode;

/// Answers with a redirect to the target of the location's `Redirect` entity.
pub struct RedirectDriver;

impl RedirectDriver {
    fn respond(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let entity = req.location.entity.as_deref().ok_or_else(|| {
            MeridianError::MisconfiguredLocation(format!("{} has no redirect entity", req.location.href))
        })?;

        let EntityKind::Redirect { target, permanent } = &entity.kind else {
            return Err(MeridianError::MisconfiguredLocation(format!(
                "{} has a {} entity, expected Redirect",
                req.location.href,
                entity.kind.type_name()
            )));
        };

        let Some(target) = target else {
            return Err(MeridianError::Gone(req.location.href.clone()));
        };

        let status = if *permanent {
            StatusCode::MOVED_PERMANENTLY
        } else {
            StatusCode::FOUND
        };
        Ok(DriverResponse::new(status).header("location", target.as_str()))
    }
}

#[async_trait]
impl Driver for RedirectDriver {
    fn name(&self) -> &'static str {
        super::REDIRECT_DRIVER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn get(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.respond(req)
    }

    async fn head(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.respond(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{dispatch, DriverMethod};
    use crate::location::{Entity, Location};

    fn location(kind: Option<EntityKind>) -> Location {
        let mut location = Location::from_href("http://gw/s/abc").unwrap();
        location.driver = Some("Redirect".to_string());
        location.entity = kind.map(|kind| {
            Box::new(Entity {
                id: "e1".to_string(),
                source_href: "http://gw/s/abc".to_string(),
                source: None,
                kind,
                user: None,
                created_at: 0,
                updated_at: 0,
            })
        });
        location
    }

    #[tokio::test]
    async fn test_temporary_and_permanent_redirects() {
        let temporary = location(Some(EntityKind::Redirect {
            target: Some("https://example.com/".to_string()),
            permanent: false,
        }));
        let response = dispatch(&RedirectDriver, &DriverRequest::new(temporary, DriverMethod::Get))
            .await
            .unwrap();
        assert_eq!(response.status, 302);
        assert_eq!(response.header_value("Location"), Some("https://example.com/"));

        let permanent = location(Some(EntityKind::Redirect {
            target: Some("https://example.com/".to_string()),
            permanent: true,
        }));
        let response = dispatch(&RedirectDriver, &DriverRequest::new(permanent, DriverMethod::Head))
            .await
            .unwrap();
        assert_eq!(response.status, 301);
    }

    #[tokio::test]
    async fn test_missing_target_is_gone() {
        let gone = location(Some(EntityKind::Redirect {
            target: None,
            permanent: false,
        }));
        assert!(matches!(
            dispatch(&RedirectDriver, &DriverRequest::new(gone, DriverMethod::Get)).await,
            Err(MeridianError::Gone(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_entity_is_misconfigured() {
        assert!(matches!(
            dispatch(&RedirectDriver, &DriverRequest::new(location(None), DriverMethod::Get)).await,
            Err(MeridianError::MisconfiguredLocation(_))
        ));

        let mirror = location(Some(EntityKind::Mirror { mirrors: vec![] }));
        assert!(matches!(
            dispatch(&RedirectDriver, &DriverRequest::new(mirror, DriverMethod::Get)).await,
            Err(MeridianError::MisconfiguredLocation(_))
        ));
    }

    #[tokio::test]
    async fn test_put_not_allowed() {
        let loc = location(None);
        assert!(matches!(
            dispatch(&RedirectDriver, &DriverRequest::new(loc, DriverMethod::Put)).await,
            Err(MeridianError::MethodNotAllowed { .. })
        ));
    }
}
