use super::{Capabilities, Driver, DriverMethod, DriverRequest, DriverResponse};
use crate::errors::{MeridianError, Result};
use crate::location::EntityKind;
use async_trait::async_trait;
use axum::http::{HeaderMap, Method};

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn forwardable(name: &str) -> bool {
    !HOP_BY_HOP.contains(&name)
}

/// Forwards the request to the upstream href and relays the answer.
pub struct ProxyDriver {
    http: reqwest::Client,
}

impl ProxyDriver {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// A redirect target if the entity has one, else the entity source, else
    /// the location itself.
    fn upstream(req: &DriverRequest) -> String {
        match req.location.entity.as_deref() {
            Some(entity) => match &entity.kind {
                EntityKind::Redirect {
                    target: Some(target),
                    ..
                } => target.clone(),
                _ => entity.source_href.clone(),
            },
            None => req.location.href.clone(),
        }
    }

    async fn forward(&self, req: &DriverRequest) -> Result<DriverResponse> {
        let upstream = Self::upstream(req);
        let method = match req.method {
            DriverMethod::Get => Method::GET,
            DriverMethod::Head => Method::HEAD,
            DriverMethod::Put => Method::PUT,
            DriverMethod::Delete => Method::DELETE,
            DriverMethod::List => return Err(self.unsupported(req.method)),
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &req.headers {
            // The caller's gateway credentials stay at the gateway.
            if forwardable(name.as_str()) && name != axum::http::header::AUTHORIZATION {
                headers.append(name.clone(), value.clone());
            }
        }

        let context = format!("proxy {} {upstream}", method);
        let response = self
            .http
            .request(method, &upstream)
            .headers(headers)
            .body(req.body.clone())
            .send()
            .await
            .map_err(|e| MeridianError::upstream(context.clone(), e))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| forwardable(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| MeridianError::upstream(context, e))?;

        tracing::debug!(upstream = %upstream, status = status.as_u16(), "proxied");
        Ok(DriverResponse {
            status: status.as_u16(),
            headers,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl Driver for ProxyDriver {
    fn name(&self) -> &'static str {
        super::PROXY_DRIVER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            get: true,
            head: true,
            put: true,
            delete: true,
            list: false,
        }
    }

    async fn get(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.forward(req).await
    }

    async fn head(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.forward(req).await
    }

    async fn put(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.forward(req).await
    }

    async fn delete(&self, req: &DriverRequest) -> Result<DriverResponse> {
        self.forward(req).await
    }
}
