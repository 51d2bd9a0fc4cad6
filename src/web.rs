//! HTTP surface: the token endpoint, provider federation, the RPC endpoint and
//! the catch-all resolve handler that serves every other request.
use crate::auth::providers::{self, AuthorizeQuery};
use crate::auth::{get_access_token, Principal, ScopePatterns, TokenForm};
use crate::cache::Cache;
use crate::drivers::{self, DriverContext, DriverMethod, DriverRegistry, DriverRequest, DriverResponse};
use crate::errors::{MeridianError, Result};
use crate::location::Location;
use crate::resolver::{Resolution, ResolveOptions, ResolverEngine, StrategyRegistry};
use crate::settings::Settings;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, FromRequest, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub cache: Cache,
    pub resolution: Resolution,
    pub drivers: Arc<DriverRegistry>,
    pub public_scopes: Arc<ScopePatterns>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Wire the resolver chain, cache and driver registry from `settings`.
    pub fn new(settings: Settings, db: DatabaseConnection) -> Result<Self> {
        let settings = Arc::new(settings);
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("meridian/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let cache = Cache::new(db.clone(), settings.cache.clone());
        let engine = ResolverEngine::new(
            db.clone(),
            settings.resolver.root_resolver_batch_size,
            StrategyRegistry::with_installed(&settings.resolver.resolver_types),
        );
        let drivers = DriverRegistry::with_installed(
            DriverContext::from_settings(db.clone(), http.clone(), &settings),
            &settings.resolver.drivers,
        );
        let public_scopes = ScopePatterns::compile(&settings.auth.unauthorized_scopes)?;

        Ok(Self {
            resolution: Resolution::new(engine, cache.clone()),
            drivers: Arc::new(drivers),
            public_scopes: Arc::new(public_scopes),
            settings,
            db,
            cache,
            http,
        })
    }

    pub async fn principal(&self, headers: &HeaderMap) -> Result<Principal> {
        Principal::from_headers(&self.db, &self.settings.auth, headers).await
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.settings.server.max_body_size;
    Router::new()
        .route("/auth/token", post(token))
        .route("/auth/{provider}/authorize", get(provider_authorize))
        .route("/rpc", post(crate::rpc::handle))
        .fallback(resolve_request)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Resolution gateway listening");
    axum::serve(listener, router(state)).await.into_diagnostic()?;
    Ok(())
}

/// Body extractor accepting `application/json` or a urlencoded form.
pub struct JsonOrForm<T>(pub T);

impl<S, T> FromRequest<S> for JsonOrForm<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = MeridianError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if is_json {
            let Json(value) = Json::<T>::from_request(req, state)
                .await
                .map_err(|e| MeridianError::MalformedRequest(e.body_text()))?;
            Ok(Self(value))
        } else {
            let Form(value) = Form::<T>::from_request(req, state)
                .await
                .map_err(|e| MeridianError::MalformedRequest(e.body_text()))?;
            Ok(Self(value))
        }
    }
}

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonOrForm(form): JsonOrForm<TokenForm>,
) -> Result<Response> {
    state
        .principal(&headers)
        .await?
        .authorize(&state.public_scopes, "auth.token")?;

    let token = get_access_token(&state.db, &state.settings.auth, &form).await?;
    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(token),
    )
        .into_response())
}

async fn provider_authorize(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response> {
    let scopes = [
        "auth.authorize".to_string(),
        format!("auth.{provider}.authorize"),
    ];
    state
        .principal(&headers)
        .await?
        .authorize_any(&state.public_scopes, &scopes)?;

    let url = providers::authorize(&state.db, &state.settings, &state.http, &provider, &query).await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

/// The href a request addresses: its absolute URI if it has one, else the
/// public scheme, the `Host` header and the path.
fn request_href(settings: &Settings, parts: &Parts) -> Result<String> {
    if parts.uri.scheme().is_some() && parts.uri.authority().is_some() {
        return Ok(parts.uri.to_string());
    }

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| MeridianError::MalformedRequest("missing Host header".to_string()))?;
    let scheme = settings
        .server
        .public_base_url
        .as_deref()
        .and_then(|base| url::Url::parse(base).ok())
        .map(|base| base.scheme().to_string())
        .unwrap_or_else(|| "http".to_string());
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    Ok(format!("{scheme}://{host}{path}"))
}

fn header_str<'h>(headers: &'h HeaderMap, name: &HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A stored response plus the auth groups of the location that produced it,
/// so a hit is authorized the same way a fresh resolve is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub groups: Vec<String>,
    pub response: DriverResponse,
}

/// Buffer the request body. The cap comes from the router's `DefaultBodyLimit`.
async fn read_body(parts: Parts, body: Body, limit: usize) -> Result<Bytes> {
    Bytes::from_request(Request::from_parts(parts, body), &())
        .await
        .map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                MeridianError::PayloadTooLarge(limit)
            } else {
                MeridianError::MalformedRequest(format!("unreadable body: {}", rejection.body_text()))
            }
        })
}

/// Resolve the request URL and serve it through the location's driver.
async fn resolve_request(State(state): State<AppState>, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let principal = state.principal(&parts.headers).await?;
    let href = request_href(&state.settings, &parts)?;
    let method = DriverMethod::from_http(&parts.method);
    let verb = method
        .map(|m| m.verb().to_string())
        .unwrap_or_else(|| parts.method.as_str().to_ascii_lowercase());

    let cache_key = match method {
        Some(DriverMethod::Get) if state.cache.enabled() => Some(Cache::key(&json!({
            "href": href,
            "auth": header_str(&parts.headers, &header::AUTHORIZATION),
            "userAgent": header_str(&parts.headers, &header::USER_AGENT),
        }))?),
        _ => None,
    };
    if let Some(key) = &cache_key {
        if let Some(hit) = state.cache.get::<CachedResponse>(key).await? {
            principal.authorize_resolve(&state.public_scopes, &hit.groups, &verb)?;
            tracing::debug!(href = %href, "response cache hit");
            return Ok(hit.response.into_response());
        }
    }

    let location = state
        .resolution
        .resolve(&Location::from_href(&href)?, &ResolveOptions::default())
        .await?
        .ok_or_else(|| MeridianError::NotFound(href.clone()))?;

    principal.authorize_resolve(&state.public_scopes, location.groups(), &verb)?;

    let driver = state.drivers.for_location(&location)?;
    let capabilities = driver.capabilities();
    let method = match method {
        Some(method) if capabilities.supports(method) => method,
        _ => {
            return Err(MeridianError::MethodNotAllowed {
                method: parts.method.to_string(),
                allowed: capabilities.allowed(),
            })
        }
    };

    let headers = parts.headers.clone();
    let body = read_body(parts, body, state.settings.server.max_body_size).await?;
    let request = DriverRequest::new(location, method)
        .with_headers(headers)
        .with_body(body);
    let response = drivers::dispatch(driver.as_ref(), &request).await?;

    if let Some(key) = cache_key {
        let cacheable = response.status == 200 || state.cache.settings().cache_non_200_http_responses;
        let ttl = request.location.cache_expire_in;
        if cacheable && !matches!(ttl, Some(t) if t <= 0) {
            let entry = CachedResponse {
                groups: request.location.groups().to_vec(),
                response,
            };
            state.cache.set(&key, &entry, ttl).await?;
            return Ok(entry.response.into_response());
        }
    }

    Ok(response.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Uri};

    fn parts(uri: &str, host: Option<&str>) -> Parts {
        let mut builder = axum::http::Request::builder()
            .method(Method::GET)
            .uri(uri.parse::<Uri>().unwrap());
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_href_from_host_header() {
        let settings = Settings::default();
        let href = request_href(&settings, &parts("/y?a=1", Some("x"))).unwrap();
        assert_eq!(href, "http://x/y?a=1");
    }

    #[test]
    fn test_href_uses_public_scheme() {
        let mut settings = Settings::default();
        settings.server.public_base_url = Some("https://gw.example.com".to_string());
        let href = request_href(&settings, &parts("/doc", Some("gw.example.com"))).unwrap();
        assert_eq!(href, "https://gw.example.com/doc");
    }

    #[test]
    fn test_absolute_uri_wins() {
        let settings = Settings::default();
        let href = request_href(&settings, &parts("http://other/z", Some("x"))).unwrap();
        assert_eq!(href, "http://other/z");
    }

    #[test]
    fn test_missing_host_is_malformed() {
        let settings = Settings::default();
        assert!(matches!(
            request_href(&settings, &parts("/y", None)),
            Err(MeridianError::MalformedRequest(_))
        ));
    }
}
