//! Capability-typed drivers that serve a resolved location.
//!
//! A driver implements some subset of `get`, `head`, `put`, `delete` and
//! `list`. The registry maps driver names to constructors and is built once
//! at startup from the configured driver list.

pub mod backends;
pub mod ipfs;
pub mod mirror;
pub mod proxy;
pub mod redirect;
pub mod s3;

use crate::errors::{MeridianError, Result};
use crate::location::Location;
use crate::settings::Settings;
use crate::storage;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use backends::{ContentStore, FsContentStore, FsObjectStore, ObjectStore};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const REDIRECT_DRIVER: &str = "Redirect";
pub const PROXY_DRIVER: &str = "Proxy";
pub const MIRROR_DRIVER: &str = "Mirror";
pub const S3_DRIVER: &str = "S3";
pub const IPFS_DRIVER: &str = "IPFS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMethod {
    Get,
    Head,
    Put,
    Delete,
    List,
}

impl DriverMethod {
    /// Map an HTTP method onto a driver capability. `LIST` is a custom verb.
    pub fn from_http(method: &Method) -> Option<Self> {
        match method.as_str() {
            "GET" => Some(DriverMethod::Get),
            "HEAD" => Some(DriverMethod::Head),
            "PUT" => Some(DriverMethod::Put),
            "DELETE" => Some(DriverMethod::Delete),
            "LIST" => Some(DriverMethod::List),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverMethod::Get => "GET",
            DriverMethod::Head => "HEAD",
            DriverMethod::Put => "PUT",
            DriverMethod::Delete => "DELETE",
            DriverMethod::List => "LIST",
        }
    }

    /// Verb used in `resolve.*.<verb>` scopes.
    pub fn verb(&self) -> &'static str {
        match self {
            DriverMethod::Get => "get",
            DriverMethod::Head => "head",
            DriverMethod::Put => "put",
            DriverMethod::Delete => "delete",
            DriverMethod::List => "list",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub get: bool,
    pub head: bool,
    pub put: bool,
    pub delete: bool,
    pub list: bool,
}

impl Capabilities {
    pub const READ_ONLY: Capabilities = Capabilities {
        get: true,
        head: true,
        put: false,
        delete: false,
        list: false,
    };

    pub fn supports(&self, method: DriverMethod) -> bool {
        match method {
            DriverMethod::Get => self.get,
            DriverMethod::Head => self.head,
            DriverMethod::Put => self.put,
            DriverMethod::Delete => self.delete,
            DriverMethod::List => self.list,
        }
    }

    /// Method names for the `Allow` header.
    pub fn allowed(&self) -> Vec<&'static str> {
        [
            DriverMethod::Get,
            DriverMethod::Head,
            DriverMethod::Put,
            DriverMethod::Delete,
            DriverMethod::List,
        ]
        .into_iter()
        .filter(|m| self.supports(*m))
        .map(|m| m.as_str())
        .collect()
    }
}

/// What a driver sees of the inbound request.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    /// Resolved location, entity populated
    pub location: Location,
    pub method: DriverMethod,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DriverRequest {
    pub fn new(location: Location, method: DriverMethod) -> Self {
        Self {
            location,
            method,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Same request against another location.
    pub fn retarget(&self, location: Location) -> Self {
        Self {
            location,
            ..self.clone()
        }
    }
}

/// A fully buffered driver response. Serializable so the gateway can cache it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

impl DriverResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Result<Self> {
        Ok(Self::new(status)
            .header("content-type", "application/json")
            .body(serde_json::to_vec(value)?))
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 2xx or 3xx.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

impl IntoResponse for DriverResponse {
    fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|e| MeridianError::Other(format!("invalid driver response: {e}")).into_response())
    }
}

mod body_base64 {
    use base64ct::{Base64, Encoding};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Base64::decode_vec(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A handler for one kind of backend.
///
/// Only the methods named by `capabilities()` are ever called through
/// [`dispatch`]; the defaults reject the call.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    async fn get(&self, req: &DriverRequest) -> Result<DriverResponse> {
        Err(self.unsupported(req.method))
    }

    async fn head(&self, req: &DriverRequest) -> Result<DriverResponse> {
        Err(self.unsupported(req.method))
    }

    async fn put(&self, req: &DriverRequest) -> Result<DriverResponse> {
        Err(self.unsupported(req.method))
    }

    async fn delete(&self, req: &DriverRequest) -> Result<DriverResponse> {
        Err(self.unsupported(req.method))
    }

    async fn list(&self, req: &DriverRequest) -> Result<DriverResponse> {
        Err(self.unsupported(req.method))
    }

    fn unsupported(&self, method: DriverMethod) -> MeridianError {
        MeridianError::MethodNotAllowed {
            method: method.as_str().to_string(),
            allowed: self.capabilities().allowed(),
        }
    }
}

/// Check the driver's capabilities, then invoke the matching method.
pub async fn dispatch(driver: &dyn Driver, req: &DriverRequest) -> Result<DriverResponse> {
    if !driver.capabilities().supports(req.method) {
        return Err(driver.unsupported(req.method));
    }

    tracing::debug!(driver = driver.name(), method = req.method.as_str(), href = %req.location.href, "dispatch");
    match req.method {
        DriverMethod::Get => driver.get(req).await,
        DriverMethod::Head => driver.head(req).await,
        DriverMethod::Put => driver.put(req).await,
        DriverMethod::Delete => driver.delete(req).await,
        DriverMethod::List => driver.list(req).await,
    }
}

/// Shared handles every driver may need.
#[derive(Clone)]
pub struct DriverContext {
    pub db: DatabaseConnection,
    pub http: reqwest::Client,
    pub object_store: Arc<dyn ObjectStore>,
    pub content_store: Arc<dyn ContentStore>,
}

impl DriverContext {
    pub fn from_settings(db: DatabaseConnection, http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            db,
            http,
            object_store: Arc::new(FsObjectStore::new(&settings.storage.object_store_root)),
            content_store: Arc::new(FsContentStore::new(&settings.storage.content_store_root)),
        }
    }
}

pub type DriverConstructor = Arc<dyn Fn(&Arc<DriverRegistry>) -> Arc<dyn Driver> + Send + Sync>;

/// Name to constructor table, passed into the gateway at construction.
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
    ctx: DriverContext,
}

impl DriverRegistry {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            constructors: HashMap::new(),
            ctx,
        }
    }

    /// Registry holding the built-in drivers named in `installed`.
    pub fn with_installed(ctx: DriverContext, installed: &[String]) -> Self {
        let mut registry = Self::new(ctx);
        for name in installed {
            let constructor: DriverConstructor = match name.as_str() {
                REDIRECT_DRIVER => Arc::new(|_: &Arc<DriverRegistry>| Arc::new(redirect::RedirectDriver) as Arc<dyn Driver>),
                PROXY_DRIVER => Arc::new(|r: &Arc<DriverRegistry>| {
                    Arc::new(proxy::ProxyDriver::new(r.ctx.http.clone())) as Arc<dyn Driver>
                }),
                MIRROR_DRIVER => Arc::new(|r: &Arc<DriverRegistry>| {
                    Arc::new(mirror::MirrorDriver::new(r.clone())) as Arc<dyn Driver>
                }),
                S3_DRIVER => Arc::new(|r: &Arc<DriverRegistry>| {
                    Arc::new(s3::S3Driver::new(r.ctx.object_store.clone())) as Arc<dyn Driver>
                }),
                IPFS_DRIVER => Arc::new(|r: &Arc<DriverRegistry>| {
                    Arc::new(ipfs::IpfsDriver::new(r.ctx.db.clone(), r.ctx.content_store.clone()))
                        as Arc<dyn Driver>
                }),
                other => {
                    tracing::warn!(driver = %other, "unknown driver, skipped");
                    continue;
                }
            };
            registry.register(name, constructor);
        }
        registry
    }

    pub fn register(&mut self, name: &str, constructor: DriverConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn context(&self) -> &DriverContext {
        &self.ctx
    }

    pub fn create(self: &Arc<Self>, name: &str) -> Result<Arc<dyn Driver>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| MeridianError::MisconfiguredLocation(format!("driver `{name}` is not installed")))?;
        Ok(constructor(self))
    }

    /// Build the driver named by `location.driver`.
    pub fn for_location(self: &Arc<Self>, location: &Location) -> Result<Arc<dyn Driver>> {
        let name = location.driver.as_deref().ok_or_else(|| {
            MeridianError::MisconfiguredLocation(format!("location {} has no driver", location.href))
        })?;
        self.create(name)
    }
}

/// Stored live location with its entity populated.
pub(crate) async fn load_location(db: &DatabaseConnection, href: &str) -> Result<Location> {
    let mut location = storage::get_location_by_href(db, href)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("location {href}")))?;
    storage::populate_entity(db, &mut location).await?;
    Ok(location)
}

/// Read `from` through its driver and write the bytes to `to` through its
/// driver. The two writes are independent; a failed put leaves `from` as is.
pub async fn copy_location(registry: &Arc<DriverRegistry>, from: &str, to: &str) -> Result<DriverResponse> {
    let db = &registry.context().db;
    let source = load_location(db, from).await?;
    let target = load_location(db, to).await?;

    let read = dispatch(
        registry.for_location(&source)?.as_ref(),
        &DriverRequest::new(source, DriverMethod::Get),
    )
    .await?;
    if !(200..300).contains(&read.status) {
        return Err(MeridianError::MisconfiguredLocation(format!(
            "copy source {from} answered {} instead of content",
            read.status
        )));
    }

    let mut headers = HeaderMap::new();
    if let Some(content_type) = read
        .header_value("content-type")
        .and_then(|v| v.parse().ok())
    {
        headers.insert(axum::http::header::CONTENT_TYPE, content_type);
    }

    let request = DriverRequest::new(target, DriverMethod::Put)
        .with_headers(headers)
        .with_body(read.body);
    let written = dispatch(registry.for_location(&request.location)?.as_ref(), &request).await?;
    tracing::info!(from, to, status = written.status, "copied location");
    Ok(written)
}
