use super::db::TestDb;
use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use meridian::settings::Settings;
use meridian::web::{self, AppState};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

pub const TEST_HOST: &str = "gw.test";

/// Gateway wired over a throwaway database and storage directory.
pub struct TestApp {
    pub state: AppState,
    db: TestDb,
    _storage: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_settings(|_| {}).await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let db = TestDb::new().await;
        let storage = TempDir::new().expect("Failed to create storage dir");

        let mut settings = Settings::default();
        settings.server.public_base_url = Some(format!("http://{TEST_HOST}"));
        settings.storage.object_store_root = storage.path().join("objects");
        settings.storage.content_store_root = storage.path().join("content");
        configure(&mut settings);

        let state = AppState::new(settings, db.connection().clone()).expect("Failed to build app state");
        Self {
            state,
            db,
            _storage: storage,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.connection()
    }

    pub fn router(&self) -> Router {
        web::router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router()
            .oneshot(request)
            .await
            .expect("Failed to call router")
    }

    /// `method path` against the test host, optionally with a bearer token.
    pub async fn call(&self, method: &str, path: &str, token: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, TEST_HOST);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty()).expect("Failed to build request"))
            .await
    }

    /// Invoke one RPC method and return the whole envelope.
    pub async fn rpc(&self, token: Option<&str>, method: &str, params: Value) -> Value {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        self.rpc_raw(token, body.to_string()).await
    }

    pub async fn rpc_raw(&self, token: Option<&str>, body: String) -> Value {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = self
            .send(builder.body(Body::from(body)).expect("Failed to build request"))
            .await;
        json_body(response).await
    }
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}

pub fn header_str<'r>(response: &'r Response<Body>, name: &str) -> Option<&'r str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}
