mod helpers;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use helpers::{header_str, json_body, ClientBuilder, TestApp};
use meridian::settings::Provider;
use meridian::storage::{self, ClientRole};
use serde_json::json;
use url::Url;

/// Minimal OAuth2 provider: any code buys a token, the token reveals user 42.
async fn start_provider() -> String {
    let app = Router::new()
        .route(
            "/token",
            post(|| async { Json(json!({ "access_token": "upstream-token", "token_type": "bearer" })) }),
        )
        .route(
            "/userinfo",
            get(|| async { Json(json!({ "id": 42, "login": "octo" })) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind provider");
    let addr = listener.local_addr().expect("Failed to read provider addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

async fn federated_app(provider_base: &str) -> TestApp {
    let provider = Provider {
        name: "octo".to_string(),
        authorize_url: format!("{provider_base}/authorize"),
        token_url: format!("{provider_base}/token"),
        userinfo_url: format!("{provider_base}/userinfo"),
        client_id: "gateway".to_string(),
        client_secret: "upstream-secret".to_string(),
        scope: Some("read:user".to_string()),
        id_field: "id".to_string(),
        default_user_scope: vec![r"rpc\.findLocations".to_string()],
    };
    TestApp::with_settings(move |s| s.providers.push(provider)).await
}

fn query_param(location: &str, name: &str) -> Option<String> {
    Url::parse(location)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Walk both legs of the dance and return the consumer-facing redirect.
async fn authorize(app: &TestApp, client_id: &str) -> axum::http::Response<axum::body::Body> {
    let start = app
        .call(
            "GET",
            &format!("/auth/octo/authorize?client_id={client_id}&scope=rpc.findLocations&state=consumer-state"),
            None,
        )
        .await;
    assert_eq!(start.status(), StatusCode::FOUND);
    let to_provider = header_str(&start, "location").expect("provider redirect").to_string();
    assert_eq!(query_param(&to_provider, "client_id").as_deref(), Some("gateway"));
    assert_eq!(query_param(&to_provider, "scope").as_deref(), Some("read:user"));
    assert_eq!(
        query_param(&to_provider, "redirect_uri").as_deref(),
        Some("http://gw.test/auth/octo/authorize")
    );
    let state = query_param(&to_provider, "state").expect("state param");

    app.call(
        "GET",
        &format!("/auth/octo/authorize?code=upstream-code&state={state}"),
        None,
    )
    .await
}

#[tokio::test]
async fn test_registration_client_completes_the_dance() {
    let provider = start_provider().await;
    let app = federated_app(&provider).await;
    ClientBuilder::new("webapp")
        .with_redirect_uri("http://app.test/callback")
        .with_roles(&[ClientRole::Consumer, ClientRole::Registration])
        .create(app.db())
        .await;

    let back = authorize(&app, "webapp").await;
    assert_eq!(back.status(), StatusCode::FOUND);
    let to_consumer = header_str(&back, "location").expect("consumer redirect").to_string();
    assert!(to_consumer.starts_with("http://app.test/callback?"));
    assert_eq!(query_param(&to_consumer, "state").as_deref(), Some("consumer-state"));
    let code = query_param(&to_consumer, "code").expect("code param");

    let user = storage::find_user_by_identity(app.db(), "octo", "42")
        .await
        .unwrap()
        .expect("federated user registered");
    assert_eq!(user.username, "octo:42");

    // The code buys a token through the regular endpoint.
    let token = app
        .send(
            axum::http::Request::builder()
                .method("POST")
                .uri("/auth/token")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({
                        "grant_type": "authorization_code",
                        "client_id": "webapp",
                        "client_secret": "secret",
                        "redirect_uri": "http://app.test/callback",
                        "code": code,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(token.status(), StatusCode::OK);
    assert_eq!(json_body(token).await["scope"], "rpc.findLocations");
}

#[tokio::test]
async fn test_known_identity_logs_in_again() {
    let provider = start_provider().await;
    let app = federated_app(&provider).await;
    ClientBuilder::new("webapp")
        .with_redirect_uri("http://app.test/callback")
        .with_roles(&[ClientRole::Consumer, ClientRole::Registration])
        .create(app.db())
        .await;

    assert_eq!(authorize(&app, "webapp").await.status(), StatusCode::FOUND);
    assert_eq!(authorize(&app, "webapp").await.status(), StatusCode::FOUND);

    let users = storage::find_users(app.db(), Some("octo:42".to_string()))
        .await
        .unwrap();
    assert_eq!(users.len(), 1);
}

#[tokio::test]
async fn test_registration_requires_role() {
    let provider = start_provider().await;
    let app = federated_app(&provider).await;
    ClientBuilder::new("readonly")
        .with_redirect_uri("http://app.test/callback")
        .create(app.db())
        .await;

    let back = authorize(&app, "readonly").await;
    assert_eq!(back.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(back).await["code"], 4002);
}

#[tokio::test]
async fn test_unknown_provider() {
    let app = TestApp::new().await;

    let response = app
        .call("GET", "/auth/nobody/authorize?client_id=x", None)
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], 2002);
}

#[tokio::test]
async fn test_replayed_state_is_rejected() {
    let provider = start_provider().await;
    let app = federated_app(&provider).await;
    ClientBuilder::new("webapp")
        .with_redirect_uri("http://app.test/callback")
        .with_roles(&[ClientRole::Consumer, ClientRole::Registration])
        .create(app.db())
        .await;

    let response = app
        .call("GET", "/auth/octo/authorize?code=c&state=forged", None)
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], 2004);
}

#[tokio::test]
async fn test_client_without_registered_redirect_is_refused() {
    let provider = start_provider().await;
    let app = federated_app(&provider).await;
    ClientBuilder::new("open")
        .with_roles(&[ClientRole::Consumer, ClientRole::Registration])
        .create(app.db())
        .await;

    let response = app
        .call(
            "GET",
            "/auth/octo/authorize?client_id=open&redirect_uri=http%3A%2F%2Fattacker.test%2Fcb&state=s",
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(header_str(&response, "location").is_none());
    assert_eq!(json_body(response).await["code"], 2001);
}

#[tokio::test]
async fn test_mismatched_redirect_is_refused() {
    let provider = start_provider().await;
    let app = federated_app(&provider).await;
    ClientBuilder::new("webapp")
        .with_redirect_uri("http://app.test/callback")
        .create(app.db())
        .await;

    let response = app
        .call(
            "GET",
            "/auth/octo/authorize?client_id=webapp&redirect_uri=http%3A%2F%2Fattacker.test%2Fcb",
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], 2001);
}
