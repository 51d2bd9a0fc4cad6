use crate::auth::scope::{self, ScopePatterns};
use crate::auth::tokens::{self, FormalAccessToken, TokenPair};
use crate::errors::{MeridianError, Result};
use crate::settings;
use crate::storage::{self, AuthStateKind, Client, ClientRole, User};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Deserializer, Serialize};

/// Token request, as posted to `/auth/token` or passed to `getAccessToken`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default, deserialize_with = "deserialize_scope")]
    pub scope: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Accepts a space-delimited string or a list.
fn deserialize_scope<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ScopeParam {
        Delimited(String),
        List(Vec<String>),
    }

    Ok(match Option::<ScopeParam>::deserialize(deserializer)? {
        Some(ScopeParam::Delimited(s)) => scope::parse_scope_param(&s),
        Some(ScopeParam::List(list)) => list,
        None => Vec::new(),
    })
}

fn require<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MeridianError::MalformedRequest(format!("{field} is required")))
}

/// Validate the client part of the form, then run the grant-specific handler.
pub async fn get_access_token(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    form: &TokenForm,
) -> Result<FormalAccessToken> {
    let grant_type = require(&form.grant_type, "grant_type")?;
    let client_id = require(&form.client_id, "client_id")?;
    let client_secret = require(&form.client_secret, "client_secret")?;

    let client = match storage::get_client(db, client_id).await? {
        Some(c) if c.client_secret == client_secret && c.has_role(ClientRole::Consumer) => c,
        _ => return Err(MeridianError::InvalidClient),
    };
    check_redirect_uri(cfg, &client, form.redirect_uri.as_deref())?;

    let pair = match grant_type {
        "client_credentials" => client_credentials(db, cfg, &client, form).await?,
        "password" => password(db, cfg, &client, form).await?,
        "authorization_code" => authorization_code(db, cfg, &client, form).await?,
        "refresh_token" => refresh_token(db, cfg, &client, form).await?,
        other => return Err(MeridianError::UnsupportedGrantType(other.to_string())),
    };

    tracing::info!(
        client_id = %client.client_id,
        subject = %pair.bearer.subject,
        grant_type,
        "issued access token"
    );
    Ok(FormalAccessToken::from(&pair))
}

fn check_redirect_uri(cfg: &settings::Auth, client: &Client, given: Option<&str>) -> Result<()> {
    match (given, client.redirect_uri.as_deref()) {
        (Some(given), Some(registered)) if given == registered => Ok(()),
        (Some(_), _) => Err(MeridianError::InvalidClient),
        (None, _) if cfg.allow_get_token_with_no_redirect_uri => Ok(()),
        (None, _) => Err(MeridianError::MalformedRequest(
            "redirect_uri is required".to_string(),
        )),
    }
}

/// Grant what both the client and the user allow, or refuse outright.
async fn grant(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    client: &Client,
    user: &User,
    requested: &[String],
) -> Result<TokenPair> {
    if user.disabled {
        return Err(MeridianError::InvalidGrant(format!(
            "user {} is disabled",
            user.username
        )));
    }
    if requested.is_empty() {
        return Err(MeridianError::MalformedRequest("scope is required".to_string()));
    }

    let granted = scope::check_scope_permission(requested, client, user);
    if granted.is_empty() {
        return Err(MeridianError::NoTokenForScope(requested.join(" ")));
    }
    tokens::issue_token_pair(db, cfg, client, &user.subject, &granted).await
}

async fn client_credentials(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    client: &Client,
    form: &TokenForm,
) -> Result<TokenPair> {
    let user = match form.username.as_deref().filter(|u| !u.is_empty()) {
        Some(username) => {
            let needed = format!("auth.user.{username}");
            if !ScopePatterns::compile_lossy(&client.scope).matches(&needed) {
                return Err(MeridianError::NotAuthorizedToUseScope(vec![needed]));
            }
            storage::get_user_by_username(db, username)
                .await?
                .ok_or_else(|| MeridianError::InvalidGrant(format!("unknown user {username}")))?
        }
        None => {
            let subject = client.default_user.as_deref().ok_or_else(|| {
                MeridianError::InvalidGrant("client has no default user".to_string())
            })?;
            storage::get_user(db, subject)
                .await?
                .ok_or_else(|| MeridianError::InvalidGrant("default user is gone".to_string()))?
        }
    };

    grant(db, cfg, client, &user, &form.scope).await
}

async fn password(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    client: &Client,
    form: &TokenForm,
) -> Result<TokenPair> {
    let username = require(&form.username, "username")?;
    let password = require(&form.password, "password")?;

    let user = storage::verify_user_password(db, username, password)
        .await?
        .ok_or(MeridianError::InvalidCredentials)?;

    grant(db, cfg, client, &user, &form.scope).await
}

async fn authorization_code(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    client: &Client,
    form: &TokenForm,
) -> Result<TokenPair> {
    let code = require(&form.code, "code")?;

    let state = storage::consume_auth_state(db, code, AuthStateKind::Code)
        .await?
        .ok_or_else(|| MeridianError::InvalidGrant("unknown or expired code".to_string()))?;
    if state.client_id != client.client_id {
        return Err(MeridianError::InvalidGrant(
            "code was issued to another client".to_string(),
        ));
    }
    if let (Some(expected), Some(given)) = (state.redirect_uri.as_deref(), form.redirect_uri.as_deref()) {
        if expected != given {
            return Err(MeridianError::InvalidGrant("redirect_uri mismatch".to_string()));
        }
    }

    let subject = state
        .subject
        .as_deref()
        .ok_or_else(|| MeridianError::InvalidGrant("code has no user".to_string()))?;
    let user = storage::get_user(db, subject)
        .await?
        .ok_or_else(|| MeridianError::InvalidGrant("user is gone".to_string()))?;

    let requested = if form.scope.is_empty() {
        state.scope.clone()
    } else {
        form.scope
            .iter()
            .filter(|s| state.scope.contains(s))
            .cloned()
            .collect()
    };
    grant(db, cfg, client, &user, &requested).await
}

/// Derive a new bearer from a stored refresh token. The refresh token itself
/// is kept, even when expired, and re-pointed at the new bearer.
async fn refresh_token(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    client: &Client,
    form: &TokenForm,
) -> Result<TokenPair> {
    let token = require(&form.refresh_token, "refresh_token")?;

    let refresh = storage::find_refresh_token(db, &client.client_id, token)
        .await?
        .ok_or_else(|| MeridianError::InvalidGrant("unknown refresh token".to_string()))?;
    let user = storage::get_user(db, &refresh.subject)
        .await?
        .ok_or_else(|| MeridianError::InvalidGrant("user is gone".to_string()))?;
    if user.disabled {
        return Err(MeridianError::InvalidGrant(format!(
            "user {} is disabled",
            user.username
        )));
    }

    let requested = scope::requested_scopes(client, &refresh.scope);
    let granted = scope::check_scope_permission(&requested, client, &user);
    let refused: Vec<String> = requested
        .into_iter()
        .filter(|s| !granted.contains(s))
        .collect();
    if !refused.is_empty() {
        return Err(MeridianError::NotAuthorizedToUseScope(refused));
    }

    let bearer = tokens::derive_bearer(db, cfg, &refresh).await?;
    let refresh = storage::AccessToken {
        linked_token: Some(bearer.id.clone()),
        ..refresh
    };
    Ok(TokenPair { bearer, refresh })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewClient, NewUser, TokenType};
    use crate::test_support::TestDb;

    async fn consumer(db: &DatabaseConnection, scope: &[&str], default_user: Option<String>) -> Client {
        storage::create_client(
            db,
            NewClient {
                client_id: Some("app".to_string()),
                client_secret: Some("s3cret".to_string()),
                redirect_uri: Some("http://app/cb".to_string()),
                roles: vec![ClientRole::Consumer],
                scope: scope.iter().map(|s| s.to_string()).collect(),
                default_user,
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create client")
    }

    async fn user(db: &DatabaseConnection, username: &str, scope: &[&str]) -> User {
        storage::create_user(
            db,
            NewUser {
                username: username.to_string(),
                password: Some("password123".to_string()),
                scope: scope.iter().map(|s| s.to_string()).collect(),
            },
        )
        .await
        .expect("Failed to create user")
    }

    fn form(grant_type: &str, scope: &[&str]) -> TokenForm {
        TokenForm {
            grant_type: Some(grant_type.to_string()),
            client_id: Some("app".to_string()),
            client_secret: Some("s3cret".to_string()),
            scope: scope.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_fields_are_malformed() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();

        let mut f = form("client_credentials", &["a"]);
        f.client_secret = None;
        let err = get_access_token(db, &cfg, &f).await.unwrap_err();
        assert!(matches!(err, MeridianError::MalformedRequest(_)));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_invalid_client() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        consumer(db, &[".*"], None).await;

        let mut f = form("client_credentials", &["a"]);
        f.client_secret = Some("nope".to_string());
        assert!(matches!(
            get_access_token(db, &cfg, &f).await,
            Err(MeridianError::InvalidClient)
        ));
    }

    #[tokio::test]
    async fn test_redirect_uri_must_match_when_given() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let u = user(db, "alice", &[".*"]).await;
        consumer(db, &[".*"], Some(u.subject)).await;

        let mut f = form("client_credentials", &["a"]);
        f.redirect_uri = Some("http://evil/cb".to_string());
        let cfg = settings::Auth::default();
        assert!(matches!(
            get_access_token(db, &cfg, &f).await,
            Err(MeridianError::InvalidClient)
        ));

        let strict = settings::Auth {
            allow_get_token_with_no_redirect_uri: false,
            ..Default::default()
        };
        assert!(matches!(
            get_access_token(db, &strict, &form("client_credentials", &["a"])).await,
            Err(MeridianError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_grant_type() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        consumer(db, &[".*"], None).await;

        assert!(matches!(
            get_access_token(db, &cfg, &form("implicit", &["a"])).await,
            Err(MeridianError::UnsupportedGrantType(_))
        ));
    }

    #[tokio::test]
    async fn test_client_credentials_with_default_user() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let u = user(db, "alice", &[r"resolve\.no-group\..*"]).await;
        consumer(db, &[r"resolve\..*"], Some(u.subject.clone())).await;

        let token = get_access_token(
            db,
            &cfg,
            &form("client_credentials", &["resolve.no-group.get", "rpc.resolve"]),
        )
        .await
        .expect("Failed to get token");

        assert_eq!(token.scope, "resolve.no-group.get");
        assert_eq!(token.token_type, "bearer");

        let stored = storage::get_token(db, TokenType::Bearer, &token.access_token)
            .await
            .unwrap()
            .expect("bearer stored");
        assert_eq!(stored.subject, u.subject);
    }

    #[tokio::test]
    async fn test_client_credentials_with_named_user_needs_client_scope() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        user(db, "bob", &[".*"]).await;
        consumer(db, &[r"resolve\..*"], None).await;

        let mut f = form("client_credentials", &["resolve.no-group.get"]);
        f.username = Some("bob".to_string());
        assert!(matches!(
            get_access_token(db, &cfg, &f).await,
            Err(MeridianError::NotAuthorizedToUseScope(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_grant_is_forbidden() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let u = user(db, "alice", &[r"resolve\.no-group\.get"]).await;
        consumer(db, &[".*"], Some(u.subject)).await;

        let err = get_access_token(db, &cfg, &form("client_credentials", &["rpc.resolve"]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_password_grant() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        user(db, "alice", &[".*"]).await;
        consumer(db, &[".*"], None).await;

        let mut f = form("password", &["a", "b"]);
        f.username = Some("alice".to_string());
        f.password = Some("password123".to_string());
        let token = get_access_token(db, &cfg, &f).await.expect("Failed to get token");
        assert_eq!(token.scope, "a b");

        f.password = Some("wrong".to_string());
        assert!(matches!(
            get_access_token(db, &cfg, &f).await,
            Err(MeridianError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_authorization_code_grant() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let u = user(db, "alice", &[".*"]).await;
        consumer(db, &[".*"], None).await;

        let state = storage::create_auth_state(
            db,
            AuthStateKind::Code,
            "app",
            Some("http://app/cb".to_string()),
            &["a".to_string()],
            Some(u.subject.clone()),
            None,
            None,
            60,
        )
        .await
        .unwrap();

        let mut f = form("authorization_code", &[]);
        f.code = Some(state.code.clone());
        f.redirect_uri = Some("http://app/cb".to_string());
        let token = get_access_token(db, &cfg, &f).await.expect("Failed to redeem");
        assert_eq!(token.scope, "a");

        assert!(matches!(
            get_access_token(db, &cfg, &f).await,
            Err(MeridianError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn test_authorization_code_for_other_client_is_rejected() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let u = user(db, "alice", &[".*"]).await;
        consumer(db, &[".*"], None).await;

        let state = storage::create_auth_state(
            db,
            AuthStateKind::Code,
            "someone-else",
            None,
            &["a".to_string()],
            Some(u.subject),
            None,
            None,
            60,
        )
        .await
        .unwrap();

        let mut f = form("authorization_code", &[]);
        f.code = Some(state.code);
        assert!(matches!(
            get_access_token(db, &cfg, &f).await,
            Err(MeridianError::InvalidGrant(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_grant_on_expired_refresh_token() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let u = user(db, "alice", &[".*"]).await;
        consumer(db, &[".*"], None).await;

        let refresh = storage::insert_token(
            db,
            TokenType::Refresh,
            "app",
            &u.subject,
            &["a".to_string()],
            -60,
            None,
        )
        .await
        .unwrap();
        let original = storage::insert_token(
            db,
            TokenType::Bearer,
            "app",
            &u.subject,
            &["a".to_string()],
            -60,
            Some(refresh.id.clone()),
        )
        .await
        .unwrap();

        let mut f = form("refresh_token", &[]);
        f.refresh_token = Some(refresh.token.clone());
        let token = get_access_token(db, &cfg, &f).await.expect("Failed to refresh");

        assert_eq!(token.refresh_token, refresh.token);
        let bearer = storage::get_token(db, TokenType::Bearer, &token.access_token)
            .await
            .unwrap()
            .expect("new bearer stored");
        assert_ne!(bearer.id, original.id);
        assert_eq!(bearer.linked_token, original.linked_token);
    }

    #[tokio::test]
    async fn test_refresh_grant_rechecks_scope() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let u = user(db, "alice", &["a"]).await;
        consumer(db, &[".*"], None).await;

        let refresh = storage::insert_token(
            db,
            TokenType::Refresh,
            "app",
            &u.subject,
            &["a".to_string(), "b".to_string()],
            60,
            None,
        )
        .await
        .unwrap();

        let mut f = form("refresh_token", &[]);
        f.refresh_token = Some(refresh.token);
        match get_access_token(db, &cfg, &f).await {
            Err(MeridianError::NotAuthorizedToUseScope(refused)) => {
                assert_eq!(refused, vec!["b".to_string()])
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_scope_accepts_string_or_list() {
        let from_string: TokenForm =
            serde_json::from_str(r#"{"grant_type": "password", "scope": "a b"}"#).unwrap();
        let from_list: TokenForm =
            serde_json::from_str(r#"{"grant_type": "password", "scope": ["a", "b"]}"#).unwrap();
        assert_eq!(from_string.scope, from_list.scope);

        let none: TokenForm = serde_json::from_str(r#"{"grant_type": "password"}"#).unwrap();
        assert!(none.scope.is_empty());
    }
}
