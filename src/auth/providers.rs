use crate::auth::scope;
use crate::errors::{MeridianError, Result};
use crate::settings::{Provider, Settings};
use crate::storage::{self, AuthStateKind, ClientRole, NewUser, User};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

/// Query string of `GET /auth/{provider}/authorize`.
///
/// A consumer starts the dance with `client_id`, `redirect_uri`, `scope` and
/// its own `state`; the provider calls back with `code` and our `state`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeQuery {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderToken {
    access_token: String,
}

pub fn callback_url(settings: &Settings, provider: &str) -> String {
    format!("{}/auth/{}/authorize", settings.public_base_url(), provider)
}

/// Run one leg of the authorization dance and return where to redirect.
pub async fn authorize(
    db: &DatabaseConnection,
    settings: &Settings,
    http: &reqwest::Client,
    provider_name: &str,
    query: &AuthorizeQuery,
) -> Result<String> {
    let provider = settings
        .provider(provider_name)
        .ok_or_else(|| MeridianError::UnknownProvider(provider_name.to_string()))?;

    if let Some(error) = &query.error {
        return Err(MeridianError::upstream(
            format!("provider {provider_name} refused authorization"),
            error.clone(),
        ));
    }

    match (&query.code, &query.state) {
        (Some(code), Some(state)) => callback(db, settings, http, provider, code, state).await,
        _ => start(db, settings, provider, query).await,
    }
}

/// Leg one: remember the consumer's request and send the user to the provider.
async fn start(
    db: &DatabaseConnection,
    settings: &Settings,
    provider: &Provider,
    query: &AuthorizeQuery,
) -> Result<String> {
    let client_id = query
        .client_id
        .as_deref()
        .ok_or_else(|| MeridianError::MalformedRequest("client_id is required".to_string()))?;
    let client = storage::get_client(db, client_id)
        .await?
        .filter(|c| c.has_role(ClientRole::Consumer))
        .ok_or(MeridianError::InvalidClient)?;

    // Codes only ever go back to the URI the client registered.
    let redirect_uri = client.redirect_uri.clone().ok_or(MeridianError::InvalidClient)?;
    if query
        .redirect_uri
        .as_deref()
        .is_some_and(|given| given != redirect_uri)
    {
        return Err(MeridianError::InvalidClient);
    }

    let requested = query
        .scope
        .as_deref()
        .map(scope::parse_scope_param)
        .unwrap_or_default();

    let state = storage::create_auth_state(
        db,
        AuthStateKind::Provider,
        &client.client_id,
        Some(redirect_uri),
        &requested,
        None,
        Some(provider.name.clone()),
        query.state.clone(),
        settings.auth.expire_authorization_code_in,
    )
    .await?;

    let mut url = Url::parse(&provider.authorize_url)
        .map_err(|e| MeridianError::Other(format!("bad authorize_url for {}: {e}", provider.name)))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", &callback_url(settings, &provider.name))
            .append_pair("state", &state.code);
        if let Some(scope) = &provider.scope {
            pairs.append_pair("scope", scope);
        }
    }

    tracing::info!(provider = %provider.name, client_id = %client.client_id, "redirecting to provider");
    Ok(url.to_string())
}

/// Leg two: exchange the provider code, link the identity and hand the
/// consumer an authorization code of our own.
async fn callback(
    db: &DatabaseConnection,
    settings: &Settings,
    http: &reqwest::Client,
    provider: &Provider,
    code: &str,
    state_code: &str,
) -> Result<String> {
    let state = storage::consume_auth_state(db, state_code, AuthStateKind::Provider)
        .await?
        .filter(|s| s.provider.as_deref() == Some(provider.name.as_str()))
        .ok_or_else(|| MeridianError::InvalidGrant("unknown or expired state".to_string()))?;

    let profile = fetch_profile(settings, http, provider, code).await?;
    let provider_user_id = match profile.get(&provider.id_field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(MeridianError::upstream(
                format!("provider {} profile", provider.name),
                format!("missing `{}` field", provider.id_field),
            ))
        }
    };

    let user = link_or_register(db, provider, &state.client_id, &provider_user_id, &profile).await?;

    let code_state = storage::create_auth_state(
        db,
        AuthStateKind::Code,
        &state.client_id,
        state.redirect_uri.clone(),
        &state.scope,
        Some(user.subject.clone()),
        Some(provider.name.clone()),
        None,
        settings.auth.expire_authorization_code_in,
    )
    .await?;

    let redirect_uri = state
        .redirect_uri
        .as_deref()
        .ok_or_else(|| MeridianError::InvalidGrant("state has no redirect_uri".to_string()))?;
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| MeridianError::MalformedRequest(format!("bad redirect_uri: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", &code_state.code);
        if let Some(client_state) = &state.client_state {
            pairs.append_pair("state", client_state);
        }
    }

    tracing::info!(provider = %provider.name, subject = %user.subject, "provider login complete");
    Ok(url.to_string())
}

async fn fetch_profile(
    settings: &Settings,
    http: &reqwest::Client,
    provider: &Provider,
    code: &str,
) -> Result<Value> {
    let context = format!("provider {} token exchange", provider.name);
    let callback = callback_url(settings, &provider.name);

    let token: ProviderToken = http
        .post(&provider.token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", callback.as_str()),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
        ])
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| MeridianError::upstream(context.clone(), e))?
        .json()
        .await
        .map_err(|e| MeridianError::upstream(context, e))?;

    let context = format!("provider {} userinfo", provider.name);
    http.get(&provider.userinfo_url)
        .bearer_auth(&token.access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| MeridianError::upstream(context.clone(), e))?
        .json()
        .await
        .map_err(|e| MeridianError::upstream(context, e))
}

async fn link_or_register(
    db: &DatabaseConnection,
    provider: &Provider,
    client_id: &str,
    provider_user_id: &str,
    profile: &Value,
) -> Result<User> {
    if let Some(user) = storage::find_user_by_identity(db, &provider.name, provider_user_id).await? {
        return Ok(user);
    }

    let client = storage::get_client(db, client_id)
        .await?
        .ok_or(MeridianError::InvalidClient)?;
    if !client.has_role(ClientRole::Registration) {
        return Err(MeridianError::RegistrationNotAllowed(format!(
            "client {client_id} may not register {} users",
            provider.name
        )));
    }

    let user = storage::create_user(
        db,
        NewUser {
            username: format!("{}:{}", provider.name, provider_user_id),
            password: None,
            scope: provider.default_user_scope.clone(),
        },
    )
    .await?;
    storage::link_identity(db, &user.subject, &provider.name, provider_user_id, profile).await?;
    tracing::info!(provider = %provider.name, subject = %user.subject, "registered federated user");

    storage::get_user(db, &user.subject)
        .await?
        .ok_or_else(|| MeridianError::NotFound(format!("user {}", user.subject)))
}
