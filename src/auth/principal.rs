use crate::auth::scope::ScopePatterns;
use crate::errors::{MeridianError, Result};
use crate::settings;
use crate::storage::{self, AccessToken, TokenType};
use axum::http::{header, HeaderMap};
use chrono::Utc;
use sea_orm::DatabaseConnection;

/// The caller behind a request: anonymous, or the holder of a live bearer token.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub token: Option<AccessToken>,
    /// The token's scope patterns, compiled once per request
    scopes: ScopePatterns,
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_token(token: AccessToken) -> Self {
        Self {
            scopes: ScopePatterns::compile_lossy(&token.scope),
            token: Some(token),
        }
    }

    /// Look up the bearer token in `headers`. A token that is unknown, or past
    /// its expiry plus the grace period, is rejected rather than downgraded.
    pub async fn from_headers(
        db: &DatabaseConnection,
        cfg: &settings::Auth,
        headers: &HeaderMap,
    ) -> Result<Self> {
        let Some(secret) = bearer_from_headers(headers) else {
            return Ok(Self::anonymous());
        };

        let token = storage::get_token(db, TokenType::Bearer, secret)
            .await?
            .ok_or(MeridianError::Unauthorized)?;
        if token.expires_at + cfg.authorize_grace_period <= Utc::now().timestamp() {
            return Err(MeridianError::Unauthorized);
        }
        Ok(Self::for_token(token))
    }

    pub fn subject(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.subject.as_str())
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_none()
    }

    fn holds(&self, public: &ScopePatterns, scope: &str) -> bool {
        public.matches(scope) || self.scopes.matches(scope)
    }

    /// Succeed if `scope` is public or carried by the caller's token.
    pub fn authorize(&self, public: &ScopePatterns, scope: &str) -> Result<()> {
        if self.holds(public, scope) {
            Ok(())
        } else if self.is_anonymous() {
            Err(MeridianError::Unauthorized)
        } else {
            Err(MeridianError::NoTokenForScope(scope.to_string()))
        }
    }

    /// Succeed on the first of `scopes` the caller holds.
    pub fn authorize_any<'s>(&self, public: &ScopePatterns, scopes: &'s [String]) -> Result<&'s str> {
        if let Some(found) = scopes.iter().find(|s| self.holds(public, s)) {
            return Ok(found.as_str());
        }
        if self.is_anonymous() {
            Err(MeridianError::Unauthorized)
        } else {
            Err(MeridianError::NoTokenForScope(scopes.join(" ")))
        }
    }

    /// Authorize `verb` against a location's auth groups.
    pub fn authorize_resolve(&self, public: &ScopePatterns, groups: &[String], verb: &str) -> Result<()> {
        let scopes = crate::auth::scope::resolve_scopes(groups, verb);
        match self.authorize_any(public, &scopes) {
            Ok(_) => Ok(()),
            Err(MeridianError::NoTokenForScope(_)) if !groups.is_empty() => {
                Err(MeridianError::UnauthorizedGroup(groups.join(",")))
            }
            Err(e) => Err(e),
        }
    }
}
