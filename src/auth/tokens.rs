use crate::auth::scope::{self, ScopePatterns};
use crate::errors::Result;
use crate::settings;
use crate::storage::{self, AccessToken, Client, TokenType, User};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A bearer token together with the refresh token it is linked to.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub bearer: AccessToken,
    pub refresh: AccessToken,
}

/// OAuth2 token endpoint response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormalAccessToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub scope: String,
    pub token_type: String,
}

impl From<&TokenPair> for FormalAccessToken {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: pair.bearer.token.clone(),
            refresh_token: pair.refresh.token.clone(),
            expires_in: (pair.bearer.expires_at - Utc::now().timestamp()).max(0),
            scope: pair.bearer.scope.join(" "),
            token_type: "bearer".to_string(),
        }
    }
}

/// New bearer linked to `refresh`; the refresh token is re-pointed at it.
pub async fn derive_bearer(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    refresh: &AccessToken,
) -> Result<AccessToken> {
    let bearer = storage::insert_token(
        db,
        TokenType::Bearer,
        &refresh.client_id,
        &refresh.subject,
        &refresh.scope,
        cfg.expire_token_in,
        Some(refresh.id.clone()),
    )
    .await?;
    storage::set_linked_token(db, &refresh.id, &bearer.id).await?;
    Ok(bearer)
}

/// Mint a bearer+refresh pair for `granted`, reusing a live refresh token
/// already issued for the same client, user and scope.
pub async fn issue_token_pair(
    db: &DatabaseConnection,
    cfg: &settings::Auth,
    client: &Client,
    subject: &str,
    granted: &[String],
) -> Result<TokenPair> {
    let stored_scope = scope::token_scopes(client, granted);

    let refresh = match storage::find_reusable_refresh_token(
        db,
        &client.client_id,
        subject,
        &stored_scope,
    )
    .await?
    {
        Some(existing) => {
            tracing::debug!(client_id = %client.client_id, "reusing refresh token");
            existing
        }
        None => {
            storage::insert_token(
                db,
                TokenType::Refresh,
                &client.client_id,
                subject,
                &stored_scope,
                cfg.expire_refresh_token_in,
                None,
            )
            .await?
        }
    };

    let bearer = derive_bearer(db, cfg, &refresh).await?;
    let refresh = AccessToken {
        linked_token: Some(bearer.id.clone()),
        ..refresh
    };
    Ok(TokenPair { bearer, refresh })
}

/// Token that stands for scopes the user holds by their own patterns.
fn implicit_token(user: &User, scope: &str) -> AccessToken {
    AccessToken {
        id: format!("implicit:{scope}"),
        token_type: TokenType::Bearer,
        token: String::new(),
        scope: vec![scope.to_string()],
        client_id: String::new(),
        subject: user.subject.clone(),
        linked_token: None,
        expires_at: i64::MAX,
        created_at: Utc::now().timestamp(),
    }
}

/// Lazy search for tokens that cover a set of requested scopes.
///
/// Scopes the user's own patterns already grant come first, as implicit
/// tokens. Only if scopes remain after that are stored tokens queried, newest
/// expiry first; each yielded token covers at least one scope that no earlier
/// token covered. A matching refresh token is exchanged for a fresh bearer
/// before it is yielded.
pub struct ScopeTokenSearch<'a> {
    db: &'a DatabaseConnection,
    cfg: &'a settings::Auth,
    user: &'a User,
    implicit: VecDeque<AccessToken>,
    remaining: Vec<String>,
    stored: Option<VecDeque<AccessToken>>,
}

impl<'a> ScopeTokenSearch<'a> {
    pub fn new(
        db: &'a DatabaseConnection,
        cfg: &'a settings::Auth,
        user: &'a User,
        requested: &[String],
    ) -> Self {
        let own = ScopePatterns::compile_lossy(&user.scope);
        let mut implicit = VecDeque::new();
        let mut remaining = Vec::new();
        for scope in requested {
            if own.matches(scope) {
                implicit.push_back(implicit_token(user, scope));
            } else if !remaining.contains(scope) {
                remaining.push(scope.clone());
            }
        }

        Self {
            db,
            cfg,
            user,
            implicit,
            remaining,
            stored: None,
        }
    }

    /// Skip the implicit phase and consider stored tokens only.
    pub fn stored_only(mut self) -> Self {
        for token in self.implicit.drain(..) {
            for scope in token.scope {
                if !self.remaining.contains(&scope) {
                    self.remaining.push(scope);
                }
            }
        }
        self
    }

    /// Requested scopes not yet covered by anything yielded.
    pub fn remaining(&self) -> &[String] {
        &self.remaining
    }

    pub async fn next(&mut self) -> Result<Option<AccessToken>> {
        if let Some(token) = self.implicit.pop_front() {
            return Ok(Some(token));
        }
        if self.remaining.is_empty() {
            return Ok(None);
        }

        if self.stored.is_none() {
            let now = Utc::now().timestamp();
            let tokens = storage::live_tokens_for_subject(self.db, &self.user.subject, now).await?;
            self.stored = Some(tokens.into());
        }

        while let Some(token) = self.stored.as_mut().and_then(VecDeque::pop_front) {
            let patterns = ScopePatterns::compile_lossy(&token.scope);
            let before = self.remaining.len();
            self.remaining.retain(|scope| !patterns.matches(scope));
            if self.remaining.len() == before {
                continue;
            }

            return match token.token_type {
                TokenType::Bearer => Ok(Some(token)),
                TokenType::Refresh => Ok(Some(derive_bearer(self.db, self.cfg, &token).await?)),
            };
        }
        Ok(None)
    }

    pub async fn collect(mut self) -> Result<Vec<AccessToken>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next().await? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ClientRole, NewClient, NewUser};
    use crate::test_support::TestDb;

    async fn seed(db: &DatabaseConnection, user_scope: &[&str]) -> (Client, User) {
        let client = storage::create_client(
            db,
            NewClient {
                roles: vec![ClientRole::Consumer],
                scope: vec![".*".to_string()],
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create client");
        let user = storage::create_user(
            db,
            NewUser {
                username: "alice".to_string(),
                password: None,
                scope: user_scope.iter().map(|s| s.to_string()).collect(),
            },
        )
        .await
        .expect("Failed to create user");
        (client, user)
    }

    #[tokio::test]
    async fn test_issue_pair_links_both_ways() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let (client, user) = seed(db, &[".*"]).await;

        let pair = issue_token_pair(db, &cfg, &client, &user.subject, &["a".to_string()])
            .await
            .expect("Failed to issue");

        assert_eq!(pair.bearer.linked_token.as_deref(), Some(pair.refresh.id.as_str()));
        assert_eq!(pair.refresh.linked_token.as_deref(), Some(pair.bearer.id.as_str()));

        let stored_refresh = storage::get_token_by_id(db, &pair.refresh.id)
            .await
            .unwrap()
            .expect("refresh stored");
        assert_eq!(stored_refresh.linked_token, Some(pair.bearer.id.clone()));

        let formal = FormalAccessToken::from(&pair);
        assert_eq!(formal.token_type, "bearer");
        assert_eq!(formal.scope, "a");
        assert!(formal.expires_in > 0);
    }

    #[tokio::test]
    async fn test_refresh_token_is_reused_for_same_triple() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let (client, user) = seed(db, &[".*"]).await;
        let scope = vec!["a".to_string()];

        let first = issue_token_pair(db, &cfg, &client, &user.subject, &scope)
            .await
            .unwrap();
        let second = issue_token_pair(db, &cfg, &client, &user.subject, &scope)
            .await
            .unwrap();
        let other = issue_token_pair(db, &cfg, &client, &user.subject, &["b".to_string()])
            .await
            .unwrap();

        assert_eq!(first.refresh.id, second.refresh.id);
        assert_ne!(first.bearer.id, second.bearer.id);
        assert_ne!(first.refresh.id, other.refresh.id);
    }

    #[tokio::test]
    async fn test_implicit_scopes_skip_the_query() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let (_, user) = seed(db, &[r"resolve\.no-group\.get"]).await;

        let mut search = ScopeTokenSearch::new(db, &cfg, &user, &["resolve.no-group.get".to_string()]);
        let token = search.next().await.unwrap().expect("implicit token");
        assert!(token.id.starts_with("implicit:"));
        assert!(search.next().await.unwrap().is_none());
        assert!(search.stored.is_none());
    }

    #[tokio::test]
    async fn test_stored_tokens_cover_remaining_scopes() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let (client, user) = seed(db, &[]).await;

        let pair = issue_token_pair(
            db,
            &cfg,
            &client,
            &user.subject,
            &["resolve.no-group.get".to_string()],
        )
        .await
        .unwrap();

        let found = ScopeTokenSearch::new(db, &cfg, &user, &["resolve.no-group.get".to_string()])
            .collect()
            .await
            .unwrap();
        // The refresh token expires last, so it is matched first and exchanged.
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].token_type, TokenType::Bearer);
        assert_eq!(found[0].scope, vec!["resolve.no-group.get".to_string()]);
        assert_eq!(found[0].linked_token, Some(pair.refresh.id));

        let none = ScopeTokenSearch::new(db, &cfg, &user, &["resolve.no-group.put".to_string()])
            .collect()
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_matching_refresh_token_yields_fresh_bearer() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let (_, user) = seed(db, &[]).await;

        let refresh = storage::insert_token(
            db,
            TokenType::Refresh,
            "c",
            &user.subject,
            &["x".to_string()],
            100,
            None,
        )
        .await
        .unwrap();

        let mut search = ScopeTokenSearch::new(db, &cfg, &user, &["x".to_string()]);
        let token = search.next().await.unwrap().expect("derived bearer");
        assert_eq!(token.token_type, TokenType::Bearer);
        assert_eq!(token.linked_token, Some(refresh.id));
        assert!(search.remaining().is_empty());
    }

    #[tokio::test]
    async fn test_stored_only_ignores_own_patterns() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();
        let cfg = settings::Auth::default();
        let (_, user) = seed(db, &[".*"]).await;

        let tokens = ScopeTokenSearch::new(db, &cfg, &user, &["x".to_string()])
            .stored_only()
            .collect()
            .await
            .unwrap();
        assert!(tokens.is_empty());
    }
}
