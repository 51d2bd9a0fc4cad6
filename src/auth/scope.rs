use crate::errors::{MeridianError, Result};
use crate::storage::{Client, ClientRole, User};
use regex::Regex;

/// A scope pattern matches a requested scope string only as a whole.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| MeridianError::InvalidScope {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

pub fn validate_patterns(patterns: &[String]) -> Result<()> {
    for pattern in patterns {
        compile_pattern(pattern)?;
    }
    Ok(())
}

/// Compiled list of scope patterns.
#[derive(Debug, Clone, Default)]
pub struct ScopePatterns {
    patterns: Vec<Regex>,
}

impl ScopePatterns {
    pub fn compile(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: patterns
                .iter()
                .map(|p| compile_pattern(p))
                .collect::<Result<_>>()?,
        })
    }

    /// Stored patterns that fail to compile are skipped rather than granting anything.
    pub fn compile_lossy(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .filter_map(|p| match compile_pattern(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(pattern = %p, error = %e, "ignoring bad scope pattern");
                        None
                    }
                })
                .collect(),
        }
    }

    pub fn matches(&self, scope: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(scope))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// The requested scopes that both the client's ceiling and the user's own
/// patterns allow, in request order.
pub fn check_scope_permission(requested: &[String], client: &Client, user: &User) -> Vec<String> {
    let ceiling = ScopePatterns::compile_lossy(&client.scope);
    let allowed = ScopePatterns::compile_lossy(&user.scope);

    let mut granted: Vec<String> = Vec::new();
    for scope in requested {
        if ceiling.matches(scope) && allowed.matches(scope) && !granted.contains(scope) {
            granted.push(scope.clone());
        }
    }
    granted
}

/// Scopes as stored on tokens minted for `client`. Provider clients get their
/// scopes namespaced under their own id.
pub fn token_scopes(client: &Client, granted: &[String]) -> Vec<String> {
    if client.has_role(ClientRole::Provider) {
        granted
            .iter()
            .map(|s| format!("{}.{}", client.client_id, s))
            .collect()
    } else {
        granted.to_vec()
    }
}

/// Inverse of [`token_scopes`].
pub fn requested_scopes(client: &Client, stored: &[String]) -> Vec<String> {
    if client.has_role(ClientRole::Provider) {
        let prefix = format!("{}.", client.client_id);
        stored
            .iter()
            .map(|s| s.strip_prefix(&prefix).unwrap_or(s).to_string())
            .collect()
    } else {
        stored.to_vec()
    }
}

/// Split an OAuth2 space-delimited scope parameter.
pub fn parse_scope_param(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Scopes that authorize `verb` on a location with the given auth groups.
/// Any one of them suffices.
pub fn resolve_scopes(groups: &[String], verb: &str) -> Vec<String> {
    if groups.is_empty() {
        vec![format!("resolve.no-group.{verb}")]
    } else {
        groups
            .iter()
            .map(|g| format!("resolve.group.{g}.{verb}"))
            .collect()
    }
}
