//! Scoped access tokens: scope matching, the token endpoint grants, provider
//! federation and request principals.

pub mod grants;
pub mod principal;
pub mod providers;
pub mod scope;
pub mod tokens;

pub use grants::{get_access_token, TokenForm};
pub use principal::Principal;
pub use scope::ScopePatterns;
pub use tokens::{FormalAccessToken, ScopeTokenSearch};
