use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

pub type Result<T, E = MeridianError> = std::result::Result<T, E>;

#[derive(Debug, Error, Diagnostic)]
pub enum MeridianError {
    #[error("Malformed request: {0}")]
    #[diagnostic(code(meridian::malformed_request))]
    MalformedRequest(String),

    #[error("Invalid mount point: {0}")]
    #[diagnostic(
        code(meridian::invalid_mount_point),
        help("Use a regex literal such as `/^https?:\\/\\/example\\.com\\//i` or a bare regex source")
    )]
    InvalidMountPoint(String),

    #[error("Invalid scope pattern `{pattern}`: {reason}")]
    #[diagnostic(code(meridian::invalid_scope))]
    InvalidScope { pattern: String, reason: String },

    #[error("Invalid regular expression: {0}")]
    #[diagnostic(code(meridian::regex))]
    Regex(#[from] regex::Error),

    #[error("Request body exceeds {0} bytes")]
    #[diagnostic(code(meridian::payload_too_large))]
    PayloadTooLarge(usize),

    #[error("Unsupported grant type `{0}`")]
    #[diagnostic(code(meridian::unsupported_grant_type))]
    UnsupportedGrantType(String),

    #[error("Authentication required")]
    #[diagnostic(code(meridian::unauthorized))]
    Unauthorized,

    #[error("Invalid client")]
    #[diagnostic(code(meridian::invalid_client))]
    InvalidClient,

    #[error("Unknown provider `{0}`")]
    #[diagnostic(code(meridian::unknown_provider))]
    UnknownProvider(String),

    #[error("Invalid credentials")]
    #[diagnostic(code(meridian::invalid_credentials))]
    InvalidCredentials,

    #[error("Invalid grant: {0}")]
    #[diagnostic(code(meridian::invalid_grant))]
    InvalidGrant(String),

    #[error("No access token for scope `{0}`")]
    #[diagnostic(code(meridian::no_token_for_scope))]
    NoTokenForScope(String),

    #[error("Not authorized to access group `{0}`")]
    #[diagnostic(code(meridian::unauthorized_group))]
    UnauthorizedGroup(String),

    #[error("Not authorized to use scope {0:?}")]
    #[diagnostic(code(meridian::not_authorized_scope))]
    NotAuthorizedToUseScope(Vec<String>),

    #[error("Not found: {0}")]
    #[diagnostic(code(meridian::not_found))]
    NotFound(String),

    #[error("Gone: {0}")]
    #[diagnostic(code(meridian::gone))]
    Gone(String),

    #[error("Method {method} not allowed")]
    #[diagnostic(code(meridian::method_not_allowed))]
    MethodNotAllowed {
        method: String,
        allowed: Vec<&'static str>,
    },

    #[error("Misconfigured location: {0}")]
    #[diagnostic(code(meridian::misconfigured_location))]
    MisconfiguredLocation(String),

    #[error("Registration not allowed: {0}")]
    #[diagnostic(code(meridian::registration_not_allowed))]
    RegistrationNotAllowed(String),

    #[error("Conflict: {0}")]
    #[diagnostic(code(meridian::conflict))]
    Conflict(String),

    #[error("Upstream error: {context}")]
    #[diagnostic(code(meridian::upstream))]
    Upstream {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Database error: {0}")]
    #[diagnostic(code(meridian::db))]
    Db(sea_orm::DbErr),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(meridian::serde))]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    #[diagnostic(code(meridian::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(meridian::config))]
    Config(#[from] config::ConfigError),

    #[error("HTTP client error: {0}")]
    #[diagnostic(code(meridian::http))]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    #[diagnostic(code(meridian::other))]
    Other(String),
}

impl From<sea_orm::DbErr> for MeridianError {
    fn from(value: sea_orm::DbErr) -> Self {
        match value.sql_err() {
            Some(sea_orm::SqlErr::UniqueConstraintViolation(detail)) => {
                MeridianError::Conflict(detail)
            }
            _ => MeridianError::Db(value),
        }
    }
}

impl MeridianError {
    pub fn upstream(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        MeridianError::Upstream {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Stable numeric code, independent of the message text.
    pub fn code(&self) -> u32 {
        match self {
            MeridianError::MalformedRequest(_) => 1000,
            MeridianError::InvalidMountPoint(_) => 1001,
            MeridianError::InvalidScope { .. } => 1002,
            MeridianError::UnsupportedGrantType(_) => 1003,
            MeridianError::Regex(_) => 1004,
            MeridianError::PayloadTooLarge(_) => 1005,
            MeridianError::Unauthorized => 2000,
            MeridianError::InvalidClient => 2001,
            MeridianError::UnknownProvider(_) => 2002,
            MeridianError::InvalidCredentials => 2003,
            MeridianError::InvalidGrant(_) => 2004,
            MeridianError::NoTokenForScope(_) => 2005,
            MeridianError::UnauthorizedGroup(_) => 2006,
            MeridianError::NotAuthorizedToUseScope(_) => 2007,
            MeridianError::NotFound(_) => 3000,
            MeridianError::Gone(_) => 3001,
            MeridianError::MethodNotAllowed { .. } => 4000,
            MeridianError::MisconfiguredLocation(_) => 4001,
            MeridianError::RegistrationNotAllowed(_) => 4002,
            MeridianError::Conflict(_) => 4003,
            MeridianError::Upstream { .. } => 5000,
            MeridianError::Db(_) => 5001,
            MeridianError::Serde(_) => 5002,
            MeridianError::Io(_) => 5003,
            MeridianError::Config(_) => 5004,
            MeridianError::Http(_) => 5005,
            MeridianError::Other(_) => 5999,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            MeridianError::MalformedRequest(_)
            | MeridianError::InvalidMountPoint(_)
            | MeridianError::InvalidScope { .. }
            | MeridianError::Regex(_)
            | MeridianError::UnsupportedGrantType(_) => StatusCode::BAD_REQUEST,
            MeridianError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            MeridianError::Unauthorized | MeridianError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            MeridianError::InvalidClient
            | MeridianError::UnknownProvider(_)
            | MeridianError::InvalidGrant(_)
            | MeridianError::NoTokenForScope(_)
            | MeridianError::UnauthorizedGroup(_)
            | MeridianError::NotAuthorizedToUseScope(_) => StatusCode::FORBIDDEN,
            MeridianError::NotFound(_) => StatusCode::NOT_FOUND,
            MeridianError::Gone(_) => StatusCode::GONE,
            MeridianError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            MeridianError::MisconfiguredLocation(_)
            | MeridianError::RegistrationNotAllowed(_)
            | MeridianError::Conflict(_) => StatusCode::CONFLICT,
            MeridianError::Upstream { .. }
            | MeridianError::Db(_)
            | MeridianError::Serde(_)
            | MeridianError::Io(_)
            | MeridianError::Config(_)
            | MeridianError::Http(_)
            | MeridianError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to clients. Internal failures keep their detail in logs only.
    pub fn public_message(&self) -> String {
        match self {
            MeridianError::Db(_) | MeridianError::Io(_) | MeridianError::Config(_) => {
                "internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Log the error once, at the level its status warrants.
    pub fn log(&self) {
        let status = self.status();
        if status.is_server_error() {
            match self {
                MeridianError::Upstream { context, source } => {
                    tracing::error!(code = self.code(), %context, inner = %source, "request failed")
                }
                _ => tracing::error!(code = self.code(), error = %self, "request failed"),
            }
        } else {
            tracing::warn!(code = self.code(), status = status.as_u16(), error = %self, "request rejected");
        }
    }
}

impl IntoResponse for MeridianError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.status();
        let body = json!({
            "code": self.code(),
            "httpCode": status.as_u16(),
            "message": self.public_message(),
        });
        let mut response = (status, Json(body)).into_response();
        if let MeridianError::MethodNotAllowed { allowed, .. } = &self {
            if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
                let headers = response.headers_mut();
                headers.insert(axum::http::header::ALLOW, value.clone());
                headers.insert(HeaderName::from_static("allowed"), value);
            }
        }
        response
    }
}
