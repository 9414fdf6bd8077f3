use crate::consent::ConsentError;
use crate::grants::GrantError;
use crate::pending::PendingError;
use crate::storage::StorageError;
use crate::token::TokenError;
use axum::response::IntoResponse;
use axum::Json;
use http::StatusCode;
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

/// Error body of the OAuth endpoints (RFC 6749 section 5.2)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OAuthError {
    #[serde(skip)]
    pub status: StatusCode,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl OAuthError {
    pub fn new<S: ToString>(status: StatusCode, error: &str, description: S) -> Self {
        Self {
            status,
            error: error.to_string(),
            error_description: Some(description.to_string()),
        }
    }

    pub fn invalid_request<S: ToString>(description: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", description)
    }

    pub fn invalid_request_uri<S: ToString>(status: StatusCode, description: S) -> Self {
        Self::new(status, "invalid_request_uri", description)
    }

    pub fn invalid_grant_id<S: ToString>(status: StatusCode, description: S) -> Self {
        Self::new(status, "invalid_grant_id", description)
    }

    pub fn invalid_grant<S: ToString>(description: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_grant", description)
    }

    pub fn unsupported_grant_type<S: ToString>(description: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unsupported_grant_type", description)
    }

    /// Logs the underlying failure, the client only sees a generic message
    pub fn server_error<E: std::fmt::Display>(err: E) -> Self {
        error!("Server error: {err}");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "the server failed to process the request",
        )
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<StorageError> for OAuthError {
    fn from(err: StorageError) -> Self {
        Self::server_error(err)
    }
}

impl From<PendingError> for OAuthError {
    fn from(err: PendingError) -> Self {
        match err {
            PendingError::InvalidRequest(message) => Self::invalid_request(message),
            PendingError::NotFound => Self::invalid_request_uri(StatusCode::NOT_FOUND, &err),
            PendingError::AlreadyConsumedOrExpired => {
                Self::invalid_request_uri(StatusCode::CONFLICT, &err)
            }
            PendingError::Storage(e) => e.into(),
        }
    }
}

impl From<GrantError> for OAuthError {
    fn from(err: GrantError) -> Self {
        match err {
            GrantError::NotFound(_) => Self::invalid_grant_id(StatusCode::NOT_FOUND, &err),
            GrantError::NotActive(_) => Self::invalid_grant_id(StatusCode::CONFLICT, &err),
            GrantError::Storage(e) => e.into(),
        }
    }
}

impl From<ConsentError> for OAuthError {
    fn from(err: ConsentError) -> Self {
        match err {
            ConsentError::InvalidRequest(message) => Self::invalid_request(message),
            ConsentError::RequestNotFoundOrExpired => {
                Self::invalid_request_uri(StatusCode::NOT_FOUND, &err)
            }
            ConsentError::AlreadyConsumedOrExpired => {
                Self::invalid_request_uri(StatusCode::CONFLICT, &err)
            }
            ConsentError::Grant(e) => e.into(),
            ConsentError::Storage(e) => e.into(),
        }
    }
}

impl From<TokenError> for OAuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::UnsupportedGrantType(_) => Self::unsupported_grant_type(&err),
            TokenError::InvalidRequest(message) => Self::invalid_request(message),
            TokenError::InvalidGrant(message) => Self::invalid_grant(message),
            TokenError::GrantNotFound(_) => Self::invalid_grant_id(StatusCode::NOT_FOUND, &err),
            TokenError::Signing(e) => Self::server_error(e),
            TokenError::Storage(e) => e.into(),
        }
    }
}

/// Error body of the non-OAuth endpoints
#[derive(Debug, Clone)]
pub struct ApiError {
    pub detail: String,
    pub status_code: StatusCode,
}

impl ApiError {
    pub fn new<S: ToString>(detail: S, status_code: StatusCode) -> Self {
        Self {
            detail: detail.to_string(),
            status_code,
        }
    }

    pub fn bad_request<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::BAD_REQUEST)
    }

    pub fn not_found<S: ToString>(detail: S) -> Self {
        Self::new(detail, StatusCode::NOT_FOUND)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status_code;
        let body = json!({
            "detail": self.detail,
        });
        (status_code, Json(body)).into_response()
    }
}
