//! OAuth 2.0 authorization server endpoints
//!
//! ## Supported flows
//! - Pushed Authorization Requests (RFC 9126) carrying Rich Authorization
//!   Requests (RFC 9396) and Grant Management parameters
//! - Authorization Code Grant with PKCE (RFC 7636)
//! - Authorization Server Metadata (RFC 8414)
//!
//! Consent is recorded through `/authorization-requests/{id}/consent`, which
//! redirects back to the client with the authorization code.

pub mod handlers;
pub mod models;

use crate::state::AppState;
use handlers::*;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Creates OAuth 2.0 routes
pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(par))
        .routes(routes!(authorize, authorize_post))
        .routes(routes!(consent, consent_form))
        .routes(routes!(token))
        .routes(routes!(metadata))
}
