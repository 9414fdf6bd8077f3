//! OAuth 2.0 endpoint handlers

use crate::api::oauth::models::{
    AuthorizationView, AuthorizeParams, ConsentBody, FormOrJson, ParResponse,
};
use crate::details::{FS_TYPE, MCP_TYPE};
use crate::errors::OAuthError;
use crate::headers::CacheControl;
use crate::openapi::OAUTH_TAG;
use crate::pending::{parse_request_uri, PushedAuthorizationRequest};
use crate::state::AppState;
use crate::token::{TokenRequest, TokenResponse, AUTHORIZATION_CODE};
use axum::{
    extract::{Path, Query, State},
    http::{
        header::{ACCEPT, CONTENT_TYPE, LOCATION},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use log::{debug, info, warn};
use serde_json::json;

/// Pushed Authorization Request endpoint (RFC 9126)
#[utoipa::path(
    post,
    path = "/par",
    request_body(content = PushedAuthorizationRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 201, description = "Request stored", body = ParResponse),
        (status = 400, description = "Invalid request", body = OAuthError)
    ),
    tag = OAUTH_TAG
)]
pub async fn par(
    State(state): State<AppState>,
    FormOrJson(request): FormOrJson<PushedAuthorizationRequest>,
) -> Result<Response, OAuthError> {
    let pending = state.pending.create(request).await?;
    info!(
        "Stored authorization request {} for client {}",
        pending.id, pending.client_id
    );
    let body = ParResponse {
        request_uri: pending.request_uri(),
        expires_in: state.pending.ttl().as_secs(),
    };
    let mut response = (StatusCode::CREATED, Json(body)).into_response();
    CacheControl::no_store().apply(&mut response);
    Ok(response)
}

/// Authorization endpoint, query form
#[utoipa::path(
    get,
    path = "/authorize",
    params(AuthorizeParams),
    responses(
        (status = 200, description = "Consent page, or its content as JSON", body = AuthorizationView),
        (status = 400, description = "Invalid request", body = OAuthError),
        (status = 404, description = "Unknown or expired request_uri", body = OAuthError)
    ),
    tag = OAUTH_TAG
)]
pub async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response, OAuthError> {
    render_authorization(&state, &headers, params).await
}

/// Authorization endpoint, form post
#[utoipa::path(
    post,
    path = "/authorize",
    request_body(content = AuthorizeParams, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Consent page, or its content as JSON", body = AuthorizationView),
        (status = 400, description = "Invalid request", body = OAuthError),
        (status = 404, description = "Unknown or expired request_uri", body = OAuthError)
    ),
    tag = OAUTH_TAG
)]
pub async fn authorize_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    FormOrJson(params): FormOrJson<AuthorizeParams>,
) -> Result<Response, OAuthError> {
    render_authorization(&state, &headers, params).await
}

/// Look up the pushed request and show it. Never touches the grant.
async fn render_authorization(
    state: &AppState,
    headers: &HeaderMap,
    params: AuthorizeParams,
) -> Result<Response, OAuthError> {
    let request_uri = params
        .request_uri
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| OAuthError::invalid_request("request_uri is required"))?;
    let client_id = params
        .client_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| OAuthError::invalid_request("client_id is required"))?;

    let request_id = parse_request_uri(&request_uri)?;
    let pending = state.pending.get(request_id).await?;
    if pending.client_id != client_id {
        warn!(
            "Authorization request {} belongs to {}, presented by {client_id}",
            pending.id, pending.client_id
        );
        return Err(OAuthError::invalid_request(
            "client_id does not match the authorization request",
        ));
    }

    let consent_path = format!("/authorization-requests/{}/consent", pending.id);
    let view = AuthorizationView {
        request_id: pending.id.clone(),
        client_id: pending.client_id.clone(),
        redirect_uri: pending.redirect_uri.clone(),
        scope: pending.scope.clone(),
        grant_id: pending.grant_id.clone(),
        grant_management_action: pending.grant_management_action,
        authorization_details: pending.requested_authorization_details.clone(),
        expires_in: pending.expires_in(state.clock.now()),
        consent_endpoint: state.settings.oauth.endpoint(&consent_path),
    };

    let wants_json = headers
        .get(ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));
    debug!(
        "Rendering authorization request {} as {}",
        view.request_id,
        if wants_json { "json" } else { "html" }
    );
    if wants_json {
        return Ok(Json(view).into_response());
    }
    let page = consent_page(&view, &consent_path);
    Ok((StatusCode::OK, [(CONTENT_TYPE, "text/html; charset=utf-8")], page).into_response())
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn consent_page(view: &AuthorizationView, action: &str) -> String {
    let details = serde_json::to_string_pretty(&view.authorization_details)
        .unwrap_or_else(|_| "[]".to_string());
    let grant = match &view.grant_id {
        Some(grant_id) => format!(
            "<p>This request will <strong>{}</strong> grant <code>{}</code>.</p>",
            view.grant_management_action,
            escape_html(grant_id)
        ),
        None => "<p>This request will create a new grant.</p>".to_string(),
    };
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorization Request</title>
    <style>
        body {{ font-family: Arial, sans-serif; max-width: 640px; margin: 50px auto; padding: 20px; }}
        label {{ display: block; margin: 12px 0 4px; }}
        input, textarea {{ width: 100%; padding: 8px; border: 1px solid #ddd; border-radius: 4px; }}
        textarea {{ font-family: monospace; min-height: 200px; }}
        button {{ background: #007bff; color: white; padding: 10px 20px; border: none; border-radius: 4px; margin-top: 16px; }}
    </style>
</head>
<body>
    <h2>Authorization Required</h2>
    <p>Application <strong>{client_id}</strong> is requesting access.</p>
    {grant}
    <form method="post" action="{action}">
        <label for="subject">Subject</label>
        <input type="text" id="subject" name="subject" required>
        <label for="scope">Scope</label>
        <input type="text" id="scope" name="scope" value="{scope}">
        <label for="authorization_details">Authorization details</label>
        <textarea id="authorization_details" name="authorization_details">{details}</textarea>
        <button type="submit">Approve</button>
    </form>
</body>
</html>
"#,
        client_id = escape_html(&view.client_id),
        grant = grant,
        action = escape_html(action),
        scope = escape_html(&view.scope),
        details = escape_html(&details),
    )
}

/// Record the resource owner's consent and redirect back to the client
#[utoipa::path(
    put,
    path = "/authorization-requests/{id}/consent",
    params(("id" = String, Path, description = "Authorization request id")),
    request_body = ConsentBody,
    responses(
        (status = 301, description = "Redirect to the client with the authorization code"),
        (status = 400, description = "Invalid decision", body = OAuthError),
        (status = 404, description = "Unknown or expired request", body = OAuthError),
        (status = 409, description = "Request already consumed, or grant not active", body = OAuthError)
    ),
    tag = OAUTH_TAG
)]
pub async fn consent(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    FormOrJson(body): FormOrJson<ConsentBody>,
) -> Result<Response, OAuthError> {
    let decision = body.into_decision()?;
    let outcome = state.consent.submit(&request_id, decision).await?;
    info!(
        "Authorization request {request_id} approved, grant {}",
        outcome.grant.id
    );
    Ok((StatusCode::MOVED_PERMANENTLY, [(LOCATION, outcome.redirect)]).into_response())
}

/// Consent submitted from the HTML page
#[utoipa::path(
    post,
    path = "/authorization-requests/{id}/consent",
    params(("id" = String, Path, description = "Authorization request id")),
    request_body(content = ConsentBody, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 301, description = "Redirect to the client with the authorization code"),
        (status = 400, description = "Invalid decision", body = OAuthError),
        (status = 404, description = "Unknown or expired request", body = OAuthError),
        (status = 409, description = "Request already consumed, or grant not active", body = OAuthError)
    ),
    tag = OAUTH_TAG
)]
pub async fn consent_form(
    state: State<AppState>,
    request_id: Path<String>,
    body: FormOrJson<ConsentBody>,
) -> Result<Response, OAuthError> {
    consent(state, request_id, body).await
}

/// Token endpoint (RFC 6749 section 4.1.3)
#[utoipa::path(
    post,
    path = "/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens bound to the grant", body = TokenResponse),
        (status = 400, description = "Invalid or expired code", body = OAuthError),
        (status = 404, description = "Grant no longer exists", body = OAuthError)
    ),
    tag = OAUTH_TAG
)]
pub async fn token(
    State(state): State<AppState>,
    FormOrJson(request): FormOrJson<TokenRequest>,
) -> Result<Response, OAuthError> {
    let client_id = request.client_id.clone().unwrap_or_default();
    let tokens = match state.tokens.exchange(request).await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("Token request from client '{client_id}' rejected: {e}");
            return Err(e.into());
        }
    };
    debug!("Token response for grant {} ready", tokens.grant_id);
    let mut response = Json(tokens).into_response();
    CacheControl::no_store().apply(&mut response);
    Ok(response)
}

/// Authorization server metadata (RFC 8414)
#[utoipa::path(
    get,
    path = "/.well-known/oauth-authorization-server",
    responses(
        (status = 200, description = "Server metadata")
    ),
    tag = OAUTH_TAG
)]
pub async fn metadata(State(state): State<AppState>) -> Response {
    let oauth = &state.settings.oauth;
    let body = json!({
        "issuer": oauth.issuer,
        "authorization_endpoint": oauth.endpoint("/authorize"),
        "token_endpoint": oauth.endpoint("/token"),
        "pushed_authorization_request_endpoint": oauth.endpoint("/par"),
        "require_pushed_authorization_requests": true,
        "grant_management_endpoint": oauth.endpoint("/grants"),
        "grant_management_actions_supported": ["create", "merge"],
        "response_types_supported": ["code"],
        "grant_types_supported": [AUTHORIZATION_CODE],
        "code_challenge_methods_supported": ["S256"],
        "authorization_details_types_supported": [MCP_TYPE, FS_TYPE],
        "token_endpoint_auth_methods_supported": ["none"],
    });
    let mut response = Json(body).into_response();
    CacheControl::public(3600).apply(&mut response);
    response
}
