//! Grant Management endpoints: query and revoke grants, and read their
//! flattened permissions

use crate::details::flatten::{filter_by_attribute, flatten, has_permission, Permission};
use crate::errors::OAuthError;
use crate::grants::Grant;
use crate::openapi::GRANTS_TAG;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct GrantListQuery {
    /// Only grants of this subject
    pub subject: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PermissionQuery {
    pub grant_id: Option<String>,
    /// Exact attribute, or a namespace such as `tool`
    pub attribute: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PermissionCheckQuery {
    pub grant_id: Option<String>,
    pub attribute: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PermissionCheck {
    pub grant_id: String,
    pub attribute: String,
    pub value: String,
    pub allowed: bool,
}

fn required(value: Option<String>, name: &str) -> Result<String, OAuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("{name} is required")))
}

/// Rows of an active grant. Revoked and expired grants hold no permissions.
async fn permission_rows(state: &AppState, grant_id: &str) -> Result<Vec<Permission>, OAuthError> {
    let grant = state.grants.get(grant_id).await?;
    if !grant.is_active() {
        debug!("Grant {grant_id} is {:?}, no permissions", grant.status);
        return Ok(Vec::new());
    }
    Ok(flatten(&grant.id, &grant.authorization_details))
}

/// Current state of a grant
#[utoipa::path(
    get,
    path = "/grants/{id}",
    params(("id" = String, Path, description = "Grant id")),
    responses(
        (status = 200, description = "The grant", body = Grant),
        (status = 404, description = "Unknown grant", body = OAuthError)
    ),
    tag = GRANTS_TAG
)]
async fn get_grant(
    State(state): State<AppState>,
    Path(grant_id): Path<String>,
) -> Result<Json<Grant>, OAuthError> {
    Ok(Json(state.grants.get(&grant_id).await?))
}

/// Revoke a grant. Revoking an already revoked grant succeeds.
#[utoipa::path(
    delete,
    path = "/grants/{id}",
    params(("id" = String, Path, description = "Grant id")),
    responses(
        (status = 204, description = "Grant revoked"),
        (status = 404, description = "Unknown grant", body = OAuthError)
    ),
    tag = GRANTS_TAG
)]
async fn revoke_grant(
    State(state): State<AppState>,
    Path(grant_id): Path<String>,
) -> Result<StatusCode, OAuthError> {
    state.grants.revoke(&grant_id).await?;
    info!("Grant {grant_id} revoked");
    Ok(StatusCode::NO_CONTENT)
}

/// All grants, optionally of one subject
#[utoipa::path(
    get,
    path = "/grants",
    params(GrantListQuery),
    responses(
        (status = 200, description = "Grants", body = Vec<Grant>)
    ),
    tag = GRANTS_TAG
)]
async fn list_grants(
    State(state): State<AppState>,
    Query(query): Query<GrantListQuery>,
) -> Result<Json<Vec<Grant>>, OAuthError> {
    let subject = query.subject.filter(|s| !s.is_empty());
    Ok(Json(state.grants.list(subject.as_deref()).await?))
}

/// Flattened permission rows of a grant
#[utoipa::path(
    get,
    path = "/permissions",
    params(PermissionQuery),
    responses(
        (status = 200, description = "Permission rows", body = Vec<Permission>),
        (status = 400, description = "Missing grant_id", body = OAuthError),
        (status = 404, description = "Unknown grant", body = OAuthError)
    ),
    tag = GRANTS_TAG
)]
async fn list_permissions(
    State(state): State<AppState>,
    Query(query): Query<PermissionQuery>,
) -> Result<Json<Vec<Permission>>, OAuthError> {
    let grant_id = required(query.grant_id, "grant_id")?;
    let rows = permission_rows(&state, &grant_id).await?;
    let rows = match query.attribute.filter(|a| !a.is_empty()) {
        Some(attribute) => filter_by_attribute(&rows, &attribute).cloned().collect(),
        None => rows,
    };
    Ok(Json(rows))
}

/// Whether a grant holds one attribute/value pair
#[utoipa::path(
    get,
    path = "/permissions/check",
    params(PermissionCheckQuery),
    responses(
        (status = 200, description = "Check result", body = PermissionCheck),
        (status = 400, description = "Missing parameter", body = OAuthError),
        (status = 404, description = "Unknown grant", body = OAuthError)
    ),
    tag = GRANTS_TAG
)]
async fn check_permission(
    State(state): State<AppState>,
    Query(query): Query<PermissionCheckQuery>,
) -> Result<Json<PermissionCheck>, OAuthError> {
    let grant_id = required(query.grant_id, "grant_id")?;
    let attribute = required(query.attribute, "attribute")?;
    let value = required(query.value, "value")?;
    let rows = permission_rows(&state, &grant_id).await?;
    let allowed = has_permission(&rows, &attribute, &value);
    debug!("Grant {grant_id} {attribute}={value}: {allowed}");
    Ok(Json(PermissionCheck {
        grant_id,
        attribute,
        value,
        allowed,
    }))
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(get_grant, revoke_grant))
        .routes(routes!(list_grants))
        .routes(routes!(list_permissions))
        .routes(routes!(check_permission))
}
