use crate::openapi::HEALTH_TAG;
use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Health {
    status: String,
    storage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Liveness and storage health
#[utoipa::path(
    get,
    path = "/health",
    tag = HEALTH_TAG,
    responses(
        (status = 200, description = "Service is healthy", body = Health),
        (status = 503, description = "Storage is unreachable", body = Health)
    )
)]
async fn health_check(State(state): State<AppState>) -> Response {
    match state.health_check().await {
        Ok(()) => Json(Health {
            status: "ok".to_string(),
            storage: "healthy".to_string(),
            error: None,
        })
        .into_response(),
        Err(e) => {
            warn!("Storage health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(Health {
                    status: "error".to_string(),
                    storage: "unhealthy".to_string(),
                    error: Some(e),
                }),
            )
                .into_response()
        }
    }
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(health_check))
}
