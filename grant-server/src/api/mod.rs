mod authn_middleware;
pub(crate) mod grants;
pub(crate) mod health;
pub(crate) mod mcp;
pub(crate) mod oauth;

use crate::api::authn_middleware::authentication_middleware;
use crate::state::AppState;
use axum::middleware;
use log::warn;
use utoipa_axum::router::OpenApiRouter;

/// Combines all API routes into a single router
pub(super) fn router(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .merge(health::router())
        .merge(oauth::router())
        .merge(mcp::router())
        .merge(protected_routes(state))
}

/// Grant management routes, guarded by the API key when one is configured
fn protected_routes(state: &AppState) -> OpenApiRouter<AppState> {
    let router = grants::router();
    if state.settings.api_key.is_empty() {
        warn!("GRANT_API_KEY is not set, grant management endpoints are unauthenticated");
        return router;
    }
    router.layer(middleware::from_fn_with_state(
        state.clone(),
        authentication_middleware,
    ))
}
