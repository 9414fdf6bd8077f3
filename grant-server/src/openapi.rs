use utoipa::OpenApi;

pub(crate) const HEALTH_TAG: &str = "Health API";
pub(crate) const OAUTH_TAG: &str = "OAuth 2.0";
pub(crate) const GRANTS_TAG: &str = "Grant Management API";
pub(crate) const MCP_TAG: &str = "MCP";

#[derive(OpenApi)]
#[openapi(
    tags(
        (name = HEALTH_TAG, description = "Health check endpoints"),
        (name = OAUTH_TAG, description = "Pushed authorization requests, consent and token exchange"),
        (name = GRANTS_TAG, description = "Grant queries, revocation and flattened permissions"),
        (name = MCP_TAG, description = "Grant-gated MCP tool endpoint"),
    ),
    info(
        title = "Grant Management Server API",
        description = "OAuth 2.0 Grant Management with Rich Authorization Requests",
        version = "0.1.0"
    )
)]
pub(crate) struct ApiDoc;
