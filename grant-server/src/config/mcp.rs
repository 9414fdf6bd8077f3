use confique::Config;

/// Settings for the MCP endpoint guarded by the tool gate
#[derive(Debug, Config, Clone)]
pub struct McpConfig {
    /// Origin recorded as `server` in mcp authorization details.
    /// When empty, the origin is derived from the request's Host header.
    #[config(env = "GRANT_MCP_SERVER_ORIGIN", default = "")]
    pub server_origin: String,

    /// Comma-separated list of tools exposed by the MCP endpoint
    #[config(env = "GRANT_MCP_TOOLS", default = "")]
    pub tools: String,

    /// Client id used for authorization requests started from a session
    #[config(env = "GRANT_MCP_CLIENT_ID", default = "mcp-client")]
    pub client_id: String,

    /// Redirect URI used for authorization requests started from a session
    #[config(env = "GRANT_MCP_CALLBACK_URI", default = "urn:grant:callback")]
    pub callback_uri: String,
}

impl McpConfig {
    /// Get the configured tool names
    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
