use confique::Config;

pub mod mcp;
pub mod oauth;
pub mod storage;

pub use mcp::McpConfig;
pub use oauth::OAuthConfig;
pub use storage::{StorageConfig, StorageStore};

/// Main configuration structure for the grant server
#[derive(Debug, Config, Clone)]
pub struct Settings {
    /// The port the server listens on (default: 7788)
    #[config(env = "GRANT_PORT", default = 7788)]
    pub port: u16,

    /// API key guarding the grant management endpoints; empty disables the check
    #[config(env = "GRANT_API_KEY", default = "")]
    pub api_key: String,

    #[config(nested)]
    pub storage: StorageConfig,

    #[config(nested)]
    pub oauth: OAuthConfig,

    #[config(nested)]
    pub mcp: McpConfig,
}

impl Settings {
    /// Load configuration from the environment, then from the TOML file
    /// named by `GRANT_CONFIG_FILE` when set. Environment values win.
    pub fn new() -> Result<Self, String> {
        let mut builder = Self::builder().env();
        if let Ok(path) = std::env::var("GRANT_CONFIG_FILE") {
            builder = builder.file(path);
        }
        builder.load().map_err(|e| e.to_string())
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            api_key: String::new(),
            storage: StorageConfig {
                store: StorageStore::InMemory,
                memory_capacity: 16,
                redis_url: String::new(),
            },
            oauth: OAuthConfig {
                issuer: "grant-server-test".to_string(),
                base_url: "http://localhost:7788".to_string(),
                request_ttl: 900,
                code_ttl: 600,
                token_ttl: 3600,
                grant_ttl: 0,
                sweep_interval: 300,
                allow_missing_pkce: false,
                signing_key: String::new(),
            },
            mcp: McpConfig {
                server_origin: "devops-mcp-server".to_string(),
                tools: "metrics,logs,dashboard".to_string(),
                client_id: "mcp-client".to_string(),
                callback_uri: "urn:grant:callback".to_string(),
            },
        }
    }
}
