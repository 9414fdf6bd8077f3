use crate::api::mcp::McpStreams;
use crate::clock::{Clock, SystemClock};
use crate::codes::CodeStore;
use crate::config::Settings;
use crate::consent::ConsentProcessor;
use crate::gate::session::AuthorizationSettings;
use crate::gate::{AcknowledgingInvoker, SessionManager, ToolRegistry};
use crate::grants::GrantStore;
use crate::pending::PendingRequestStore;
use crate::storage::{RecordStore, Storage};
use crate::token::{Ed25519Signer, SignerError, TokenExchanger, TokenSigner};
use log::{info, warn};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub clock: Arc<dyn Clock>,
    pub storage: Storage,
    pub pending: PendingRequestStore,
    pub grants: GrantStore,
    pub consent: ConsentProcessor,
    pub tokens: TokenExchanger,
    pub sessions: SessionManager,
    pub streams: McpStreams,
}

impl AppState {
    pub fn new(settings: Settings, storage: Storage) -> Result<Self, SignerError> {
        Self::with_clock(settings, storage, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: Settings,
        storage: Storage,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SignerError> {
        let signer: Arc<dyn TokenSigner> = if settings.oauth.signing_key.is_empty() {
            warn!("No signing key configured, tokens will not survive a restart");
            Arc::new(Ed25519Signer::generate())
        } else {
            Arc::new(Ed25519Signer::from_base64(&settings.oauth.signing_key)?)
        };

        let pending = PendingRequestStore::new(
            storage.clone(),
            clock.clone(),
            settings.oauth.request_ttl(),
        )
        .allow_missing_pkce(settings.oauth.allow_missing_pkce);
        let grants = GrantStore::new(storage.clone(), clock.clone(), settings.oauth.grant_ttl());
        let codes = CodeStore::new(storage.clone(), clock.clone(), settings.oauth.code_ttl());

        let consent = ConsentProcessor::new(pending.clone(), grants.clone(), codes.clone());
        let tokens = TokenExchanger::new(
            codes,
            grants.clone(),
            signer,
            clock.clone(),
            settings.oauth.issuer.clone(),
            settings.oauth.token_ttl(),
            settings.oauth.allow_missing_pkce,
        );

        let registry = ToolRegistry::from_names(&settings.mcp.tool_names());
        info!(
            "MCP endpoint exposes tools {:?}",
            registry.names().collect::<Vec<_>>()
        );
        let sessions = SessionManager::new(
            grants.clone(),
            pending.clone(),
            registry,
            Arc::new(AcknowledgingInvoker),
            AuthorizationSettings {
                authorize_endpoint: settings.oauth.endpoint("/authorize"),
                client_id: settings.mcp.client_id.clone(),
                callback_uri: settings.mcp.callback_uri.clone(),
            },
        );

        Ok(Self {
            settings: Arc::new(settings),
            clock,
            storage,
            pending,
            grants,
            consent,
            tokens,
            sessions,
            streams: McpStreams::default(),
        })
    }

    /// Check if all components are healthy
    pub async fn health_check(&self) -> Result<(), String> {
        self.storage.health_check().await
    }
}

#[cfg(test)]
impl AppState {
    pub(crate) fn for_tests(settings: Settings, clock: Arc<dyn Clock>) -> Self {
        let storage = Storage::in_memory(settings.storage.memory_capacity)
            .expect("in-memory storage");
        Self::with_clock(settings, storage, clock).expect("test state")
    }
}
