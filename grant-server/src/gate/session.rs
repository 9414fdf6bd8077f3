//! Connected MCP sessions and their live binding to a grant

use super::protocol::list_changed_notification;
use super::{
    GateError, GateTransition, ToolAuthorization, ToolGate, ToolInvoker, ToolRegistry,
};
use crate::details::flatten::{flatten, Permission};
use crate::details::AuthorizationDetail;
use crate::grants::{Grant, GrantEvent, GrantStatus, GrantStore, SubscriptionId};
use crate::pending::{GrantManagementAction, PendingRequestStore, PushedAuthorizationRequest};
use crate::token::pkce;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use url::form_urlencoded;
use uuid::Uuid;

/// Delivers server-initiated messages to a connected client
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: Value);
}

#[derive(Debug, Clone)]
struct SessionBinding {
    grant_id: String,
    subscription: SubscriptionId,
}

/// Last authorization request pushed for a session
#[derive(Debug, Clone)]
struct OpenRequest {
    request_id: String,
    grant_id: Option<String>,
    action: GrantManagementAction,
    tools: BTreeSet<String>,
    prompt: AuthorizationPrompt,
}

pub struct McpSession {
    pub id: String,
    /// Server name matched against the `server` of mcp details
    pub origin: String,
    gate: tokio::sync::Mutex<ToolGate>,
    binding: Mutex<Option<SessionBinding>>,
    open_request: Mutex<Option<OpenRequest>>,
    sink: Arc<dyn NotificationSink>,
}

impl McpSession {
    pub fn grant_id(&self) -> Option<String> {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|binding| binding.grant_id.clone())
    }

    pub async fn enabled_tools(&self) -> Vec<String> {
        self.gate
            .lock()
            .await
            .enabled_tools()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

/// Where authorization requests started from a session are sent
#[derive(Debug, Clone)]
pub struct AuthorizationSettings {
    pub authorize_endpoint: String,
    pub client_id: String,
    pub callback_uri: String,
}

/// Result of a request for more tools
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationPrompt {
    pub authorization_url: String,
    pub request_uri: String,
    pub expires_in: u64,
    /// PKCE verifier to present with the code the consent produces
    pub code_verifier: String,
}

/// What the session's grant allows, as reported by the query tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantSummary {
    pub grant_id: Option<String>,
    pub status: Option<GrantStatus>,
    pub subject: Option<String>,
    pub scope: Option<String>,
    pub enabled_tools: Vec<String>,
    /// mcp details addressed to the session's server
    pub authorization_details: Vec<AuthorizationDetail>,
    pub permissions: Vec<Permission>,
}

struct Inner {
    sessions: RwLock<HashMap<String, Arc<McpSession>>>,
    grants: GrantStore,
    pending: PendingRequestStore,
    registry: ToolRegistry,
    invoker: Arc<dyn ToolInvoker>,
    authorization: AuthorizationSettings,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        grants: GrantStore,
        pending: PendingRequestStore,
        registry: ToolRegistry,
        invoker: Arc<dyn ToolInvoker>,
        authorization: AuthorizationSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                grants,
                pending,
                registry,
                invoker,
                authorization,
            }),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    pub fn invoker(&self) -> &Arc<dyn ToolInvoker> {
        &self.inner.invoker
    }

    pub fn open(&self, origin: &str, sink: Arc<dyn NotificationSink>) -> Arc<McpSession> {
        let session = Arc::new(McpSession {
            id: Uuid::new_v4().simple().to_string(),
            origin: origin.to_string(),
            gate: tokio::sync::Mutex::new(ToolGate::new(&self.inner.registry)),
            binding: Mutex::new(None),
            open_request: Mutex::new(None),
            sink,
        });
        self.inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), Arc::clone(&session));
        info!("Opened MCP session {} for {}", session.id, session.origin);
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<McpSession>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Drop a session and its grant subscription
    pub fn close(&self, session_id: &str) -> bool {
        let session = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let Some(session) = session else {
            return false;
        };
        let binding = session
            .binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(binding) = binding {
            self.inner.grants.unsubscribe(binding.subscription);
        }
        info!("Closed MCP session {session_id}");
        true
    }

    /// Point the session at the grant its latest bearer token names.
    ///
    /// Rebinding to the same grant keeps the existing subscription.
    pub fn bind(&self, session: &McpSession, grant_id: Option<&str>) {
        let mut binding = session
            .binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if binding.as_ref().map(|b| b.grant_id.as_str()) == grant_id {
            return;
        }
        if let Some(previous) = binding.take() {
            self.inner.grants.unsubscribe(previous.subscription);
        }
        let Some(grant_id) = grant_id else {
            return;
        };

        let manager = Arc::downgrade(&self.inner);
        let session_id = session.id.clone();
        let subscription = self.inner.grants.subscribe(
            grant_id,
            Arc::new(move |event: &GrantEvent| {
                schedule_refresh(&manager, &session_id, event);
            }),
        );
        debug!("Session {} bound to grant {grant_id}", session.id);
        *binding = Some(SessionBinding {
            grant_id: grant_id.to_string(),
            subscription,
        });
    }

    async fn load_grant(&self, session: &McpSession) -> Option<Grant> {
        let grant_id = session.grant_id()?;
        match self.inner.grants.find(&grant_id).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!("Failed to load grant {grant_id} for session {}: {e}", session.id);
                None
            }
        }
    }

    /// Re-read the session's grant and update its gate.
    ///
    /// Any failure to load the grant leaves only the built-in tools enabled.
    pub async fn evaluate(&self, session: &McpSession) -> GateTransition {
        let grant = self.load_grant(session).await;
        let authorization = ToolAuthorization::from_grant(grant.as_ref(), &session.origin);
        let transition = session.gate.lock().await.evaluate(&authorization);
        if !transition.is_empty() {
            debug!(
                "Session {}: enabled {:?}, disabled {:?}",
                session.id, transition.enabled, transition.disabled
            );
        }
        transition
    }

    /// Evaluate and tell the client when its tool list changed
    pub async fn refresh(&self, session_id: &str) -> Option<GateTransition> {
        let session = self.get(session_id)?;
        let transition = self.evaluate(&session).await;
        if !transition.is_empty() {
            info!("Tool list of session {session_id} changed");
            session.sink.notify(list_changed_notification());
        }
        Some(transition)
    }

    pub async fn is_enabled(&self, session: &McpSession, tool: &str) -> bool {
        session.gate.lock().await.is_enabled(tool)
    }

    pub async fn list_tools(&self, session: &McpSession) -> Vec<super::ToolDescriptor> {
        let gate = session.gate.lock().await;
        self.inner.registry.enabled(&gate)
    }

    /// The session's grant with the tools it currently enables
    pub async fn describe_grant(&self, session: &McpSession) -> GrantSummary {
        let enabled_tools = session.enabled_tools().await;
        let Some(grant) = self.load_grant(session).await else {
            return GrantSummary {
                grant_id: session.grant_id(),
                status: None,
                subject: None,
                scope: None,
                enabled_tools,
                authorization_details: Vec::new(),
                permissions: Vec::new(),
            };
        };
        let (authorization_details, permissions) = if grant.is_active() {
            (
                grant
                    .authorization_details
                    .iter()
                    .filter(|detail| {
                        detail
                            .as_mcp()
                            .is_some_and(|mcp| mcp.server == session.origin)
                    })
                    .cloned()
                    .collect(),
                flatten(&grant.id, &grant.authorization_details),
            )
        } else {
            (Vec::new(), Vec::new())
        };
        GrantSummary {
            grant_id: Some(grant.id),
            status: Some(grant.status),
            subject: Some(grant.subject),
            scope: Some(grant.scope),
            enabled_tools,
            authorization_details,
            permissions,
        }
    }

    /// Push an authorization request for `tools` on behalf of the session.
    ///
    /// Extends the session's grant when it is active, otherwise asks for a
    /// grant under the session's grant id. While the session's last request
    /// is still pending and covers `tools`, its prompt is returned instead.
    pub async fn request_authorization(
        &self,
        session: &McpSession,
        tools: &[String],
    ) -> Result<AuthorizationPrompt, GateError> {
        if let Some(unknown) = tools.iter().find(|tool| !self.inner.registry.contains(tool)) {
            return Err(GateError::InvalidArguments(format!("unknown tool '{unknown}'")));
        }
        let requested: BTreeSet<String> = if tools.is_empty() {
            self.inner.registry.names().map(str::to_string).collect()
        } else {
            tools.iter().cloned().collect()
        };

        let grant_id = session.grant_id();
        let action = match &grant_id {
            Some(id) => match self.inner.grants.find(id).await {
                Ok(Some(grant)) if grant.is_active() => GrantManagementAction::Merge,
                _ => GrantManagementAction::Create,
            },
            None => GrantManagementAction::Create,
        };
        if let Some(prompt) = self
            .reusable_prompt(session, grant_id.as_deref(), action, &requested)
            .await
        {
            return Ok(prompt);
        }

        let settings = &self.inner.authorization;
        let code_verifier = pkce::new_verifier();
        let tool_claims: BTreeMap<&str, Value> = requested
            .iter()
            .map(|name| (name.as_str(), json!({"essential": true})))
            .collect();
        let request = PushedAuthorizationRequest {
            response_type: Some("code".to_string()),
            client_id: Some(settings.client_id.clone()),
            redirect_uri: Some(settings.callback_uri.clone()),
            code_challenge: Some(pkce::s256_challenge(&code_verifier)),
            code_challenge_method: Some(pkce::S256.to_string()),
            grant_id: grant_id.clone(),
            grant_management_action: Some(action.to_string()),
            authorization_details: Some(json!([{
                "type": "mcp",
                "server": session.origin,
                "tools": tool_claims,
            }])),
            ..Default::default()
        };
        let pending = self
            .inner
            .pending
            .create(request)
            .await
            .map_err(|e| GateError::Invocation(e.to_string()))?;

        let request_uri = pending.request_uri();
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("request_uri", &request_uri)
            .append_pair("client_id", &settings.client_id)
            .finish();
        let prompt = AuthorizationPrompt {
            authorization_url: format!("{}?{query}", settings.authorize_endpoint),
            request_uri,
            expires_in: self.inner.pending.ttl().as_secs(),
            code_verifier,
        };
        *session
            .open_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(OpenRequest {
            request_id: pending.id,
            grant_id,
            action,
            tools: requested,
            prompt: prompt.clone(),
        });
        Ok(prompt)
    }

    async fn reusable_prompt(
        &self,
        session: &McpSession,
        grant_id: Option<&str>,
        action: GrantManagementAction,
        tools: &BTreeSet<String>,
    ) -> Option<AuthorizationPrompt> {
        let open = session
            .open_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        if open.grant_id.as_deref() != grant_id
            || open.action != action
            || !tools.is_subset(&open.tools)
        {
            return None;
        }
        // consumed or expired requests are gone from the store
        let pending = self.inner.pending.get(&open.request_id).await.ok()?;
        debug!(
            "Session {} reuses authorization request {}",
            session.id, open.request_id
        );
        Some(AuthorizationPrompt {
            expires_in: self.inner.pending.remaining(&pending),
            ..open.prompt
        })
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn schedule_refresh(manager: &Weak<Inner>, session_id: &str, event: &GrantEvent) {
    let Some(inner) = manager.upgrade() else {
        return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime to refresh session {session_id} after {event:?}");
        return;
    };
    let manager = SessionManager { inner };
    let session_id = session_id.to_string();
    runtime.spawn(async move {
        manager.refresh(&session_id).await;
    });
}
