//! Pushed authorization requests awaiting a consent decision

use crate::clock::{expires_after, Clock};
use crate::details::{parse_details, parse_details_value, AuthorizationDetail};
use crate::storage::{RecordStore, Storage, StorageError};
use crate::token::pkce;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";
const KEY_PREFIX: &str = "par:";

/// Body of `POST /par`, as sent by the client
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PushedAuthorizationRequest {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub grant_id: Option<String>,
    pub grant_management_action: Option<String>,
    /// JSON array of details, or a string holding one (form encoding)
    pub authorization_details: Option<Value>,
    pub subject_token: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GrantManagementAction {
    #[default]
    Create,
    Merge,
}

impl FromStr for GrantManagementAction {
    type Err = PendingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "merge" => Ok(Self::Merge),
            other => Err(PendingError::InvalidRequest(format!(
                "unsupported grant_management_action '{other}'"
            ))),
        }
    }
}

impl fmt::Display for GrantManagementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Merge => f.write_str("merge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorizationRequest {
    pub id: String,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub grant_id: Option<String>,
    pub grant_management_action: GrantManagementAction,
    pub requested_authorization_details: Vec<AuthorizationDetail>,
    pub subject_token: Option<String>,
    pub requested_actor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorizationRequest {
    pub fn request_uri(&self) -> String {
        format!("{REQUEST_URI_PREFIX}{}", self.id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds left before expiry
    pub fn expires_in(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Error)]
pub enum PendingError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("authorization request not found or expired")]
    NotFound,
    #[error("authorization request already consumed or expired")]
    AlreadyConsumedOrExpired,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Extract the request id from a `request_uri` URN
pub fn parse_request_uri(uri: &str) -> Result<&str, PendingError> {
    match uri.strip_prefix(REQUEST_URI_PREFIX) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(PendingError::InvalidRequest(format!(
            "invalid request_uri '{uri}'"
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required(value: Option<String>, name: &str) -> Result<String, PendingError> {
    non_empty(value).ok_or_else(|| PendingError::InvalidRequest(format!("{name} is required")))
}

fn requested_details(value: Option<Value>) -> Result<Vec<AuthorizationDetail>, PendingError> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(raw)) if raw.trim().is_empty() => return Ok(Vec::new()),
        Some(Value::String(raw)) => parse_details(&raw),
        Some(value) => parse_details_value(value),
    };
    parsed.map_err(|e| PendingError::InvalidRequest(e.to_string()))
}

fn storage_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Pending requests keyed by id, expiring after a fixed TTL
#[derive(Clone)]
pub struct PendingRequestStore {
    storage: Storage,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    allow_missing_pkce: bool,
}

impl PendingRequestStore {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            storage,
            clock,
            ttl,
            allow_missing_pkce: false,
        }
    }

    /// Accept requests pushed without a `code_challenge`
    pub fn allow_missing_pkce(mut self, allow: bool) -> Self {
        self.allow_missing_pkce = allow;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Seconds `pending` has left on this store's clock
    pub fn remaining(&self, pending: &PendingAuthorizationRequest) -> u64 {
        pending.expires_in(self.clock.now())
    }

    /// Validate and store a pushed request
    pub async fn create(
        &self,
        request: PushedAuthorizationRequest,
    ) -> Result<PendingAuthorizationRequest, PendingError> {
        match request.response_type.as_deref() {
            Some("code") => {}
            Some(other) => {
                return Err(PendingError::InvalidRequest(format!(
                    "unsupported response_type '{other}'"
                )))
            }
            None => {
                return Err(PendingError::InvalidRequest(
                    "response_type is required".to_string(),
                ))
            }
        }
        let client_id = required(request.client_id, "client_id")?;
        let redirect_uri = required(request.redirect_uri, "redirect_uri")?;
        let grant_management_action = match non_empty(request.grant_management_action) {
            Some(action) => action.parse()?,
            None => GrantManagementAction::default(),
        };
        let grant_id = non_empty(request.grant_id);
        if grant_management_action == GrantManagementAction::Merge && grant_id.is_none() {
            return Err(PendingError::InvalidRequest(
                "grant_id is required for grant_management_action 'merge'".to_string(),
            ));
        }
        let code_challenge = non_empty(request.code_challenge);
        let code_challenge_method = non_empty(request.code_challenge_method);
        pkce::check_challenge(
            code_challenge.as_deref(),
            code_challenge_method.as_deref(),
            self.allow_missing_pkce,
        )
        .map_err(|e| PendingError::InvalidRequest(e.to_string()))?;
        let requested_authorization_details = requested_details(request.authorization_details)?;

        let now = self.clock.now();
        let pending = PendingAuthorizationRequest {
            id: Uuid::new_v4().simple().to_string(),
            client_id,
            redirect_uri,
            scope: request.scope.unwrap_or_default(),
            state: non_empty(request.state),
            code_challenge,
            code_challenge_method,
            grant_id,
            grant_management_action,
            requested_authorization_details,
            subject_token: non_empty(request.subject_token),
            requested_actor: non_empty(request.actor),
            created_at: now,
            expires_at: expires_after(now, self.ttl),
        };

        self.storage
            .put(&storage_key(&pending.id), &pending, Some(self.ttl))
            .await?;
        info!(
            "Stored authorization request {} for client {} ({} details, action {})",
            pending.id,
            pending.client_id,
            pending.requested_authorization_details.len(),
            pending.grant_management_action
        );
        Ok(pending)
    }

    /// Load a live request. Expired records are deleted on sight.
    pub async fn get(&self, id: &str) -> Result<PendingAuthorizationRequest, PendingError> {
        let key = storage_key(id);
        let Some(pending) = self
            .storage
            .get::<PendingAuthorizationRequest>(&key)
            .await?
        else {
            return Err(PendingError::NotFound);
        };
        if pending.is_expired(self.clock.now()) {
            debug!("Authorization request {id} expired");
            self.storage.delete(&key).await?;
            return Err(PendingError::NotFound);
        }
        Ok(pending)
    }

    /// Remove a request so it can never be used again
    pub async fn consume(&self, id: &str) -> Result<PendingAuthorizationRequest, PendingError> {
        match self
            .storage
            .take::<PendingAuthorizationRequest>(&storage_key(id))
            .await?
        {
            Some(pending) if !pending.is_expired(self.clock.now()) => Ok(pending),
            _ => Err(PendingError::AlreadyConsumedOrExpired),
        }
    }

    /// Delete every expired request, returning how many were removed
    pub async fn purge_expired(&self) -> Result<usize, PendingError> {
        let now = self.clock.now();
        let mut purged = 0;
        for key in self.storage.keys(KEY_PREFIX).await? {
            match self.storage.get::<PendingAuthorizationRequest>(&key).await {
                Ok(Some(pending)) if pending.is_expired(now) => {
                    self.storage.delete(&key).await?;
                    purged += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Dropping unreadable authorization request {key}: {e}");
                    self.storage.delete(&key).await?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    /// Run `purge_expired` every `every` until `shutdown` is cancelled
    pub fn spawn_sweeper(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut sweep_interval = tokio::time::interval(every);
            // the first tick completes immediately
            sweep_interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Authorization request sweeper shutting down");
                        break;
                    }
                    _ = sweep_interval.tick() => {}
                }
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => info!("Purged {purged} expired authorization requests"),
                    Err(e) => warn!("Failed to purge expired authorization requests: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn store_with_clock() -> (PendingRequestStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = PendingRequestStore::new(
            Storage::in_memory(16).unwrap(),
            clock.clone(),
            Duration::from_secs(15 * 60),
        );
        (store, clock)
    }

    fn pushed() -> PushedAuthorizationRequest {
        PushedAuthorizationRequest {
            response_type: Some("code".to_string()),
            client_id: Some("client-1".to_string()),
            redirect_uri: Some("https://client.example/cb".to_string()),
            scope: Some("openid devops".to_string()),
            state: Some("xyz".to_string()),
            code_challenge: Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string()),
            code_challenge_method: Some("S256".to_string()),
            authorization_details: Some(json!(
                r#"[{"type":"mcp","server":"devops-mcp-server","tools":{"metrics":true}}]"#
            )),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (store, clock) = store_with_clock();
        let pending = store.create(pushed()).await.unwrap();

        assert!(pending.request_uri().starts_with(REQUEST_URI_PREFIX));
        assert_eq!(pending.expires_in(clock.now()), 900);
        assert_eq!(pending.grant_management_action, GrantManagementAction::Create);
        assert_eq!(pending.requested_authorization_details.len(), 1);

        let loaded = store.get(&pending.id).await.unwrap();
        assert_eq!(loaded, pending);
    }

    #[tokio::test]
    async fn test_details_accept_json_array() {
        let (store, _) = store_with_clock();
        let request = PushedAuthorizationRequest {
            authorization_details: Some(json!([{"type": "fs", "roots": ["/w"]}])),
            ..pushed()
        };
        let pending = store.create(request).await.unwrap();
        assert_eq!(pending.requested_authorization_details[0].detail_type(), "fs");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_requests() {
        let (store, _) = store_with_clock();
        let cases = [
            PushedAuthorizationRequest {
                response_type: Some("token".to_string()),
                ..pushed()
            },
            PushedAuthorizationRequest {
                response_type: None,
                ..pushed()
            },
            PushedAuthorizationRequest {
                client_id: None,
                ..pushed()
            },
            PushedAuthorizationRequest {
                redirect_uri: Some(" ".to_string()),
                ..pushed()
            },
            PushedAuthorizationRequest {
                grant_management_action: Some("replace".to_string()),
                ..pushed()
            },
            PushedAuthorizationRequest {
                grant_management_action: Some("merge".to_string()),
                ..pushed()
            },
            PushedAuthorizationRequest {
                authorization_details: Some(json!("not json")),
                ..pushed()
            },
            PushedAuthorizationRequest {
                authorization_details: Some(json!({"type": "mcp"})),
                ..pushed()
            },
        ];
        for request in cases {
            let result = store.create(request.clone()).await;
            assert!(
                matches!(result, Err(PendingError::InvalidRequest(_))),
                "expected rejection for {request:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_pkce_policy_applies_at_push() {
        let (store, _) = store_with_clock();
        let without_challenge = PushedAuthorizationRequest {
            code_challenge: None,
            code_challenge_method: None,
            ..pushed()
        };
        assert!(matches!(
            store.create(without_challenge.clone()).await,
            Err(PendingError::InvalidRequest(_))
        ));
        assert!(matches!(
            store
                .create(PushedAuthorizationRequest {
                    code_challenge_method: Some("plain".to_string()),
                    ..pushed()
                })
                .await,
            Err(PendingError::InvalidRequest(_))
        ));

        let lenient = store.clone().allow_missing_pkce(true);
        let pending = lenient.create(without_challenge).await.unwrap();
        assert!(pending.code_challenge.is_none());
    }

    #[tokio::test]
    async fn test_request_expires_after_fifteen_minutes() {
        let (store, clock) = store_with_clock();
        let pending = store.create(pushed()).await.unwrap();

        clock.advance(chrono::Duration::minutes(14));
        assert!(store.get(&pending.id).await.is_ok());

        clock.advance(chrono::Duration::minutes(1));
        assert!(matches!(
            store.get(&pending.id).await,
            Err(PendingError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let (store, _) = store_with_clock();
        let pending = store.create(pushed()).await.unwrap();

        assert!(store.consume(&pending.id).await.is_ok());
        assert!(matches!(
            store.consume(&pending.id).await,
            Err(PendingError::AlreadyConsumedOrExpired)
        ));
        assert!(matches!(
            store.get(&pending.id).await,
            Err(PendingError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_requests() {
        let (store, clock) = store_with_clock();
        let old = store.create(pushed()).await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        let fresh = store.create(pushed()).await.unwrap();
        clock.advance(chrono::Duration::minutes(6));

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get(&old.id).await.is_err());
        assert!(store.get(&fresh.id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let (store, clock) = store_with_clock();
        let pending = store.create(pushed()).await.unwrap();
        clock.advance(chrono::Duration::minutes(16));

        let shutdown = CancellationToken::new();
        let handle = store.spawn_sweeper(Duration::from_secs(60), shutdown.clone());
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(store
            .storage
            .get::<PendingAuthorizationRequest>(&storage_key(&pending.id))
            .await
            .unwrap()
            .is_none());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_parse_request_uri() {
        assert_eq!(
            parse_request_uri("urn:ietf:params:oauth:request_uri:abc").unwrap(),
            "abc"
        );
        assert!(parse_request_uri("urn:ietf:params:oauth:request_uri:").is_err());
        assert!(parse_request_uri("https://example.com").is_err());
    }
}
