use crate::clock::{expires_after, Clock};
use crate::pending::PendingAuthorizationRequest;
use crate::storage::{RecordStore, Storage, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "code:";

/// Everything the token endpoint needs to redeem a code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// Same value as the id of the request it was issued for
    pub code: String,
    pub request_id: String,
    pub grant_id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Single-use authorization codes
#[derive(Clone)]
pub struct CodeStore {
    storage: Storage,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CodeStore {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            storage,
            clock,
            ttl,
        }
    }

    /// Record a code for a consented request, bound to `grant_id`
    pub async fn issue(
        &self,
        request: &PendingAuthorizationRequest,
        grant_id: &str,
        subject: &str,
    ) -> Result<AuthorizationCode, StorageError> {
        let now = self.clock.now();
        let code = AuthorizationCode {
            code: request.id.clone(),
            request_id: request.id.clone(),
            grant_id: grant_id.to_string(),
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: request.code_challenge_method.clone(),
            subject: subject.to_string(),
            created_at: now,
            expires_at: expires_after(now, self.ttl),
        };
        self.storage
            .put(&format!("{KEY_PREFIX}{}", code.code), &code, Some(self.ttl))
            .await?;
        Ok(code)
    }

    /// Remove and return a live code. Expired and unknown codes both yield `None`.
    pub async fn take(&self, code: &str) -> Result<Option<AuthorizationCode>, StorageError> {
        let record = self
            .storage
            .take::<AuthorizationCode>(&format!("{KEY_PREFIX}{code}"))
            .await?;
        let now = self.clock.now();
        Ok(record.filter(|record| record.expires_at > now))
    }
}
