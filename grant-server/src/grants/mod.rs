//! Durable grants and the reconciliation of consented details into them

use crate::clock::{expires_after, Clock};
use crate::details::{merge_all, AuthorizationDetail};
use crate::locks::KeyedLocks;
use crate::pending::GrantManagementAction;
use crate::storage::{RecordStore, Storage, StorageError};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod events;

pub use events::{GrantEvent, GrantEventKind, GrantEvents, GrantListener, SubscriptionId};

const KEY_PREFIX: &str = "grant:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Grant {
    pub id: String,
    pub client_id: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Space separated, each scope at most once
    pub scope: String,
    #[schema(value_type = Vec<Object>)]
    pub authorization_details: Vec<AuthorizationDetail>,
    pub status: GrantStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Grant {
    pub fn is_active(&self) -> bool {
        self.status == GrantStatus::Active
    }
}

/// What a consent adds to a grant
#[derive(Debug, Clone, Default)]
pub struct ConsentApplication {
    pub scope: String,
    pub authorization_details: Vec<AuthorizationDetail>,
    pub actor: Option<String>,
}

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("grant {0} not found")]
    NotFound(String),
    #[error("grant {0} is not active")]
    NotActive(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Order-stable union of two space separated scope strings
pub fn union_scope(existing: &str, incoming: &str) -> String {
    let mut scopes: Vec<&str> = Vec::new();
    for scope in existing.split_whitespace().chain(incoming.split_whitespace()) {
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }
    scopes.join(" ")
}

fn storage_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn new_grant_id() -> String {
    format!("gnt_{}", Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct GrantStore {
    storage: Storage,
    locks: KeyedLocks,
    events: GrantEvents,
    clock: Arc<dyn Clock>,
    grant_ttl: Option<Duration>,
}

impl GrantStore {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, grant_ttl: Option<Duration>) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(),
            events: GrantEvents::new(),
            clock,
            grant_ttl,
        }
    }

    /// Load a grant, reporting it as expired once its lifetime has passed
    pub async fn find(&self, grant_id: &str) -> Result<Option<Grant>, GrantError> {
        let grant = self.storage.get::<Grant>(&storage_key(grant_id)).await?;
        let now = self.clock.now();
        Ok(grant.map(|mut grant| {
            if grant.status == GrantStatus::Active
                && grant.expires_at.is_some_and(|expires_at| expires_at <= now)
            {
                grant.status = GrantStatus::Expired;
            }
            grant
        }))
    }

    pub async fn get(&self, grant_id: &str) -> Result<Grant, GrantError> {
        self.find(grant_id)
            .await?
            .ok_or_else(|| GrantError::NotFound(grant_id.to_string()))
    }

    /// All grants, optionally only those of one subject, oldest first
    pub async fn list(&self, subject: Option<&str>) -> Result<Vec<Grant>, GrantError> {
        let mut grants = Vec::new();
        for key in self.storage.keys(KEY_PREFIX).await? {
            let Some(id) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            if let Some(grant) = self.find(id).await? {
                if subject.map_or(true, |subject| grant.subject == subject) {
                    grants.push(grant);
                }
            }
        }
        grants.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(grants)
    }

    /// Resolve the grant a consent applies to.
    ///
    /// `Merge` requires an existing active grant. `Create` mints an empty
    /// grant; a requested id is used when it is still free.
    pub async fn create_or_get(
        &self,
        action: GrantManagementAction,
        grant_id: Option<&str>,
        client_id: &str,
        subject: &str,
    ) -> Result<Grant, GrantError> {
        if let (GrantManagementAction::Merge, Some(grant_id)) = (action, grant_id) {
            let grant = self.get(grant_id).await?;
            if !grant.is_active() {
                return Err(GrantError::NotActive(grant.id));
            }
            return Ok(grant);
        }

        let id = grant_id.map(str::to_string).unwrap_or_else(new_grant_id);
        let _guard = self.locks.lock(&id).await;
        let id = if self.storage.get::<Grant>(&storage_key(&id)).await?.is_some() {
            debug!("Grant id {id} is taken, minting a new one");
            new_grant_id()
        } else {
            id
        };

        let now = self.clock.now();
        let grant = Grant {
            id,
            client_id: client_id.to_string(),
            subject: subject.to_string(),
            actor: None,
            scope: String::new(),
            authorization_details: Vec::new(),
            status: GrantStatus::Active,
            created_at: now,
            modified_at: now,
            expires_at: self.grant_ttl.map(|ttl| expires_after(now, ttl)),
        };
        self.storage
            .put(&storage_key(&grant.id), &grant, None)
            .await?;
        info!("Created grant {} for subject {}", grant.id, grant.subject);
        Ok(grant)
    }

    /// Merge consented details and scope into a grant
    pub async fn apply_consent(
        &self,
        grant_id: &str,
        application: ConsentApplication,
    ) -> Result<Grant, GrantError> {
        let grant = {
            let _guard = self.locks.lock(grant_id).await;
            let mut grant = self.get(grant_id).await?;
            if !grant.is_active() {
                return Err(GrantError::NotActive(grant.id));
            }

            grant.authorization_details =
                merge_all(&grant.authorization_details, application.authorization_details);
            grant.scope = union_scope(&grant.scope, &application.scope);
            grant.modified_at = self.clock.now();
            if grant.actor.is_none() {
                grant.actor = application.actor;
            }
            self.storage
                .put(&storage_key(&grant.id), &grant, None)
                .await?;
            grant
        };

        info!(
            "Applied consent to grant {} ({} details, scope '{}')",
            grant.id,
            grant.authorization_details.len(),
            grant.scope
        );
        self.events.publish(&GrantEvent {
            grant_id: grant.id.clone(),
            kind: GrantEventKind::Updated,
        });
        Ok(grant)
    }

    /// Mark a grant revoked. Revoking twice succeeds.
    pub async fn revoke(&self, grant_id: &str) -> Result<Grant, GrantError> {
        let grant = {
            let _guard = self.locks.lock(grant_id).await;
            let mut grant = self
                .storage
                .get::<Grant>(&storage_key(grant_id))
                .await?
                .ok_or_else(|| GrantError::NotFound(grant_id.to_string()))?;
            if grant.status != GrantStatus::Revoked {
                grant.status = GrantStatus::Revoked;
                grant.modified_at = self.clock.now();
                self.storage
                    .put(&storage_key(&grant.id), &grant, None)
                    .await?;
                info!("Revoked grant {}", grant.id);
            }
            grant
        };

        self.events.publish(&GrantEvent {
            grant_id: grant.id.clone(),
            kind: GrantEventKind::Revoked,
        });
        Ok(grant)
    }

    pub fn subscribe(&self, grant_id: &str, listener: Arc<dyn GrantListener>) -> SubscriptionId {
        self.events.subscribe(grant_id, listener)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.events.unsubscribe(subscription)
    }
}
