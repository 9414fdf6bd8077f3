use crate::codes::CodeStore;
use crate::details::AuthorizationDetail;
use crate::grants::{ConsentApplication, Grant, GrantError, GrantStore};
use crate::locks::KeyedLocks;
use crate::pending::{PendingError, PendingRequestStore};
use crate::storage::StorageError;
use log::{info, warn};
use thiserror::Error;
use url::form_urlencoded;

/// The resource owner's answer to a pending request
#[derive(Debug, Clone, Default)]
pub struct ConsentDecision {
    pub subject: String,
    /// Falls back to the requested scope when absent
    pub scope: Option<String>,
    /// Falls back to the requested details when absent
    pub authorization_details: Option<Vec<AuthorizationDetail>>,
    pub grant_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConsentOutcome {
    pub redirect: String,
    pub code: String,
    pub grant: Grant,
}

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("authorization request not found or expired")]
    RequestNotFoundOrExpired,
    #[error("authorization request already consumed or expired")]
    AlreadyConsumedOrExpired,
    #[error(transparent)]
    Grant(#[from] GrantError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<PendingError> for ConsentError {
    fn from(err: PendingError) -> Self {
        match err {
            PendingError::InvalidRequest(message) => Self::InvalidRequest(message),
            PendingError::NotFound => Self::RequestNotFoundOrExpired,
            PendingError::AlreadyConsumedOrExpired => Self::AlreadyConsumedOrExpired,
            PendingError::Storage(e) => Self::Storage(e),
        }
    }
}

/// `redirect_uri` with the code, and state when present, appended to its query
pub fn redirect_with_code(redirect_uri: &str, code: &str, state: Option<&str>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("code", code);
    if let Some(state) = state {
        query.append_pair("state", state);
    }
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    format!("{redirect_uri}{separator}{}", query.finish())
}

#[derive(Clone)]
pub struct ConsentProcessor {
    pending: PendingRequestStore,
    grants: GrantStore,
    codes: CodeStore,
    locks: KeyedLocks,
}

impl ConsentProcessor {
    pub fn new(pending: PendingRequestStore, grants: GrantStore, codes: CodeStore) -> Self {
        Self {
            pending,
            grants,
            codes,
            locks: KeyedLocks::new(),
        }
    }

    /// Apply a consent decision to its grant and issue the authorization code.
    ///
    /// The request is consumed before the grant is touched, so a request that
    /// expires or is taken elsewhere leaves no grant change and no code behind.
    pub async fn submit(
        &self,
        request_id: &str,
        decision: ConsentDecision,
    ) -> Result<ConsentOutcome, ConsentError> {
        let pending = self.pending.get(request_id).await?;
        let subject = decision.subject.trim();
        if subject.is_empty() {
            return Err(ConsentError::InvalidRequest("subject is required".to_string()));
        }
        if let (Some(requested), Some(decided)) =
            (pending.grant_id.as_deref(), decision.grant_id.as_deref())
        {
            if requested != decided {
                warn!("Consent for {request_id} names grant {decided}, request names {requested}");
                return Err(ConsentError::InvalidRequest(
                    "grant_id does not match the authorization request".to_string(),
                ));
            }
        }

        let _guard = self.locks.lock(request_id).await;
        // nothing is written until the request is ours
        let request = self.pending.consume(request_id).await?;
        let grant_id = request.grant_id.as_deref().or(decision.grant_id.as_deref());

        let grant = self
            .grants
            .create_or_get(
                request.grant_management_action,
                grant_id,
                &request.client_id,
                subject,
            )
            .await?;

        let application = ConsentApplication {
            scope: decision.scope.unwrap_or_else(|| request.scope.clone()),
            authorization_details: decision
                .authorization_details
                .unwrap_or_else(|| request.requested_authorization_details.clone()),
            actor: request.requested_actor.clone(),
        };
        let grant = self.grants.apply_consent(&grant.id, application).await?;
        let code = self.codes.issue(&request, &grant.id, subject).await?;

        info!(
            "Consent for request {request_id} by {subject} applied to grant {}",
            grant.id
        );
        Ok(ConsentOutcome {
            redirect: redirect_with_code(&request.redirect_uri, &code.code, request.state.as_deref()),
            code: code.code,
            grant,
        })
    }
}
