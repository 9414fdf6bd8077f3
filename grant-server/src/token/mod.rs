//! Authorization code exchange and grant-bound access tokens

use crate::clock::Clock;
use crate::codes::CodeStore;
use crate::details::AuthorizationDetail;
use crate::grants::{GrantError, GrantStore};
use crate::storage::StorageError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod pkce;
pub mod signer;

pub use signer::{Ed25519Signer, SignerError, TokenSigner};

pub const AUTHORIZATION_CODE: &str = "authorization_code";

/// Form body of `POST /token`
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub token_type: String,
    pub expires_in: u64,
    /// The grant's scope after the exchange, not only what this request asked for
    pub scope: String,
    pub grant_id: String,
    #[schema(value_type = Vec<Object>)]
    pub authorization_details: Vec<AuthorizationDetail>,
}

/// Claims carried by access tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub client_id: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    /// Session id; equals the grant id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<Value>,
}

impl AccessTokenClaims {
    /// Grant the bearer acts under: `sid`, falling back to `jti`
    pub fn session_grant_id(&self) -> &str {
        self.sid.as_deref().unwrap_or(&self.jti)
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("unsupported grant_type '{0}'")]
    UnsupportedGrantType(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    InvalidGrant(String),
    #[error("grant {0} not found")]
    GrantNotFound(String),
    #[error("token signing failed: {0}")]
    Signing(#[from] SignerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<GrantError> for TokenError {
    fn from(err: GrantError) -> Self {
        match err {
            GrantError::NotFound(id) => Self::GrantNotFound(id),
            GrantError::NotActive(id) => Self::InvalidGrant(format!("grant {id} is not active")),
            GrantError::Storage(e) => Self::Storage(e),
        }
    }
}

fn has_scope(scope: &str, wanted: &str) -> bool {
    scope.split_whitespace().any(|s| s == wanted)
}

#[derive(Clone)]
pub struct TokenExchanger {
    codes: CodeStore,
    grants: GrantStore,
    signer: Arc<dyn TokenSigner>,
    clock: Arc<dyn Clock>,
    issuer: String,
    token_ttl: Duration,
    allow_missing_pkce: bool,
}

impl TokenExchanger {
    pub fn new(
        codes: CodeStore,
        grants: GrantStore,
        signer: Arc<dyn TokenSigner>,
        clock: Arc<dyn Clock>,
        issuer: String,
        token_ttl: Duration,
        allow_missing_pkce: bool,
    ) -> Self {
        Self {
            codes,
            grants,
            signer,
            clock,
            issuer,
            token_ttl,
            allow_missing_pkce,
        }
    }

    /// Redeem an authorization code for tokens bound to its grant
    pub async fn exchange(&self, request: TokenRequest) -> Result<TokenResponse, TokenError> {
        match request.grant_type.as_deref() {
            Some(AUTHORIZATION_CODE) => {}
            Some(other) => return Err(TokenError::UnsupportedGrantType(other.to_string())),
            None => {
                return Err(TokenError::InvalidRequest(
                    "grant_type is required".to_string(),
                ))
            }
        }
        let code = request
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or_else(|| TokenError::InvalidRequest("code is required".to_string()))?;

        // taken up front: a failed redemption still burns the code
        let Some(record) = self.codes.take(code).await? else {
            warn!("Token request with unknown or expired code");
            return Err(TokenError::InvalidGrant(
                "authorization code is invalid, expired or already used".to_string(),
            ));
        };

        if request.client_id.as_deref() != Some(record.client_id.as_str()) {
            warn!("Code {} presented by a different client", record.code);
            return Err(TokenError::InvalidGrant("client_id mismatch".to_string()));
        }
        if request.redirect_uri.as_deref() != Some(record.redirect_uri.as_str()) {
            return Err(TokenError::InvalidGrant("redirect_uri mismatch".to_string()));
        }
        pkce::verify(
            record.code_challenge.as_deref(),
            record.code_challenge_method.as_deref(),
            request.code_verifier.as_deref(),
            self.allow_missing_pkce,
        )
        .map_err(|e| TokenError::InvalidGrant(e.to_string()))?;

        let grant = self.grants.get(&record.grant_id).await?;
        if !grant.is_active() {
            return Err(TokenError::InvalidGrant(format!(
                "grant {} is not active",
                grant.id
            )));
        }

        let iat = self.clock.now().timestamp();
        let expires_in = self.token_ttl.as_secs();
        let exp = iat.saturating_add(i64::try_from(expires_in).unwrap_or(i64::MAX));
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: record.subject.clone(),
            aud: record.client_id.clone(),
            client_id: record.client_id.clone(),
            iat,
            exp,
            jti: Uuid::new_v4().to_string(),
            sid: Some(grant.id.clone()),
            grant_id: Some(grant.id.clone()),
            scope: grant.scope.clone(),
            act: grant.actor.as_ref().map(|actor| json!({ "sub": actor })),
        };
        let access_token = self.signer.sign(&serde_json::to_value(&claims)?)?;

        let id_token = if has_scope(&grant.scope, "openid") {
            let id_claims = json!({
                "iss": self.issuer,
                "sub": record.subject,
                "aud": record.client_id,
                "iat": iat,
                "exp": exp,
                "sid": grant.id,
            });
            Some(self.signer.sign(&id_claims)?)
        } else {
            None
        };

        info!(
            "Issued access token for grant {} to client {}",
            grant.id, record.client_id
        );
        Ok(TokenResponse {
            access_token,
            id_token,
            token_type: "Bearer".to_string(),
            expires_in,
            scope: grant.scope,
            grant_id: grant.id,
            authorization_details: grant.authorization_details,
        })
    }

    /// Verify an access token this server issued and that it has not expired
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let claims = self
            .signer
            .verify(token)
            .map_err(|e| TokenError::InvalidGrant(e.to_string()))?;
        let claims: AccessTokenClaims = serde_json::from_value(claims)
            .map_err(|e| TokenError::InvalidGrant(format!("unexpected claims: {e}")))?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(TokenError::InvalidGrant("token expired".to_string()));
        }
        Ok(claims)
    }
}

impl From<serde_json::Error> for TokenError {
    fn from(err: serde_json::Error) -> Self {
        Self::Signing(SignerError::Json(err))
    }
}
