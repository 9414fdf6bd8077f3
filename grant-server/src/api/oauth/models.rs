use crate::consent::ConsentDecision;
use crate::details::{parse_details, parse_details_value, AuthorizationDetail};
use crate::errors::OAuthError;
use crate::pending::GrantManagementAction;
use axum::{
    extract::{Form, FromRequest, Request},
    http::header::CONTENT_TYPE,
    Json,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

/// Body accepted either as JSON or as `application/x-www-form-urlencoded`,
/// depending on the request's content type
pub struct FormOrJson<T>(pub T);

impl<S, T> FromRequest<S> for FormOrJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = OAuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .unwrap_or("");

        if content_type.starts_with("application/json") {
            match Json::<T>::from_request(req, state).await {
                Ok(Json(body)) => Ok(Self(body)),
                Err(e) => Err(OAuthError::invalid_request(format!(
                    "Invalid JSON in request body: {}",
                    e.body_text()
                ))),
            }
        } else {
            match Form::<T>::from_request(req, state).await {
                Ok(Form(body)) => Ok(Self(body)),
                Err(e) => Err(OAuthError::invalid_request(format!(
                    "Invalid form data in request body: {}",
                    e.body_text()
                ))),
            }
        }
    }
}

/// Response of `POST /par`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ParResponse {
    pub request_uri: String,
    pub expires_in: u64,
}

/// Parameters of `GET/POST /authorize`
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct AuthorizeParams {
    /// `urn:ietf:params:oauth:request_uri:<id>` returned by `/par`
    pub request_uri: Option<String>,
    pub client_id: Option<String>,
}

/// What the consent page shows, returned as JSON on `Accept: application/json`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthorizationView {
    pub request_id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub grant_id: Option<String>,
    pub grant_management_action: GrantManagementAction,
    #[schema(value_type = Vec<Object>)]
    pub authorization_details: Vec<AuthorizationDetail>,
    pub expires_in: u64,
    pub consent_endpoint: String,
}

/// Body of `PUT/POST /authorization-requests/{id}/consent`
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ConsentBody {
    pub subject: Option<String>,
    pub scope: Option<String>,
    /// JSON array, or a string holding one when sent from a form
    #[schema(value_type = Option<Object>)]
    pub authorization_details: Option<Value>,
    pub grant_id: Option<String>,
}

impl ConsentBody {
    pub fn into_decision(self) -> Result<ConsentDecision, OAuthError> {
        let authorization_details = match self.authorization_details {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) if raw.trim().is_empty() => None,
            Some(Value::String(raw)) => Some(parse_details(&raw)),
            Some(value) => Some(parse_details_value(value)),
        }
        .transpose()
        .map_err(OAuthError::invalid_request)?;

        Ok(ConsentDecision {
            subject: self.subject.unwrap_or_default(),
            scope: self.scope.filter(|scope| !scope.trim().is_empty()),
            authorization_details,
            grant_id: self.grant_id.filter(|id| !id.trim().is_empty()),
        })
    }
}
