use crate::errors::ApiError;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use log::warn;

const FORBIDDEN: &str =
    "You are not authorized to access this resource, please check your API key.";

pub(super) async fn authentication_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(auth_header) = request.headers().get(http::header::AUTHORIZATION) else {
        warn!("Missing Authorization header");
        return ApiError::new("Missing Authorization header", StatusCode::UNAUTHORIZED)
            .into_response();
    };

    let api_key = match auth_header.to_str() {
        Ok(header_str) if header_str.to_lowercase().starts_with("bearer ") => {
            header_str[7..].to_string()
        }
        Ok(_) => {
            warn!("Invalid Authorization header format, missing 'Bearer ' prefix");
            return ApiError::new(FORBIDDEN, StatusCode::FORBIDDEN).into_response();
        }
        Err(e) => {
            warn!("Failed to parse Authorization header to string: {e}");
            return ApiError::new(FORBIDDEN, StatusCode::FORBIDDEN).into_response();
        }
    };

    if api_key != state.settings.api_key {
        warn!("Authentication failed: Invalid API key");
        return ApiError::new(FORBIDDEN, StatusCode::FORBIDDEN).into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Settings;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    const TEST_ROUTE: &str = "/test";

    fn setup_authn_mock_app(api_key: &str) -> Router {
        let mut settings = Settings::for_tests();
        settings.api_key = api_key.to_string();
        let state = AppState::for_tests(settings, Arc::new(SystemClock));

        Router::new()
            .route(TEST_ROUTE, get(|| async { (StatusCode::OK, "Authenticated") }))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                authentication_middleware,
            ))
            .with_state(state)
    }

    async fn send_request(app: &Router, auth_header: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut request_builder = Request::builder().uri(TEST_ROUTE);
        if let Some(auth) = auth_header {
            request_builder = request_builder.header("Authorization", auth);
        }
        let request = request_builder
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read response body")
            .to_bytes();
        (status, body.to_vec())
    }

    fn detail(body: &[u8]) -> String {
        let json: Value = serde_json::from_slice(body).expect("JSON error body");
        json["detail"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_authentication_middleware() {
        let app = setup_authn_mock_app("test_api_key");
        let (status, body) = send_request(&app, Some("Bearer test_api_key")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Authenticated");
    }

    #[tokio::test]
    async fn test_missing_authorization_header() {
        let app = setup_authn_mock_app("test_api_key");
        let (status, body) = send_request(&app, None).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(detail(&body), "Missing Authorization header");
    }

    #[tokio::test]
    async fn test_invalid_authorization_format() {
        let app = setup_authn_mock_app("test_api_key");
        let (status, body) = send_request(&app, Some("test_api_key")).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(detail(&body), FORBIDDEN);
    }

    #[tokio::test]
    async fn test_invalid_api_key() {
        let app = setup_authn_mock_app("test_api_key");
        let (status, body) = send_request(&app, Some("Bearer wrong_api_key")).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(detail(&body), FORBIDDEN);
    }
}
