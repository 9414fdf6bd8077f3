use crate::api::mcp::SESSION_HEADER;
use crate::clock::{Clock, ManualClock};
use crate::config::Settings;
use crate::create_app;
use crate::state::AppState;
use crate::token::pkce::s256_challenge;
use crate::token::TokenResponse;
use axum::body::Body;
use axum::Router;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use log::LevelFilter;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use url::form_urlencoded;

pub const CLIENT_ID: &str = "client-1";
pub const REDIRECT_URI: &str = "https://client.example/cb";
pub const CODE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

/// Test fixture driving the complete application in-process.
///
/// Requests go through the same router `main` serves, with in-memory storage
/// and a manual clock, so expiry can be tested by advancing `clock`.
///
/// # Examples
///
/// ```rust
/// #[tokio::test]
/// async fn test_endpoint() {
///     let fixture = TestFixture::new().await;
///     let tokens = fixture.approve("alice", r#"[{"type":"fs","roots":["/w"]}]"#).await;
///
///     let response = fixture.get(format!("/grants/{}", tokens.grant_id)).await;
///     response.assert_ok();
/// }
/// ```
pub struct TestFixture {
    /// The application router
    pub app: Router,
    /// Configuration settings
    pub settings: Settings,
    /// State shared with the router
    pub state: AppState,
    pub clock: Arc<ManualClock>,
}

impl TestFixture {
    pub async fn new() -> Self {
        Self::with_settings(Settings::for_tests()).await
    }

    /// Fixture whose grant management endpoints require `api_key`
    pub async fn with_api_key(api_key: &str) -> Self {
        let mut settings = Settings::for_tests();
        settings.api_key = api_key.to_string();
        Self::with_settings(settings).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        Self::setup_logger(LevelFilter::Debug);

        let clock = Arc::new(ManualClock::new());
        let shared: Arc<dyn Clock> = clock.clone();
        let state = AppState::for_tests(settings.clone(), shared);
        let app = create_app(state.clone()).await;

        Self {
            app,
            settings,
            state,
            clock,
        }
    }

    /// Initializes the test logger with customized settings.
    pub fn setup_logger(level: LevelFilter) {
        let _ = env_logger::builder()
            .filter_level(level)
            .is_test(true)
            .try_init();
    }

    /// Request builder carrying the API key when one is configured
    pub fn request_builder(&self, method: Method, uri: impl AsRef<str>) -> http::request::Builder {
        let builder = Request::builder().method(method).uri(uri.as_ref());
        if self.settings.api_key.is_empty() {
            builder
        } else {
            builder.header(AUTHORIZATION, format!("Bearer {}", self.settings.api_key))
        }
    }

    pub async fn get(&self, uri: impl AsRef<str>) -> TestResponse {
        let request = self
            .request_builder(Method::GET, uri)
            .body(Body::empty())
            .expect("Failed to build request");

        self.send(request).await
    }

    pub async fn get_without_auth(&self, uri: impl AsRef<str>) -> TestResponse {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri.as_ref())
            .body(Body::empty())
            .expect("Failed to build request");

        self.send(request).await
    }

    /// GET with `Accept: application/json`
    pub async fn get_json(&self, uri: impl AsRef<str>) -> TestResponse {
        let request = self
            .request_builder(Method::GET, uri)
            .header(ACCEPT, "application/json")
            .body(Body::empty())
            .expect("Failed to build request");

        self.send(request).await
    }

    pub async fn post<T: Serialize>(&self, uri: impl AsRef<str>, body: &T) -> TestResponse {
        self.send_json(Method::POST, uri, body).await
    }

    pub async fn put<T: Serialize>(&self, uri: impl AsRef<str>, body: &T) -> TestResponse {
        self.send_json(Method::PUT, uri, body).await
    }

    async fn send_json<T: Serialize>(
        &self,
        method: Method,
        uri: impl AsRef<str>,
        body: &T,
    ) -> TestResponse {
        let json_body = serde_json::to_vec(body).expect("Failed to serialize body to JSON");
        let request = self
            .request_builder(method, uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json_body))
            .expect("Failed to build request");

        self.send(request).await
    }

    /// POST an `application/x-www-form-urlencoded` body
    pub async fn post_form(&self, uri: impl AsRef<str>, fields: &[(&str, &str)]) -> TestResponse {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        let request = self
            .request_builder(Method::POST, uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .expect("Failed to build request");

        self.send(request).await
    }

    pub async fn delete(&self, uri: impl AsRef<str>) -> TestResponse {
        let request = self
            .request_builder(Method::DELETE, uri)
            .body(Body::empty())
            .expect("Failed to build request");

        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read response body")
            .to_bytes();
        let text = String::from_utf8_lossy(&body).to_string();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);

        TestResponse {
            status,
            headers,
            text,
            json,
        }
    }

    /// Push a request for `details`, returning its `request_uri`
    pub async fn push(&self, details: &str, extra: &[(&str, &str)]) -> String {
        let challenge = s256_challenge(CODE_VERIFIER);
        let mut fields = vec![
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", REDIRECT_URI),
            ("scope", "openid devops"),
            ("state", "xyz"),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("authorization_details", details),
        ];
        fields.retain(|(name, _)| !extra.iter().any(|(overridden, _)| overridden == name));
        fields.extend_from_slice(extra);
        let response = self.post_form("/par", &fields).await;
        response.assert_status(StatusCode::CREATED);
        response.json["request_uri"]
            .as_str()
            .expect("request_uri")
            .to_string()
    }

    /// Consent to a pushed request as `subject`, returning the code
    pub async fn consent(&self, request_uri: &str, subject: &str) -> String {
        let request_id = request_uri.rsplit(':').next().expect("request id");
        let response = self
            .put(
                format!("/authorization-requests/{request_id}/consent"),
                &json!({ "subject": subject }),
            )
            .await;
        response.assert_status(StatusCode::MOVED_PERMANENTLY);
        let location = response.location();
        let (_, query) = location.split_once('?').expect("query in redirect");
        form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == "code")
            .map(|(_, code)| code.to_string())
            .expect("code in redirect")
    }

    pub async fn redeem(&self, code: &str) -> TestResponse {
        self.post_form(
            "/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", CLIENT_ID),
                ("code_verifier", CODE_VERIFIER),
            ],
        )
        .await
    }

    /// Run the whole flow for `details` and return the tokens
    pub async fn approve(&self, subject: &str, details: &str) -> TokenResponse {
        let request_uri = self.push(details, &[]).await;
        let code = self.consent(&request_uri, subject).await;
        let response = self.redeem(&code).await;
        response.assert_ok();
        response.json_as()
    }

    /// Send a JSON-RPC message to `/mcp`
    pub async fn mcp(&self, session_id: &str, token: Option<&str>, message: Value) -> TestResponse {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .header(CONTENT_TYPE, "application/json");
        if !session_id.is_empty() {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder
            .body(Body::from(message.to_string()))
            .expect("Failed to build request");
        self.send(request).await
    }

    /// Open an MCP session, returning its id and the initialize response
    pub async fn mcp_initialize(&self, token: Option<&str>) -> (String, TestResponse) {
        let response = self
            .mcp(
                "",
                token,
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            )
            .await;
        response.assert_ok();
        let session_id = response
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .expect("Mcp-Session-Id header")
            .to_string();
        (session_id, response)
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub text: String,
    pub json: Value,
}

impl TestResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn assert_status(&self, expected: StatusCode) -> &Self {
        assert_eq!(
            self.status, expected,
            "Expected status {} but got {} with body: {}",
            expected, self.status, self.text
        );
        self
    }

    pub fn assert_ok(&self) -> &Self {
        self.assert_status(StatusCode::OK)
    }

    pub fn location(&self) -> String {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("Location header")
            .to_string()
    }

    pub fn json_as<T: DeserializeOwned>(&self) -> T {
        serde_json::from_value(self.json.clone()).expect("Failed to deserialize response JSON")
    }
}
