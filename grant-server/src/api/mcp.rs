//! Streamable HTTP transport of the grant-gated MCP endpoint.
//!
//! `POST /mcp` carries JSON-RPC messages, `GET /mcp` opens the server-sent
//! event stream on which tool list changes are pushed, and `DELETE /mcp`
//! ends the session. Sessions are named by the `Mcp-Session-Id` header.

use crate::errors::ApiError;
use crate::gate::protocol::{dispatch, JsonRpcRequest, JsonRpcResponse};
use crate::gate::NotificationSink;
use crate::openapi::MCP_TAG;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{
        header::{AUTHORIZATION, HOST},
        HeaderMap, HeaderName, StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use utoipa_axum::{router::OpenApiRouter, routes};

pub const SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

const INVALID_REQUEST: i64 = -32600;
const STREAM_CAPACITY: usize = 32;

/// Forwards notifications to whichever event streams the session has open
struct BroadcastSink(broadcast::Sender<Value>);

impl NotificationSink for BroadcastSink {
    fn notify(&self, message: Value) {
        if self.0.send(message).is_err() {
            debug!("No event stream open, notification dropped");
        }
    }
}

/// Notification channels of open sessions, by session id
#[derive(Clone, Default)]
pub struct McpStreams {
    senders: Arc<RwLock<HashMap<String, broadcast::Sender<Value>>>>,
}

impl McpStreams {
    fn insert(&self, session_id: &str, sender: broadcast::Sender<Value>) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), sender);
    }

    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<Value>> {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map(broadcast::Sender::subscribe)
    }

    fn remove(&self, session_id: &str) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

/// Grant named by the bearer token, if the request carries a valid one
fn bearer_grant_id(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if !header.to_lowercase().starts_with("bearer ") {
        return None;
    }
    match state.tokens.verify_access_token(header[7..].trim()) {
        Ok(claims) => Some(claims.session_grant_id().to_string()),
        Err(e) => {
            warn!("Ignoring MCP bearer token: {e}");
            None
        }
    }
}

/// Origin matched against the `server` of mcp authorization details
fn origin(state: &AppState, headers: &HeaderMap) -> String {
    let configured = &state.settings.mcp.server_origin;
    if !configured.is_empty() {
        return configured.clone();
    }
    headers
        .get(HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

/// Handle one JSON-RPC message
#[utoipa::path(
    post,
    path = "/mcp",
    responses(
        (status = 200, description = "JSON-RPC response"),
        (status = 202, description = "Notification accepted"),
        (status = 400, description = "Missing session id or malformed message"),
        (status = 404, description = "Unknown session")
    ),
    tag = MCP_TAG
)]
async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_value(message) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed MCP message: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(Value::Null, INVALID_REQUEST, e.to_string())),
            )
                .into_response();
        }
    };

    let session = if request.method == "initialize" {
        let (sender, _) = broadcast::channel(STREAM_CAPACITY);
        let session = state
            .sessions
            .open(&origin(&state, &headers), Arc::new(BroadcastSink(sender.clone())));
        state.streams.insert(&session.id, sender);
        session
    } else {
        let Some(id) = session_id(&headers) else {
            return ApiError::bad_request("Mcp-Session-Id header is required").into_response();
        };
        match state.sessions.get(id) {
            Some(session) => session,
            None => {
                return ApiError::not_found(format!("session {id} not found")).into_response()
            }
        }
    };

    let grant_id = bearer_grant_id(&state, &headers);
    state.sessions.bind(&session, grant_id.as_deref());

    let session_header = [(SESSION_HEADER, session.id.clone())];
    match dispatch(&state.sessions, &session, request).await {
        Some(response) => (session_header, Json(response)).into_response(),
        None => (StatusCode::ACCEPTED, session_header).into_response(),
    }
}

/// Server-sent event stream of session notifications
#[utoipa::path(
    get,
    path = "/mcp",
    responses(
        (status = 200, description = "text/event-stream of JSON-RPC notifications"),
        (status = 400, description = "Missing session id"),
        (status = 404, description = "Unknown session")
    ),
    tag = MCP_TAG
)]
async fn open_stream(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = session_id(&headers) else {
        return ApiError::bad_request("Mcp-Session-Id header is required").into_response();
    };
    let Some(receiver) = state.streams.subscribe(id) else {
        return ApiError::not_found(format!("session {id} not found")).into_response();
    };
    info!("Event stream opened for MCP session {id}");

    let events = BroadcastStream::new(receiver).filter_map(|message| match message {
        Ok(message) => Event::default()
            .event("message")
            .json_data(message)
            .ok()
            .map(Ok::<_, Infallible>),
        Err(e) => {
            warn!("MCP event stream lagging: {e}");
            None
        }
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// End a session
#[utoipa::path(
    delete,
    path = "/mcp",
    responses(
        (status = 204, description = "Session closed"),
        (status = 400, description = "Missing session id"),
        (status = 404, description = "Unknown session")
    ),
    tag = MCP_TAG
)]
async fn close_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = session_id(&headers) else {
        return ApiError::bad_request("Mcp-Session-Id header is required").into_response();
    };
    if !state.sessions.close(id) {
        return ApiError::not_found(format!("session {id} not found")).into_response();
    }
    state.streams.remove(id);
    StatusCode::NO_CONTENT.into_response()
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(post_message, open_stream, close_session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{QUERY_TOOL, REQUEST_TOOL};
    use crate::test_utils::TestFixture;
    use serde_json::json;
    use std::time::Duration;

    fn tool_names(response: &Value) -> Vec<String> {
        response["result"]["tools"]
            .as_array()
            .expect("tools array")
            .iter()
            .map(|tool| tool["name"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_session_without_grant_sees_request_tool_only() {
        let fixture = TestFixture::new().await;
        let (session_id, initialized) = fixture.mcp_initialize(None).await;
        assert_eq!(
            initialized.json["result"]["capabilities"]["tools"]["listChanged"],
            true
        );

        let listed = fixture
            .mcp(&session_id, None, json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        listed.assert_ok();
        assert_eq!(tool_names(&listed.json), vec![REQUEST_TOOL, QUERY_TOOL]);
    }

    #[tokio::test]
    async fn test_bearer_token_enables_granted_tools() {
        let fixture = TestFixture::new().await;
        let tokens = fixture
            .approve(
                "alice",
                r#"[{"type":"mcp","server":"devops-mcp-server","tools":{"metrics":true,"logs":false}}]"#,
            )
            .await;

        let (session_id, _) = fixture.mcp_initialize(Some(&tokens.access_token)).await;
        let listed = fixture
            .mcp(
                &session_id,
                Some(&tokens.access_token),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            )
            .await;
        assert_eq!(tool_names(&listed.json), vec![REQUEST_TOOL, QUERY_TOOL, "metrics"]);

        let denied = fixture
            .mcp(
                &session_id,
                Some(&tokens.access_token),
                json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "logs"}}),
            )
            .await;
        assert_eq!(denied.json["result"]["isError"], true);
        assert_eq!(
            denied.json["result"]["structuredContent"]["error"],
            "insufficient_scope"
        );
    }

    #[tokio::test]
    async fn test_revocation_pushes_list_changed() {
        let fixture = TestFixture::new().await;
        let tokens = fixture
            .approve(
                "alice",
                r#"[{"type":"mcp","server":"devops-mcp-server","tools":{"metrics":true}}]"#,
            )
            .await;
        let (session_id, _) = fixture.mcp_initialize(Some(&tokens.access_token)).await;
        let mut notifications = fixture
            .state
            .streams
            .subscribe(&session_id)
            .expect("stream registered");

        fixture
            .delete(format!("/grants/{}", tokens.grant_id))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("notification in time")
            .expect("notification");
        assert_eq!(notification["method"], "notifications/tools/list_changed");

        let listed = fixture
            .mcp(
                &session_id,
                Some(&tokens.access_token),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            )
            .await;
        assert_eq!(tool_names(&listed.json), vec![REQUEST_TOOL, QUERY_TOOL]);
    }

    #[tokio::test]
    async fn test_notification_is_accepted() {
        let fixture = TestFixture::new().await;
        let (session_id, _) = fixture.mcp_initialize(None).await;
        let response = fixture
            .mcp(
                &session_id,
                None,
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            )
            .await;
        response.assert_status(StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_unknown_and_closed_sessions() {
        let fixture = TestFixture::new().await;
        fixture
            .mcp("missing", None, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let (session_id, _) = fixture.mcp_initialize(None).await;
        let closed = fixture
            .send(
                fixture
                    .request_builder(http::Method::DELETE, "/mcp")
                    .header(SESSION_HEADER, &session_id)
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await;
        closed.assert_status(StatusCode::NO_CONTENT);
        assert!(fixture.state.streams.subscribe(&session_id).is_none());

        fixture
            .mcp(&session_id, None, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
