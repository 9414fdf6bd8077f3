//! JSON-RPC messages of the MCP endpoint

use super::session::{McpSession, SessionManager};
use super::{GateError, QUERY_TOOL, REQUEST_TOOL};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

pub fn list_changed_notification() -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "method": "notifications/tools/list_changed"})
}

fn text_result(text: String, structured: Value, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "structuredContent": structured,
        "isError": is_error
    })
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
struct RequestToolArguments {
    #[serde(default)]
    tools: Vec<String>,
}

/// Handle one message. Notifications produce no response.
pub async fn dispatch(
    manager: &SessionManager,
    session: &McpSession,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let Some(id) = request.id else {
        debug!("Session {} notification {}", session.id, request.method);
        return None;
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return Some(JsonRpcResponse::error(
            id,
            INVALID_PARAMS,
            "unsupported jsonrpc version",
        ));
    }
    let params = request.params.unwrap_or(Value::Null);

    let response = match request.method.as_str() {
        "initialize" => {
            manager.evaluate(session).await;
            let version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION);
            JsonRpcResponse::result(
                id,
                json!({
                    "protocolVersion": version,
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": "grant-server", "version": env!("CARGO_PKG_VERSION")}
                }),
            )
        }
        "ping" => JsonRpcResponse::result(id, json!({})),
        "tools/list" => {
            manager.evaluate(session).await;
            let tools = manager.list_tools(session).await;
            JsonRpcResponse::result(id, json!({ "tools": tools }))
        }
        "tools/call" => match serde_json::from_value::<CallParams>(params) {
            Ok(call) => call_tool(manager, session, id, call).await,
            Err(e) => JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        },
        other => {
            warn!("Session {} called unknown method {other}", session.id);
            JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("method '{other}' not found"))
        }
    };
    Some(response)
}

async fn call_tool(
    manager: &SessionManager,
    session: &McpSession,
    id: Value,
    call: CallParams,
) -> JsonRpcResponse {
    manager.evaluate(session).await;

    if call.name == REQUEST_TOOL {
        let arguments: RequestToolArguments = if call.arguments.is_null() {
            RequestToolArguments::default()
        } else {
            match serde_json::from_value(call.arguments) {
                Ok(arguments) => arguments,
                Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, e.to_string()),
            }
        };
        return match manager.request_authorization(session, &arguments.tools).await {
            Ok(prompt) => {
                info!("Session {} requested authorization", session.id);
                JsonRpcResponse::result(
                    id,
                    text_result(
                        format!("Open {} to approve the request", prompt.authorization_url),
                        json!({
                            "authorization_url": prompt.authorization_url,
                            "request_uri": prompt.request_uri,
                            "expires_in": prompt.expires_in,
                            "code_verifier": prompt.code_verifier
                        }),
                        false,
                    ),
                )
            }
            Err(e) => gate_error(id, e),
        };
    }

    if call.name == QUERY_TOOL {
        let summary = manager.describe_grant(session).await;
        let text = match (&summary.grant_id, summary.status) {
            (Some(grant_id), Some(status)) => format!(
                "Grant {grant_id} is {status:?}, enabled tools: {}",
                summary.enabled_tools.join(", ")
            ),
            _ => "No grant is bound to this session".to_string(),
        };
        return match serde_json::to_value(&summary) {
            Ok(structured) => JsonRpcResponse::result(id, text_result(text, structured, false)),
            Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
        };
    }

    if !manager.registry().contains(&call.name) {
        return gate_error(id, GateError::UnknownTool(call.name));
    }
    if !manager.is_enabled(session, &call.name).await {
        let authorization_url = match manager
            .request_authorization(session, std::slice::from_ref(&call.name))
            .await
        {
            Ok(prompt) => Some(prompt.authorization_url),
            Err(e) => {
                warn!("Failed to start authorization for {}: {e}", call.name);
                None
            }
        };
        return gate_error(
            id,
            GateError::InsufficientScope {
                tool: call.name,
                authorization_url,
            },
        );
    }

    match manager.invoker().invoke(&call.name, call.arguments).await {
        Ok(result) => JsonRpcResponse::result(id, result),
        Err(e) => gate_error(id, e),
    }
}

/// Gate failures are reported to the model as tool errors, argument
/// problems as JSON-RPC errors
fn gate_error(id: Value, error: GateError) -> JsonRpcResponse {
    let message = error.to_string();
    match error {
        GateError::InsufficientScope {
            tool,
            authorization_url,
        } => {
            let text = match &authorization_url {
                Some(url) => format!("{message}. Authorize it at {url}"),
                None => message,
            };
            JsonRpcResponse::result(
                id,
                text_result(
                    text,
                    json!({
                        "error": "insufficient_scope",
                        "tool": tool,
                        "authorization_url": authorization_url
                    }),
                    true,
                ),
            )
        }
        GateError::UnknownTool(_) | GateError::InvalidArguments(_) => {
            JsonRpcResponse::error(id, INVALID_PARAMS, message)
        }
        GateError::Invocation(_) => JsonRpcResponse::error(id, INTERNAL_ERROR, message),
    }
}
