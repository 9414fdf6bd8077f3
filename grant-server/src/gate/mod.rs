//! Per-session enablement of MCP tools, driven by the session's grant

use crate::grants::Grant;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod protocol;
pub mod session;

pub use session::{McpSession, NotificationSink, SessionManager};

/// Tool through which a session asks for more access. Always enabled.
pub const REQUEST_TOOL: &str = "grant:request";
/// Tool that reports what the session's grant currently allows. Always enabled.
pub const QUERY_TOOL: &str = "grant:query";

/// Tools every session has regardless of its grant, in listing order
pub const BUILTIN_TOOLS: [&str; 2] = [REQUEST_TOOL, QUERY_TOOL];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    fn request_tool() -> Self {
        Self {
            name: REQUEST_TOOL.to_string(),
            description: "Request authorization for additional tools. Returns a URL the \
                          user opens to approve the request."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tools": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Tools to request; all tools when omitted"
                    }
                }
            }),
        }
    }

    fn query_tool() -> Self {
        Self {
            name: QUERY_TOOL.to_string(),
            description: "Show the grant bound to this session: its status, the tools it \
                          enables and the permissions it holds."
                .to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }
}

/// The tools an MCP endpoint exposes, besides the built-in grant tools
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    /// Registry of tools known only by name
    pub fn from_names(names: &[String]) -> Self {
        Self::new(
            names
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.clone(),
                    description: format!("Invoke {name}"),
                    input_schema: json!({"type": "object"}),
                })
                .collect(),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|tool| tool.name.as_str())
    }

    /// Descriptors of the tools a gate currently enables, built-in tools first
    pub fn enabled(&self, gate: &ToolGate) -> Vec<ToolDescriptor> {
        [ToolDescriptor::request_tool(), ToolDescriptor::query_tool()]
            .into_iter()
            .chain(
                self.tools
                    .iter()
                    .filter(|tool| gate.is_enabled(&tool.name))
                    .cloned(),
            )
            .collect()
    }
}

/// Tool decisions a grant holds for one MCP server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolAuthorization {
    tools: BTreeMap<String, Option<bool>>,
}

impl ToolAuthorization {
    pub fn none() -> Self {
        Self::default()
    }

    /// Merge the tools of every mcp detail for `origin`, later details winning.
    /// Grants that are missing or not active authorize nothing.
    pub fn from_grant(grant: Option<&Grant>, origin: &str) -> Self {
        let Some(grant) = grant.filter(|grant| grant.is_active()) else {
            return Self::none();
        };
        let tools = grant
            .authorization_details
            .iter()
            .filter_map(|detail| detail.as_mcp())
            .filter(|mcp| mcp.server == origin)
            .flat_map(|mcp| mcp.tools.iter().map(|(name, value)| (name.clone(), *value)))
            .collect();
        Self { tools }
    }

    pub fn is_authorized(&self, tool: &str) -> bool {
        matches!(self.tools.get(tool), Some(Some(true)))
    }
}

/// Tools switched by one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateTransition {
    pub enabled: Vec<String>,
    pub disabled: Vec<String>,
}

impl GateTransition {
    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty() && self.disabled.is_empty()
    }
}

/// Enabled/disabled state of each registered tool in one session
#[derive(Debug, Clone)]
pub struct ToolGate {
    tools: BTreeMap<String, bool>,
}

impl ToolGate {
    /// Every registered tool starts disabled
    pub fn new(registry: &ToolRegistry) -> Self {
        Self {
            tools: registry.names().map(|name| (name.to_string(), false)).collect(),
        }
    }

    /// Bring the gate in line with `authorization`
    pub fn evaluate(&mut self, authorization: &ToolAuthorization) -> GateTransition {
        let mut transition = GateTransition::default();
        for (name, enabled) in self.tools.iter_mut() {
            let authorized = authorization.is_authorized(name);
            if authorized && !*enabled {
                transition.enabled.push(name.clone());
            } else if !authorized && *enabled {
                transition.disabled.push(name.clone());
            }
            *enabled = authorized;
        }
        transition
    }

    pub fn is_enabled(&self, tool: &str) -> bool {
        BUILTIN_TOOLS.contains(&tool) || self.tools.get(tool).copied().unwrap_or(false)
    }

    pub fn enabled_tools(&self) -> Vec<&str> {
        BUILTIN_TOOLS
            .into_iter()
            .chain(
                self.tools
                    .iter()
                    .filter(|(_, enabled)| **enabled)
                    .map(|(name, _)| name.as_str()),
            )
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("tool '{tool}' is not authorized for this grant")]
    InsufficientScope {
        tool: String,
        authorization_url: Option<String>,
    },
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool invocation failed: {0}")]
    Invocation(String),
}

/// Runs a tool once the gate has let the call through
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, GateError>;
}

/// Invoker that reports the call as authorized without running anything
pub struct AcknowledgingInvoker;

#[async_trait]
impl ToolInvoker for AcknowledgingInvoker {
    async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, GateError> {
        Ok(json!({
            "content": [{"type": "text", "text": format!("{tool} authorized")}],
            "structuredContent": {"tool": tool, "arguments": arguments},
            "isError": false
        }))
    }
}
