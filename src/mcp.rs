//! MCP (Model Context Protocol) client over HTTP.
//!
//! Tool calls are JSON-RPC requests POSTed to a single endpoint. Each request
//! carries the calling session's access token as a bearer header, so one
//! client can serve many sessions without sharing credentials.
//!
//! # Example
//! ```rust,ignore
//! use oauth_session_agent::mcp::{HttpTransport, McpClient, McpToolBackend};
//!
//! let client = McpClient::new(HttpTransport::new("http://localhost:8081/mcp", timeout)?);
//! let backend = McpToolBackend::new(client);
//! backend.refresh_tools().await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::invoker::{RawToolResult, ToolBackend, ToolCall, ToolContext};
use crate::tool::ToolDescription;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SESSION_HEADER: &str = "mcp-session-id";

// ─────────────────────────────────────────────────────────────────────────────
// Protocol types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    fn call(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(0),
            method: method.to_string(),
            params,
        }
    }

    fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "resource")]
    Resource { resource: Value },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Sends a request; notifications (no id) resolve to `None`.
    async fn send(
        &self,
        request: JsonRpcRequest,
        bearer: Option<&str>,
    ) -> Result<Option<JsonRpcResponse>>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
    session: RwLock<Option<String>>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Configuration(format!("http client error: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            request_id: AtomicU64::new(1),
            session: RwLock::new(None),
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    /// Clears the stored session unless a newer one already replaced it.
    fn forget_session(&self, expired: &str) {
        if let Ok(mut slot) = self.session.write() {
            if slot.as_deref() == Some(expired) {
                *slot = None;
            }
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(
        &self,
        mut request: JsonRpcRequest,
        bearer: Option<&str>,
    ) -> Result<Option<JsonRpcResponse>> {
        let id = request
            .id
            .map(|_| self.request_id.fetch_add(1, Ordering::SeqCst));
        request.id = id;

        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&request);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        let sent_session = self.session_id();
        if let Some(session) = &sent_session {
            builder = builder.header(SESSION_HEADER, session.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::Mcp(format!("HTTP request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            if let Some(expired) = sent_session {
                self.forget_session(&expired);
                return Err(AgentError::McpSessionExpired(expired));
            }
        }

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session.write() {
                *slot = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Mcp(format!("server returned {status}: {body}")));
        }
        let Some(id) = id else {
            return Ok(None);
        };

        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Mcp(format!("failed to read response: {e}")))?;

        let parsed = if is_stream {
            parse_event_stream(&body, id)?
        } else {
            serde_json::from_str(&body)
                .map_err(|e| AgentError::Mcp(format!("Failed to parse response: {e}")))?
        };
        Ok(Some(parsed))
    }
}

/// Picks the response for `id` out of an SSE body (`data:` lines).
fn parse_event_stream(body: &str, id: u64) -> Result<JsonRpcResponse> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(data).ok())
        .find(|response| response.id == Some(id))
        .ok_or_else(|| AgentError::Mcp(format!("no response for request {id} in event stream")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Shared by every session. Only the handshake is serialized; tool calls run
/// concurrently and carry their own bearer token.
pub struct McpClient<T: McpTransport> {
    transport: T,
    server_info: tokio::sync::RwLock<Option<ServerInfo>>,
}

impl<T: McpTransport> McpClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            server_info: tokio::sync::RwLock::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn is_initialized(&self) -> bool {
        self.server_info.read().await.is_some()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().await.clone()
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        bearer: Option<&str>,
    ) -> Result<Value> {
        let response = self
            .transport
            .send(JsonRpcRequest::call(method, params), bearer)
            .await?
            .ok_or_else(|| AgentError::Mcp(format!("{method}: empty response")))?;
        if let Some(error) = response.error {
            return Err(AgentError::Mcp(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            )));
        }
        Ok(response.result.unwrap_or_default())
    }

    pub async fn initialize(&self, bearer: Option<&str>) -> Result<ServerInfo> {
        if let Some(info) = self.server_info.read().await.clone() {
            return Ok(info);
        }

        let mut slot = self.server_info.write().await;
        if let Some(info) = slot.clone() {
            return Ok(info);
        }
        let result = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "oauth-session-agent",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
                bearer,
            )
            .await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Mcp(format!("Failed to parse initialize result: {e}")))?;
        tracing::info!(
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "mcp session initialized"
        );
        self.transport
            .send(JsonRpcRequest::notification("notifications/initialized"), bearer)
            .await?;
        *slot = Some(result.server_info.clone());
        Ok(result.server_info)
    }

    /// Runs `method` after the handshake. When the server has dropped our MCP
    /// session the handshake is redone and the request sent once more.
    async fn initialized_request(
        &self,
        method: &str,
        params: Option<Value>,
        bearer: Option<&str>,
    ) -> Result<Value> {
        self.initialize(bearer).await?;
        match self.request(method, params.clone(), bearer).await {
            Err(AgentError::McpSessionExpired(expired)) => {
                tracing::info!(session = %expired, method, "mcp session expired, reinitializing");
                self.server_info.write().await.take();
                self.initialize(bearer).await?;
                self.request(method, params, bearer).await
            }
            other => other,
        }
    }

    pub async fn list_tools(&self, bearer: Option<&str>) -> Result<Vec<McpToolDefinition>> {
        let result = self.initialized_request("tools/list", None, bearer).await?;
        let result: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Mcp(format!("Failed to parse list_tools result: {e}")))?;
        Ok(result.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        bearer: Option<&str>,
    ) -> Result<CallToolResult> {
        let result = self
            .initialized_request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
                bearer,
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| AgentError::Mcp(format!("Failed to parse call_tool result: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool backend
// ─────────────────────────────────────────────────────────────────────────────

/// Routes tool calls to a remote MCP server with the session's bearer token.
pub struct McpToolBackend<T: McpTransport> {
    client: McpClient<T>,
    tools: RwLock<Vec<ToolDescription>>,
}

impl<T: McpTransport> McpToolBackend<T> {
    pub fn new(client: McpClient<T>) -> Self {
        Self {
            client,
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &McpClient<T> {
        &self.client
    }

    /// Fetches and caches the server's tool list, returning the names.
    pub async fn refresh_tools(&self) -> Result<Vec<String>> {
        let described: Vec<ToolDescription> = self
            .client
            .list_tools(None)
            .await?
            .into_iter()
            .map(|tool| ToolDescription {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                parameters: Some(tool.input_schema).filter(|schema| !schema.is_null()),
            })
            .collect();
        let names = described.iter().map(|d| d.name.clone()).collect();
        if let Ok(mut cached) = self.tools.write() {
            *cached = described;
        }
        Ok(names)
    }
}

#[async_trait]
impl<T: McpTransport> ToolBackend for McpToolBackend<T> {
    async fn call(&self, ctx: &ToolContext<'_>, call: &ToolCall) -> Result<RawToolResult> {
        let arguments = match &call.arguments {
            Value::Null => json!({}),
            other => other.clone(),
        };
        let result = self
            .client
            .call_tool(&call.name, arguments, ctx.access_token)
            .await?;

        if result.is_error {
            let message = result
                .content
                .iter()
                .map(|c| match c {
                    ContentItem::Text { text } => text.clone(),
                    ContentItem::Image { .. } => "[image]".to_string(),
                    ContentItem::Resource { .. } => "[resource]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            return Err(AgentError::ToolRejected {
                name: call.name.clone(),
                message,
            });
        }
        Ok(RawToolResult::Blocks(result.content))
    }

    fn describe(&self) -> Vec<ToolDescription> {
        self.tools.read().map(|t| t.clone()).unwrap_or_default()
    }
}
