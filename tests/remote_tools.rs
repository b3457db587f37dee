//! Gmail REST tools and the MCP backend against fake servers.
#![cfg(feature = "server")]

mod support;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use oauth_session_agent::invoker::{normalize, ToolBackend, ToolContext};
use oauth_session_agent::mcp::{HttpTransport, McpClient, McpToolBackend};
use oauth_session_agent::tools::{register_gmail_tools, GoogleApi};
use oauth_session_agent::{AgentError, ToolCall, ToolRegistry};
use serde_json::{json, Value};

use support::spawn;

#[derive(Default)]
struct Mailbox {
    sent: Mutex<Vec<String>>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn list_messages(headers: HeaderMap) -> Response {
    match bearer(&headers).as_deref() {
        Some("ya29.gmail") => Json(json!({"messages": [{"id": "m1"}, {"id": "m2"}]})).into_response(),
        Some("ya29.flaky") => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn get_message(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "id": id,
        "threadId": format!("t-{id}"),
        "snippet": "Quarterly numbers",
        "payload": {"headers": [
            {"name": "Subject", "value": format!("Report {id}")},
            {"name": "From", "value": "boss@example.com"}
        ]}
    }))
}

async fn send_message(State(mailbox): State<Arc<Mailbox>>, Json(body): Json<Value>) -> Json<Value> {
    let raw = body["raw"].as_str().unwrap_or_default();
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(raw)
        .unwrap_or_default();
    mailbox
        .sent
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&decoded).into_owned());
    Json(json!({"id": "sent-1", "threadId": "thread-1"}))
}

async fn gmail() -> (ToolRegistry, Arc<Mailbox>) {
    let mailbox = Arc::new(Mailbox::default());
    let app = Router::new()
        .route("/users/me/messages", get(list_messages))
        // `send` shares the `:id` slot; only POST reaches it.
        .route("/users/me/messages/:id", get(get_message).post(send_message))
        .with_state(mailbox.clone());
    let addr = spawn(app).await;

    let mut registry = ToolRegistry::new();
    register_gmail_tools(
        &mut registry,
        GoogleApi::new("Gmail", format!("http://{addr}"), Duration::from_secs(5)).unwrap(),
    );
    (registry, mailbox)
}

fn ctx(token: &str) -> ToolContext<'_> {
    ToolContext {
        session_id: "s1",
        access_token: Some(token),
    }
}

#[tokio::test]
async fn lists_and_sends_mail() {
    let (registry, mailbox) = gmail().await;

    let listing = registry
        .call(&ctx("ya29.gmail"), "list_emails", json!({"max_results": 2}))
        .await
        .unwrap();
    assert_eq!(listing["count"], json!(2));
    assert_eq!(listing["messages"][1]["subject"], json!("Report m2"));

    let sent = registry
        .call(
            &ctx("ya29.gmail"),
            "send_email",
            json!({"to": "team@example.com", "subject": "Hi", "body": "Numbers attached"}),
        )
        .await
        .unwrap();
    assert_eq!(sent["message_id"], json!("sent-1"));
    let raw = mailbox.sent.lock().unwrap()[0].clone();
    assert!(raw.starts_with("To: team@example.com\r\n"));
    assert!(raw.ends_with("Numbers attached"));
}

#[tokio::test]
async fn maps_http_failures_to_error_kinds() {
    let (registry, _) = gmail().await;

    let revoked = registry
        .call(&ctx("ya29.revoked"), "list_emails", json!({}))
        .await;
    assert!(matches!(revoked, Err(AgentError::AuthenticationRequired(_))));

    let flaky = registry
        .call(&ctx("ya29.flaky"), "list_emails", json!({}))
        .await;
    assert!(matches!(flaky, Err(AgentError::TransientTool { .. })));
}

#[derive(Default)]
struct McpLog {
    bearers: Mutex<Vec<Option<String>>>,
    sessions: Mutex<Vec<Option<String>>>,
    initializations: AtomicUsize,
    /// Answer the next `tools/call` as if its MCP session had expired.
    expire_next_call: AtomicBool,
}

async fn mcp(State(log): State<Arc<McpLog>>, headers: HeaderMap, Json(req): Json<Value>) -> Response {
    log.bearers.lock().unwrap().push(bearer(&headers));
    log.sessions.lock().unwrap().push(
        headers
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    let id = req["id"].clone();
    let result = match req["method"].as_str().unwrap_or_default() {
        "initialize" => {
            let n = log.initializations.fetch_add(1, Ordering::SeqCst) + 1;
            let body = json!({"jsonrpc": "2.0", "id": id, "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-calendar", "version": "0.1.0"}
            }});
            return ([("mcp-session-id", format!("mcp-{n}"))], Json(body)).into_response();
        }
        "tools/call" if log.expire_next_call.swap(false, Ordering::SeqCst) => {
            return StatusCode::NOT_FOUND.into_response()
        }
        "notifications/initialized" => return StatusCode::ACCEPTED.into_response(),
        "tools/list" => json!({"tools": [
            {"name": "list_events", "description": "Upcoming events", "inputSchema": {"type": "object"}}
        ]}),
        "tools/call" => json!({
            "content": [{"type": "text", "text": "{\"events\": [\"Standup\"]}"}],
            "isError": false
        }),
        _ => {
            return Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}))
                .into_response()
        }
    };
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
}

#[tokio::test]
async fn mcp_backend_sends_session_bearer() {
    let log = Arc::new(McpLog::default());
    let addr = spawn(Router::new().route("/mcp", post(mcp)).with_state(log.clone())).await;

    let transport = HttpTransport::new(format!("http://{addr}/mcp"), Duration::from_secs(5)).unwrap();
    let backend = McpToolBackend::new(McpClient::new(transport));
    assert_eq!(backend.refresh_tools().await.unwrap(), vec!["list_events"]);
    assert_eq!(backend.describe()[0].description, "Upcoming events");

    let raw = backend
        .call(&ctx("ya29.session"), &ToolCall::new("list_events", json!({})))
        .await
        .unwrap();
    assert_eq!(normalize(raw), json!({"events": ["Standup"]}));

    let bearers = log.bearers.lock().unwrap().clone();
    assert_eq!(bearers.last().cloned().flatten().as_deref(), Some("ya29.session"));
    assert!(bearers[0].is_none());
}

#[tokio::test]
async fn mcp_backend_recovers_from_expired_session() {
    let log = Arc::new(McpLog::default());
    let addr = spawn(Router::new().route("/mcp", post(mcp)).with_state(log.clone())).await;

    let transport = HttpTransport::new(format!("http://{addr}/mcp"), Duration::from_secs(5)).unwrap();
    let backend = McpToolBackend::new(McpClient::new(transport));
    let call = ToolCall::new("list_events", json!({}));

    backend.call(&ctx("ya29.session"), &call).await.unwrap();
    log.expire_next_call.store(true, Ordering::SeqCst);
    let raw = backend.call(&ctx("ya29.session"), &call).await.unwrap();

    assert_eq!(normalize(raw), json!({"events": ["Standup"]}));
    assert_eq!(log.initializations.load(Ordering::SeqCst), 2);
    let sessions = log.sessions.lock().unwrap().clone();
    assert_eq!(sessions.last().cloned().flatten().as_deref(), Some("mcp-2"));
}
