//! Gmail tools backed by the Gmail REST API.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};

use super::google::{required_str, segment, GoogleApi};
use crate::error::Result;
use crate::invoker::ToolContext;
use crate::tool::{Tool, ToolRegistry};

const MAX_LIST_RESULTS: u64 = 50;

fn header(message: &Value, name: &str) -> Option<String> {
    message["payload"]["headers"].as_array().and_then(|headers| {
        headers
            .iter()
            .find(|h| {
                h["name"]
                    .as_str()
                    .map(|n| n.eq_ignore_ascii_case(name))
                    .unwrap_or(false)
            })
            .and_then(|h| h["value"].as_str())
            .map(String::from)
    })
}

fn decode_part(data: &str) -> Option<String> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Plain-text body, searching nested multipart payloads.
fn plain_body(payload: &Value) -> Option<String> {
    if let Some(data) = payload["body"]["data"].as_str() {
        let mime = payload["mimeType"].as_str().unwrap_or("text/plain");
        if mime.starts_with("text/plain") {
            return decode_part(data);
        }
    }
    payload["parts"]
        .as_array()
        .and_then(|parts| parts.iter().find_map(plain_body))
}

fn summarize(message: &Value) -> Value {
    json!({
        "id": message["id"],
        "thread_id": message["threadId"],
        "subject": header(message, "Subject"),
        "from": header(message, "From"),
        "to": header(message, "To"),
        "date": header(message, "Date"),
        "snippet": message["snippet"],
    })
}

/// RFC 2822 message, base64url-encoded as the send endpoint expects.
fn encode_message(to: &str, subject: &str, body: &str, cc: Option<&str>) -> String {
    let mut raw = format!("To: {to}\r\n");
    if let Some(cc) = cc.filter(|c| !c.is_empty()) {
        raw.push_str(&format!("Cc: {cc}\r\n"));
    }
    raw.push_str(&format!(
        "Subject: {subject}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}"
    ));
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

pub struct ListEmailsTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for ListEmailsTool {
    fn name(&self) -> &str {
        "list_emails"
    }

    fn description(&self) -> &str {
        "List recent emails, optionally filtered by a Gmail search query."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Gmail search query (e.g., 'from:example@gmail.com', 'is:unread')"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of messages to return (default: 10)"
                }
            }
        }))
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value> {
        let query = input["query"].as_str().unwrap_or("");
        let max_results = input["max_results"]
            .as_u64()
            .unwrap_or(10)
            .clamp(1, MAX_LIST_RESULTS);

        let mut params = vec![("maxResults", max_results.to_string())];
        if !query.is_empty() {
            params.push(("q", query.to_string()));
        }
        let listing = self.api.get(ctx, "/users/me/messages", &params).await?;

        let ids: Vec<&str> = listing["messages"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|m| m["id"].as_str()).collect())
            .unwrap_or_default();

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let path = format!("/users/me/messages/{}", segment(id));
            let metadata = [
                ("format", "metadata".to_string()),
                ("metadataHeaders", "Subject".to_string()),
                ("metadataHeaders", "From".to_string()),
                ("metadataHeaders", "To".to_string()),
                ("metadataHeaders", "Date".to_string()),
            ];
            match self.api.get(ctx, &path, &metadata).await {
                Ok(message) => messages.push(summarize(&message)),
                Err(err) => tracing::debug!(message_id = id, error = %err, "skipping message"),
            }
        }

        Ok(json!({
            "success": true,
            "query": query,
            "count": messages.len(),
            "messages": messages,
        }))
    }
}

pub struct ReadEmailTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for ReadEmailTool {
    fn name(&self) -> &str {
        "read_email"
    }

    fn description(&self) -> &str {
        "Read the full content of a specific email."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "message_id": {"type": "string", "description": "The Gmail message ID"}
            },
            "required": ["message_id"]
        }))
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value> {
        let message_id = required_str(&input, "message_id")?;
        let message = self
            .api
            .get(
                ctx,
                &format!("/users/me/messages/{}", segment(message_id)),
                &[("format", "full".to_string())],
            )
            .await?;

        let mut summary = summarize(&message);
        summary["success"] = json!(true);
        summary["body"] = json!(plain_body(&message["payload"]));
        summary["labels"] = message["labelIds"].clone();
        Ok(summary)
    }
}

pub struct SendEmailTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Send a plain-text email from the authenticated account."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "to": {"type": "string", "description": "Recipient email address"},
                "subject": {"type": "string", "description": "Email subject"},
                "body": {"type": "string", "description": "Email body content"},
                "cc": {"type": "string", "description": "Optional CC recipients"}
            },
            "required": ["to", "subject", "body"]
        }))
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value> {
        let to = required_str(&input, "to")?;
        let subject = required_str(&input, "subject")?;
        let body = input["body"].as_str().unwrap_or_default();
        let raw = encode_message(to, subject, body, input["cc"].as_str());

        let sent = self
            .api
            .post(ctx, "/users/me/messages/send", &json!({ "raw": raw }))
            .await?;
        tracing::info!(session_id = ctx.session_id, "email sent");

        Ok(json!({
            "success": true,
            "message_id": sent["id"],
            "thread_id": sent["threadId"],
            "to": to,
            "subject": subject,
        }))
    }
}

pub struct DeleteEmailTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for DeleteEmailTool {
    fn name(&self) -> &str {
        "delete_email"
    }

    fn description(&self) -> &str {
        "Move an email to the trash."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "message_id": {"type": "string", "description": "The Gmail message ID"}
            },
            "required": ["message_id"]
        }))
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value> {
        let message_id = required_str(&input, "message_id")?;
        self.api
            .post(
                ctx,
                &format!("/users/me/messages/{}/trash", segment(message_id)),
                &json!({}),
            )
            .await?;
        Ok(json!({
            "success": true,
            "message_id": message_id,
            "message": "Email moved to trash",
        }))
    }
}

pub struct GetProfileTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for GetProfileTool {
    fn name(&self) -> &str {
        "get_profile"
    }

    fn description(&self) -> &str {
        "Show the authenticated account's address and mailbox totals."
    }

    async fn call(&self, ctx: &ToolContext<'_>, _input: Value) -> Result<Value> {
        let profile = self.api.get(ctx, "/users/me/profile", &[]).await?;
        Ok(json!({
            "success": true,
            "email": profile["emailAddress"],
            "messages_total": profile["messagesTotal"],
            "threads_total": profile["threadsTotal"],
        }))
    }
}

pub fn register_gmail_tools(registry: &mut ToolRegistry, api: GoogleApi) {
    registry.register(ListEmailsTool { api: api.clone() });
    registry.register(ReadEmailTool { api: api.clone() });
    registry.register(SendEmailTool { api: api.clone() });
    registry.register(DeleteEmailTool { api: api.clone() });
    registry.register(GetProfileTool { api });
}
