//! Thin authenticated client shared by the Google REST tools.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::invoker::ToolContext;

pub const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1";
pub const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Clone)]
pub struct GoogleApi {
    http: reqwest::Client,
    base_url: String,
    label: &'static str,
}

impl GoogleApi {
    pub fn new(label: &'static str, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Configuration(format!("http client error: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            label,
        })
    }

    pub fn gmail(timeout: Duration) -> Result<Self> {
        Self::new("Gmail", GMAIL_API, timeout)
    }

    pub fn calendar(timeout: Duration) -> Result<Self> {
        Self::new("Calendar", CALENDAR_API, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, ctx: &ToolContext<'_>, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = ctx
            .access_token
            .ok_or_else(|| AgentError::AuthenticationRequired(ctx.session_id.to_string()))?;
        Ok(self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(token))
    }

    async fn send(&self, ctx: &ToolContext<'_>, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await.map_err(|e| AgentError::TransientTool {
            name: self.label.to_string(),
            message: format!("request failed: {e}"),
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AgentError::AuthenticationRequired(ctx.session_id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{} API error {status}: {body}", self.label);
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                AgentError::TransientTool {
                    name: self.label.to_string(),
                    message,
                }
            } else {
                AgentError::Protocol(message)
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let text = response.text().await.map_err(|e| AgentError::TransientTool {
            name: self.label.to_string(),
            message: format!("failed to read response: {e}"),
        })?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| AgentError::Protocol(format!("Failed to parse response: {e}")))
    }

    pub async fn get(
        &self,
        ctx: &ToolContext<'_>,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value> {
        let builder = self.request(ctx, Method::GET, path)?.query(query);
        self.send(ctx, builder).await
    }

    pub async fn post(&self, ctx: &ToolContext<'_>, path: &str, body: &Value) -> Result<Value> {
        let builder = self.request(ctx, Method::POST, path)?.json(body);
        self.send(ctx, builder).await
    }

    pub async fn delete(&self, ctx: &ToolContext<'_>, path: &str) -> Result<Value> {
        let builder = self.request(ctx, Method::DELETE, path)?;
        self.send(ctx, builder).await
    }
}

/// Reads a required string argument.
pub(crate) fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input[key]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AgentError::Protocol(format!("missing '{key}' parameter")))
}

/// Path segments such as calendar ids may contain `@` and `#`.
pub(crate) fn segment(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trims_trailing_slash() {
        let api = GoogleApi::new("Test", "http://127.0.0.1:9/v1/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url(), "http://127.0.0.1:9/v1");
    }

    #[tokio::test]
    async fn refuses_to_send_without_token() {
        let api = GoogleApi::gmail(Duration::from_secs(1)).unwrap();
        let ctx = ToolContext {
            session_id: "s1",
            access_token: None,
        };
        assert!(matches!(
            api.get(&ctx, "/users/me/profile", &[]).await,
            Err(AgentError::AuthenticationRequired(id)) if id == "s1"
        ));
    }

    #[test]
    fn required_arguments() {
        let input = json!({"to": "a@example.com", "subject": "  "});
        assert_eq!(required_str(&input, "to").unwrap(), "a@example.com");
        assert!(required_str(&input, "subject").is_err());
        assert!(required_str(&input, "body").is_err());
        assert_eq!(segment("team@group.calendar.google.com"), "team%40group.calendar.google.com");
    }
}
