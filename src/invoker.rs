//! Runs one remote tool with the session's credentials and never lets an
//! error escape: every failure becomes a [`ToolOutcome::Failure`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::error::{AgentError, Result};
use crate::mcp::ContentItem;
use crate::oauth::CredentialBroker;
use crate::session::Session;
use crate::telemetry::TelemetryCollector;
use crate::tool::ToolDescription;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// What a tool sees of the calling session.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    pub session_id: &'a str,
    pub access_token: Option<&'a str>,
}

/// The shapes remote tools hand back before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawToolResult {
    Text(String),
    Blocks(Vec<ContentItem>),
    Json(Value),
}

#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn call(&self, ctx: &ToolContext<'_>, call: &ToolCall) -> Result<RawToolResult>;

    fn requires_credentials(&self, _tool: &str) -> bool {
        true
    }

    fn describe(&self) -> Vec<ToolDescription> {
        Vec::new()
    }

    fn tool_names(&self) -> Vec<String> {
        self.describe().into_iter().map(|d| d.name).collect()
    }
}

/// Collapses text, content blocks and JSON into one JSON value. Text holding a
/// JSON document stays structured.
pub fn normalize(raw: RawToolResult) -> Value {
    match raw {
        RawToolResult::Json(value) => value,
        RawToolResult::Text(text) => parse_text(text),
        RawToolResult::Blocks(blocks) => {
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for block in blocks {
                match block {
                    ContentItem::Text { text } => texts.push(text),
                    ContentItem::Image { data, mime_type } => images.push(json!({
                        "type": "image",
                        "data": data,
                        "mimeType": mime_type.unwrap_or_else(|| "image/png".to_string()),
                    })),
                    ContentItem::Resource { resource } => {
                        texts.push(format!("[Resource: {resource}]"))
                    }
                }
            }
            let text = parse_text(texts.join("\n"));
            if images.is_empty() {
                text
            } else {
                json!({ "content": text, "images": images })
            }
        }
    }
}

fn parse_text(text: String) -> Value {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return value;
        }
    }
    Value::String(text)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure {
        error: String,
        /// Credentials are missing or revoked; the session must authorize again.
        reauthorize: bool,
    },
}

impl ToolOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        ToolOutcome::Failure {
            error: if error.is_empty() {
                "unknown tool failure".into()
            } else {
                error
            },
            reauthorize: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// The `{success, ...}` payload reported to callers.
    pub fn to_json(&self) -> Value {
        match self {
            ToolOutcome::Success(Value::Object(map)) if map.contains_key("success") => {
                Value::Object(map.clone())
            }
            ToolOutcome::Success(value) => json!({ "success": true, "result": value }),
            ToolOutcome::Failure { error, .. } => json!({ "success": false, "error": error }),
        }
    }
}

/// Fixed-delay retry: `max_retries` extra attempts after the first, no backoff growth.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn single_retry(delay: Duration) -> Self {
        Self {
            max_retries: 1,
            delay,
        }
    }

    pub async fn retry<F, Fut, T>(
        &self,
        context: &str,
        mut f: F,
        telemetry: Option<&TelemetryCollector>,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(
                        tool = context,
                        attempt = attempt + 1,
                        of = self.max_retries + 1,
                        error = %err,
                        "tool attempt failed"
                    );
                    if let Some(t) = telemetry {
                        t.record_failure(context, err.to_string(), attempt + 1);
                    }
                    if attempt >= self.max_retries || !err.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                    sleep(self.delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_retry(Duration::from_millis(500))
    }
}

pub struct ToolInvoker {
    broker: Arc<CredentialBroker>,
    backend: Arc<dyn ToolBackend>,
    policy: RetryPolicy,
    telemetry: TelemetryCollector,
}

impl ToolInvoker {
    pub fn new(broker: Arc<CredentialBroker>, backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            broker,
            backend,
            policy: RetryPolicy::default(),
            telemetry: TelemetryCollector::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.backend.tool_names()
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        self.backend.describe()
    }

    pub async fn invoke(&self, session: &mut Session, tool_name: &str, args: Value) -> ToolOutcome {
        let call = ToolCall::new(tool_name, args);

        let credentials = if self.backend.requires_credentials(tool_name) {
            match self.broker.ensure_valid(session).await {
                Ok(token) => Some(token),
                Err(err @ AgentError::AuthenticationRequired(_)) => {
                    return ToolOutcome::Failure {
                        error: err.to_string(),
                        reauthorize: true,
                    }
                }
                Err(err) => {
                    tracing::warn!(session_id = %session.id, tool = tool_name, error = %err, "could not resolve credentials");
                    return ToolOutcome::failure(err.to_string());
                }
            }
        } else {
            None
        };

        let ctx = ToolContext {
            session_id: &session.id,
            access_token: credentials.as_ref().map(|t| t.access_token.as_str()),
        };
        tracing::debug!(session_id = %session.id, tool = tool_name, "invoking tool");

        let backend = self.backend.as_ref();
        let (ctx, call) = (&ctx, &call);
        let result = self
            .policy
            .retry(
                tool_name,
                move |_| backend.call(ctx, call),
                Some(&self.telemetry),
            )
            .await;

        match result {
            Ok(raw) => ToolOutcome::Success(normalize(raw)),
            // The provider rejected the token we just vouched for.
            Err(err @ AgentError::AuthenticationRequired(_)) => ToolOutcome::Failure {
                error: err.to_string(),
                reauthorize: true,
            },
            Err(AgentError::ToolRejected { message, .. }) => ToolOutcome::failure(message),
            Err(err) => ToolOutcome::failure(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::oauth::tests::{StubEndpoint, GOOD_CODE};
    use crate::session::SessionRegistry;
    use crate::storage::InMemorySessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then echoes the tool name.
    struct FlakyBackend {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolBackend for FlakyBackend {
        async fn call(&self, ctx: &ToolContext<'_>, call: &ToolCall) -> Result<RawToolResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(AgentError::TransientTool {
                    name: call.name.clone(),
                    message: "connection reset".into(),
                });
            }
            Ok(RawToolResult::Text(format!(
                "{{\"tool\":\"{}\",\"token\":\"{}\"}}",
                call.name,
                ctx.access_token.unwrap_or_default()
            )))
        }
    }

    async fn authenticated(backend: Arc<FlakyBackend>) -> (ToolInvoker, Session) {
        let registry = SessionRegistry::new(
            Arc::new(InMemorySessionStore::default()),
            Duration::from_secs(1800),
        );
        let broker = Arc::new(CredentialBroker::new(
            ProviderConfig::google_calendar().with_client("id", "secret"),
            Arc::new(StubEndpoint::default()),
            registry,
        ));
        let mut session = Session::new("s1");
        broker.begin_authorization("s1").unwrap();
        broker
            .complete_authorization(&mut session, GOOD_CODE)
            .await
            .unwrap();
        let invoker = ToolInvoker::new(broker, backend)
            .with_policy(RetryPolicy::single_retry(Duration::from_millis(1)));
        (invoker, session)
    }

    #[tokio::test]
    async fn one_failure_then_success_returns_result() {
        let backend = Arc::new(FlakyBackend::new(1));
        let (invoker, mut session) = authenticated(backend.clone()).await;

        let outcome = invoker.invoke(&mut session, "list_events", json!({})).await;
        assert_eq!(
            outcome,
            ToolOutcome::Success(json!({"tool": "list_events", "token": "access-1"}))
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(invoker.telemetry().failures().len(), 1);
    }

    #[tokio::test]
    async fn two_failures_return_structured_error() {
        let backend = Arc::new(FlakyBackend::new(2));
        let (invoker, mut session) = authenticated(backend.clone()).await;

        let outcome = invoker.invoke(&mut session, "list_events", json!({})).await;
        let payload = outcome.to_json();
        assert_eq!(payload["success"], json!(false));
        assert!(!payload["error"].as_str().unwrap().is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthenticated_session_never_reaches_backend() {
        let backend = Arc::new(FlakyBackend::new(0));
        let (invoker, _) = authenticated(backend.clone()).await;
        let mut stranger = Session::new("s2");

        let outcome = invoker.invoke(&mut stranger, "list_events", json!({})).await;
        assert!(matches!(
            outcome,
            ToolOutcome::Failure {
                reauthorize: true,
                ..
            }
        ));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    /// Answers every call with a tool-level refusal.
    struct RefusingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolBackend for RefusingBackend {
        async fn call(&self, _ctx: &ToolContext<'_>, call: &ToolCall) -> Result<RawToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::ToolRejected {
                name: call.name.clone(),
                message: "calendar is read-only".into(),
            })
        }
    }

    #[tokio::test]
    async fn rejected_call_fails_without_retry() {
        let (invoker, mut session) = authenticated(Arc::new(FlakyBackend::new(0))).await;
        let refusing = Arc::new(RefusingBackend {
            calls: AtomicUsize::new(0),
        });
        let invoker = ToolInvoker::new(invoker.broker.clone(), refusing.clone())
            .with_policy(RetryPolicy::single_retry(Duration::from_millis(1)));

        let outcome = invoker.invoke(&mut session, "create_event", json!({})).await;
        assert!(!outcome.is_success());
        assert_eq!(
            outcome,
            ToolOutcome::Failure {
                error: "calendar is read-only".into(),
                reauthorize: false,
            }
        );
        assert_eq!(refusing.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn normalizes_result_shapes() {
        assert_eq!(
            normalize(RawToolResult::Text("plain words".into())),
            json!("plain words")
        );
        assert_eq!(
            normalize(RawToolResult::Text("{\"success\": true}".into())),
            json!({"success": true})
        );
        assert_eq!(
            normalize(RawToolResult::Blocks(vec![
                ContentItem::Text { text: "line one".into() },
                ContentItem::Text { text: "line two".into() },
            ])),
            json!("line one\nline two")
        );
        let with_image = normalize(RawToolResult::Blocks(vec![
            ContentItem::Text { text: "chart".into() },
            ContentItem::Image {
                data: "AAAA".into(),
                mime_type: None,
            },
        ]));
        assert_eq!(with_image["content"], json!("chart"));
        assert_eq!(with_image["images"][0]["mimeType"], json!("image/png"));
    }

    #[test]
    fn outcome_payload_keeps_existing_success_flag() {
        let outcome = ToolOutcome::Success(json!({"success": true, "message_id": "m1"}));
        assert_eq!(outcome.to_json()["message_id"], json!("m1"));

        let wrapped = ToolOutcome::Success(json!(["a", "b"]));
        assert_eq!(wrapped.to_json(), json!({"success": true, "result": ["a", "b"]}));

        assert_eq!(
            ToolOutcome::failure("").to_json(),
            json!({"success": false, "error": "unknown tool failure"})
        );
    }
}
