//! HTTP surfaces: the agent API and the OAuth redirect server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::config::CallbackConfig;
use crate::error::{AgentError, Result};
use crate::router::{CallbackResponse, ConversationRouter, InboundMessage};
use crate::session::AuthState;

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthCallbackRequest {
    pub session_id: String,
    pub auth_code: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub state: AuthState,
    pub authenticated: bool,
    pub awaiting_code: bool,
    pub scopes: Vec<String>,
    pub expires_at: Option<u64>,
}

/// Chat, callback and status endpoints in front of a [`ConversationRouter`].
#[derive(Clone)]
pub struct AgentServer {
    router: Arc<ConversationRouter>,
}

impl AgentServer {
    pub fn new(router: Arc<ConversationRouter>) -> Self {
        Self { router }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/health", get(Self::health))
            .route("/chat", post(Self::chat))
            .route("/oauth/callback", post(Self::oauth_callback))
            .route("/sessions/:id/status", get(Self::status))
            .with_state(Arc::new(self))
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        self.serve_on(TcpListener::bind(addr).await?).await
    }

    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "agent server listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|err| AgentError::Protocol(format!("server error: {err}")))
    }

    async fn health() -> &'static str {
        "ok"
    }

    async fn chat(State(state): State<Arc<Self>>, Json(mut message): Json<InboundMessage>) -> Response {
        if message.session_id.trim().is_empty() {
            message.session_id = uuid::Uuid::new_v4().to_string();
        }
        match state.router.handle_message(message).await {
            Some(reply) => Json(reply).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        }
    }

    async fn oauth_callback(
        State(state): State<Arc<Self>>,
        Json(req): Json<OAuthCallbackRequest>,
    ) -> Json<CallbackResponse> {
        tracing::info!(session_id = %req.session_id, "oauth callback received");
        Json(
            state
                .router
                .handle_callback(&req.session_id, &req.auth_code)
                .await,
        )
    }

    async fn status(State(state): State<Arc<Self>>, Path(id): Path<String>) -> Response {
        let session = match state.router.sessions().get(&id).await {
            Ok(session) => session,
            Err(err) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": err.to_string()})),
                )
                    .into_response()
            }
        };
        let Some(session) = session else {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "session not found"})),
            )
                .into_response();
        };
        let status = state.router.broker().auth_status(&session);
        Json(SessionStatusResponse {
            session_id: id,
            state: session.state(),
            authenticated: status.authenticated,
            awaiting_code: status.awaiting_code,
            scopes: status.scopes,
            expires_at: status.expires_at,
        })
        .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Receives the provider's browser redirect and forwards the code to the agent.
#[derive(Clone)]
pub struct CallbackServer {
    http: reqwest::Client,
    forward_url: String,
}

impl CallbackServer {
    pub fn new(forward_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AgentError::Configuration(format!("http client error: {err}")))?;
        Ok(Self {
            http,
            forward_url: forward_url.into(),
        })
    }

    pub fn from_config(cfg: &CallbackConfig) -> Result<Self> {
        Self::new(
            cfg.forward_url.clone(),
            Duration::from_secs(cfg.forward_timeout_secs),
        )
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/callback", get(Self::callback))
            .route("/health", get(|| async { "ok" }))
            .with_state(Arc::new(self))
    }

    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        self.serve_on(TcpListener::bind(addr).await?).await
    }

    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "callback server listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|err| AgentError::Protocol(format!("server error: {err}")))
    }

    async fn forward(&self, session_id: &str, code: &str) -> Result<CallbackResponse> {
        let response = self
            .http
            .post(&self.forward_url)
            .json(&OAuthCallbackRequest {
                session_id: session_id.to_string(),
                auth_code: code.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn callback(
        State(state): State<Arc<Self>>,
        Query(params): Query<CallbackParams>,
    ) -> Response {
        if let Some(error) = params.error {
            return (
                StatusCode::BAD_REQUEST,
                Html(error_page(&format!("Authorization was not granted: {error}"))),
            )
                .into_response();
        }
        let Some(code) = params.code.filter(|c| !c.is_empty()) else {
            return (
                StatusCode::BAD_REQUEST,
                Html(error_page("No authorization code was received.")),
            )
                .into_response();
        };
        let session_id = params.state.unwrap_or_default();

        match state.forward(&session_id, &code).await {
            Ok(reply) if reply.success => {
                tracing::info!(session_id = %session_id, "authorization code forwarded");
            }
            Ok(reply) => {
                tracing::warn!(session_id = %session_id, message = %reply.message, "agent rejected forwarded code");
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "could not forward authorization code");
            }
        }
        Html(success_page(&code)).into_response()
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn success_page(code: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
    <meta charset="utf-8" />
    <title>Authorization complete</title>
    <style>
        body {{ font-family: sans-serif; margin: 3rem; text-align: center; }}
        code {{ background: #f3f3f3; padding: 0.4rem 0.6rem; border-radius: 6px; word-break: break-all; }}
    </style>
</head>
<body>
    <h1>Authorization complete</h1>
    <p>Return to your chat. If it does not confirm the connection, paste this code there:</p>
    <p><code>{}</code></p>
    <p>You can close this window.</p>
</body>
</html>"#,
        escape_html(code)
    )
}

fn error_page(message: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8" /><title>Authorization failed</title></head>
<body style="font-family: sans-serif; margin: 3rem; text-align: center;">
    <h1>Authorization failed</h1>
    <p>{}</p>
    <p>Ask the agent for a new authorization link and try again.</p>
</body>
</html>"#,
        escape_html(message)
    )
}
