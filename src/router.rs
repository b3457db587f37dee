//! Per-message state machine: unauthenticated sessions get an authorization
//! link, sessions awaiting a code get it exchanged, authenticated sessions get
//! their requests resolved into tool calls.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::intent::{render_outcome, Intent, IntentResolver};
use crate::invoker::{ToolInvoker, ToolOutcome};
use crate::oauth::{AuthStatus, AuthorizationOutcome, CredentialBroker};
use crate::session::{AuthState, Role, Session, SessionRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    pub session_id: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Begins a fresh conversation before `text` is handled.
    #[serde(default)]
    pub start_session: bool,
}

impl InboundMessage {
    pub fn text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub session_id: String,
    pub state: AuthState,
    pub reply: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub message: String,
}

impl CallbackResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Delivers messages that are not replies to an inbound request, such as the
/// confirmation after a browser callback completed authorization.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, address: &str, session_id: &str, message: &str) -> Result<()>;
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, address: &str, session_id: &str, message: &str) -> Result<()> {
        tracing::info!(address, session_id, message, "notification");
        Ok(())
    }
}

const LOGOUT_COMMANDS: [&str; 3] = ["logout", "log out", "reset auth"];

pub struct ConversationRouter {
    sessions: SessionRegistry,
    broker: Arc<CredentialBroker>,
    invoker: Arc<ToolInvoker>,
    resolver: Arc<dyn IntentResolver>,
    notifier: Arc<dyn Notifier>,
    code_pattern: Regex,
    max_history: usize,
}

impl ConversationRouter {
    pub fn new(
        sessions: SessionRegistry,
        broker: Arc<CredentialBroker>,
        invoker: Arc<ToolInvoker>,
        resolver: Arc<dyn IntentResolver>,
        max_history: usize,
    ) -> Result<Self> {
        let pattern = &broker.provider().code_pattern;
        let code_pattern = Regex::new(pattern).map_err(|err| {
            AgentError::Configuration(format!("invalid code pattern `{pattern}`: {err}"))
        })?;
        Ok(Self {
            sessions,
            broker,
            invoker,
            resolver,
            notifier: Arc::new(LogNotifier),
            code_pattern,
            max_history,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    fn provider_name(&self) -> &str {
        &self.broker.provider().name
    }

    /// Handles one chat message. `None` means the message was ignored.
    pub async fn handle_message(&self, message: InboundMessage) -> Option<Reply> {
        let session_id = message.session_id.clone();
        let _guard = self.sessions.lock(&session_id).await;

        let mut session = match self.sessions.open(&session_id).await {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(session_id = %session_id, error = %err, "could not load session");
                return Some(Reply {
                    session_id,
                    state: AuthState::Unauthenticated,
                    reply: "Sorry, I couldn't load your conversation. Please try again shortly."
                        .into(),
                });
            }
        };

        let reply = match self.route(&mut session, message).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(session_id = %session.id, error = %err, "message handling failed");
                Some(format!("Sorry, something went wrong: {err}"))
            }
        };

        reply.map(|reply| Reply {
            session_id: session.id.clone(),
            state: session.state(),
            reply,
        })
    }

    async fn route(&self, session: &mut Session, message: InboundMessage) -> Result<Option<String>> {
        if let Some(sender) = message.sender.filter(|s| !s.is_empty()) {
            session.sender_address = Some(sender);
        }
        session.touch();

        let text = message.text.trim();
        if message.start_session {
            tracing::info!(session_id = %session.id, "starting new conversation");
            session.reset_conversation();
            if text.is_empty() {
                self.sessions.save(session).await?;
                return Ok(Some(self.greeting(session)));
            }
        }

        if text.is_empty() {
            self.sessions.save(session).await?;
            return Ok(match session.state() {
                AuthState::AwaitingCode => {
                    Some("I'm still waiting for your authorization code.".to_string())
                }
                _ => None,
            });
        }

        if LOGOUT_COMMANDS.contains(&text.to_ascii_lowercase().as_str()) {
            self.broker.reset(session).await?;
            return Ok(Some(format!(
                "Signed out of {}. Send any message to connect again.",
                self.provider_name()
            )));
        }

        let reply = match session.state() {
            AuthState::Unauthenticated => self.prompt_authorization(session, None).await?,
            AuthState::AwaitingCode => self.accept_code(session, text).await?,
            AuthState::Authenticated => self.serve(session, text).await?,
        };
        Ok(Some(reply))
    }

    fn greeting(&self, session: &Session) -> String {
        if session.is_authenticated() {
            format!(
                "Welcome back! Your {} account is connected. Say \"help\" to see what I can do.",
                self.provider_name()
            )
        } else {
            format!(
                "Hi! Send any message and I'll help you connect your {} account.",
                self.provider_name()
            )
        }
    }

    async fn prompt_authorization(&self, session: &mut Session, preface: Option<&str>) -> Result<String> {
        let url = match self.broker.begin_authorization(&session.id) {
            Ok(url) => url,
            Err(AgentError::Configuration(reason)) => {
                tracing::error!(session_id = %session.id, %reason, "cannot start authorization");
                self.sessions.save(session).await?;
                return Ok(format!(
                    "I can't connect to {} yet because the agent is not configured: {reason}",
                    self.provider_name()
                ));
            }
            Err(err) => return Err(err),
        };
        session.awaiting_code = true;
        session.oauth_state = Some(session.id.clone());
        self.sessions.save(session).await?;

        let mut reply = String::new();
        if let Some(preface) = preface {
            reply.push_str(preface);
            reply.push_str("\n\n");
        }
        reply.push_str(&format!(
            "To use your {} tools, please authorize access here:\n{url}\n\n\
             After approving, paste the authorization code you receive into this chat.",
            self.provider_name()
        ));
        Ok(reply)
    }

    async fn accept_code(&self, session: &mut Session, text: &str) -> Result<String> {
        if !self.broker.has_pending_flow(&session.id) {
            tracing::info!(session_id = %session.id, "pending flow missing, issuing a new link");
            session.awaiting_code = false;
            return self
                .prompt_authorization(
                    session,
                    Some("Your previous authorization request is no longer active."),
                )
                .await;
        }

        if !self.code_pattern.is_match(text) {
            self.sessions.save(session).await?;
            return Ok(
                "I'm waiting for your authorization code. Open the link I sent, approve access, \
                 then paste the code here."
                    .to_string(),
            );
        }

        match self.broker.complete_authorization(session, text).await {
            Ok(AuthorizationOutcome::Authorized) => Ok(format!(
                "Authentication successful! Your {} account is connected. What would you like to do?",
                self.provider_name()
            )),
            Ok(AuthorizationOutcome::AlreadyAuthenticated) => Ok("Already authenticated.".into()),
            Err(AgentError::FlowLost(_)) => {
                session.awaiting_code = false;
                self.sessions.save(session).await?;
                Ok("That authorization request is no longer active. Send any message to get a new link."
                    .into())
            }
            Err(err) if err.is_recoverable() => {
                tracing::warn!(session_id = %session.id, error = %err, "code exchange failed");
                self.sessions.save(session).await?;
                Ok(format!(
                    "Authorization failed: {err}. Please try the code again or send \"reset auth\" for a new link."
                ))
            }
            Err(err) => Err(err),
        }
    }

    async fn serve(&self, session: &mut Session, text: &str) -> Result<String> {
        let tools = self.invoker.describe();
        let intent = match self.resolver.resolve(session, text, &tools).await {
            Ok(intent) => intent,
            Err(err) => {
                tracing::warn!(session_id = %session.id, error = %err, "intent resolution failed");
                Intent::Reply(format!("Sorry, I couldn't work out how to help with that: {err}"))
            }
        };

        let reply = match intent {
            Intent::Reply(reply) => reply,
            Intent::Call(call) => {
                tracing::info!(session_id = %session.id, tool = %call.name, "dispatching tool call");
                let outcome = self
                    .invoker
                    .invoke(session, &call.name, call.arguments.clone())
                    .await;
                if let ToolOutcome::Failure {
                    reauthorize: true, ..
                } = outcome
                {
                    self.broker.reset(session).await?;
                    return self
                        .prompt_authorization(
                            session,
                            Some("Your access has expired or was revoked."),
                        )
                        .await;
                }
                match self.resolver.compose(session, text, &call, &outcome).await {
                    Ok(reply) => reply,
                    Err(_) => render_outcome(&call, &outcome),
                }
            }
        };

        session.push_turn(Role::User, text, self.max_history);
        session.push_turn(Role::Assistant, reply.clone(), self.max_history);
        self.sessions.save(session).await?;
        Ok(reply)
    }

    /// Completes authorization from the browser redirect and tells the
    /// session's sender about it.
    pub async fn handle_callback(&self, session_id: &str, code: &str) -> CallbackResponse {
        let code = code.trim();
        if session_id.is_empty() || code.is_empty() {
            return CallbackResponse::failed("Missing session_id or auth_code");
        }
        let _guard = self.sessions.lock(session_id).await;

        let mut session = match self.sessions.open(session_id).await {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(session_id, error = %err, "could not load session for callback");
                return CallbackResponse::failed(format!("Error processing OAuth callback: {err}"));
            }
        };
        if session.is_authenticated() {
            return CallbackResponse::ok("Already authenticated");
        }

        let outcome = match self.broker.complete_authorization(&mut session, code).await {
            Err(AgentError::FlowLost(_)) => {
                tracing::info!(session_id, "no pending flow for callback, recreating it");
                if let Err(err) = self.broker.begin_authorization(session_id) {
                    return CallbackResponse::failed(format!("OAuth flow not initialized: {err}"));
                }
                self.broker.complete_authorization(&mut session, code).await
            }
            other => other,
        };

        match outcome {
            Ok(AuthorizationOutcome::AlreadyAuthenticated) => CallbackResponse::ok("Already authenticated"),
            Ok(AuthorizationOutcome::Authorized) => {
                if let Some(address) = session.sender_address.as_deref() {
                    let note = format!(
                        "Authentication successful! Your {} account is connected. What would you like to do?",
                        self.provider_name()
                    );
                    if let Err(err) = self.notifier.notify(address, session_id, &note).await {
                        tracing::warn!(session_id, error = %err, "failed to notify sender");
                    }
                }
                CallbackResponse::ok("Authentication successful")
            }
            Err(err) => {
                tracing::warn!(session_id, error = %err, "callback authorization failed");
                CallbackResponse::failed(format!("Authentication failed: {err}"))
            }
        }
    }

    pub async fn status(&self, session_id: &str) -> Result<AuthStatus> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .unwrap_or_else(|| Session::new(session_id));
        Ok(self.broker.auth_status(&session))
    }

    /// Purges idle sessions together with their pending authorization flows.
    pub async fn purge_expired(&self) -> Result<usize> {
        let purged = self.sessions.purge_expired().await?;
        for id in &purged {
            // A message may have recreated the session since the purge.
            if self.sessions.get(id).await?.is_none() {
                self.broker.forget_flow(id);
            }
        }
        self.broker.evict_stale_flows();
        Ok(purged.len())
    }
}
