//! Authorization-code flow and token lifecycle for one OAuth provider.
//!
//! The broker hands out authorization URLs whose `state` is the session id,
//! exchanges the returned code for [`TokenMaterial`], and refreshes expired
//! access tokens before a tool runs. Pending flows live in a map keyed by
//! session id so concurrent users never share one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::{AgentError, Result};
use crate::session::{unix_now, Session, SessionRegistry, TokenMaterial};

/// Token endpoint reply, as defined by RFC 6749 section 5.1.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        code: &str,
    ) -> Result<TokenResponse>;

    async fn refresh(&self, token: &TokenMaterial) -> Result<TokenResponse>;
}

pub struct HttpTokenEndpoint {
    http: reqwest::Client,
}

impl HttpTokenEndpoint {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AgentError::Configuration(format!("http client error: {err}")))?;
        Ok(Self { http })
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self.http.post(url).form(form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<TokenErrorBody>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {description}", err.error),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(AgentError::TokenExchange(format!("{status} {detail}")));
        }

        serde_json::from_str(&body)
            .map_err(|err| AgentError::TokenExchange(format!("malformed token response: {err}")))
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        code: &str,
    ) -> Result<TokenResponse> {
        let (client_id, client_secret) = provider.client_credentials()?;
        self.post_form(
            &provider.token_uri,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", provider.redirect_uri.as_str()),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ],
        )
        .await
    }

    async fn refresh(&self, token: &TokenMaterial) -> Result<TokenResponse> {
        let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
            AgentError::TokenExchange("no refresh token available".into())
        })?;
        self.post_form(
            &token.token_uri,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", token.client_id.as_str()),
                ("client_secret", token.client_secret.as_str()),
            ],
        )
        .await
    }
}

#[derive(Debug, Clone)]
struct PendingFlow {
    state: String,
    started_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Authorized,
    /// The session already held credentials; nothing was changed.
    AlreadyAuthenticated,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub awaiting_code: bool,
    pub scopes: Vec<String>,
    pub expires_at: Option<u64>,
}

pub struct CredentialBroker {
    provider: ProviderConfig,
    endpoint: Arc<dyn TokenEndpoint>,
    sessions: SessionRegistry,
    flows: Mutex<HashMap<String, PendingFlow>>,
}

impl CredentialBroker {
    pub fn new(
        provider: ProviderConfig,
        endpoint: Arc<dyn TokenEndpoint>,
        sessions: SessionRegistry,
    ) -> Self {
        Self {
            provider,
            endpoint,
            sessions,
            flows: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    fn flows(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingFlow>> {
        self.flows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builds the consent URL for `session_id` and records a pending flow for it.
    pub fn begin_authorization(&self, session_id: &str) -> Result<String> {
        let (client_id, _) = self.provider.client_credentials()?;
        if self.provider.auth_uri.is_empty() || self.provider.token_uri.is_empty() {
            return Err(AgentError::Configuration(format!(
                "{} authorization endpoints are not configured",
                self.provider.name
            )));
        }

        let scope = self.provider.scopes.join(" ");
        let mut params: Vec<(&str, &str)> = vec![
            ("response_type", "code"),
            ("client_id", client_id),
            ("redirect_uri", self.provider.redirect_uri.as_str()),
            ("scope", scope.as_str()),
        ];
        for (key, value) in &self.provider.extra_auth_params {
            params.push((key.as_str(), value.as_str()));
        }
        params.push(("state", session_id));

        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.provider.auth_uri.contains('?') {
            '&'
        } else {
            '?'
        };
        let url = format!("{}{separator}{query}", self.provider.auth_uri);

        self.flows().insert(
            session_id.to_string(),
            PendingFlow {
                state: session_id.to_string(),
                started_at: unix_now(),
            },
        );
        tracing::info!(session_id, provider = %self.provider.name, "authorization flow started");
        Ok(url)
    }

    pub fn has_pending_flow(&self, session_id: &str) -> bool {
        self.flows().contains_key(session_id)
    }

    pub fn forget_flow(&self, session_id: &str) {
        self.flows().remove(session_id);
    }

    /// Drops flows started longer ago than the session timeout.
    pub fn evict_stale_flows(&self) -> usize {
        let ttl = self.sessions.timeout().as_secs();
        let now = unix_now();
        let mut flows = self.flows();
        let before = flows.len();
        flows.retain(|_, flow| now.saturating_sub(flow.started_at) <= ttl);
        let evicted = before - flows.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted stale authorization flows");
        }
        evicted
    }

    /// Exchanges `code` for token material and persists it into `session`.
    ///
    /// On failure the session is left untouched. A missing pending flow yields
    /// [`AgentError::FlowLost`] so the caller can start over.
    pub async fn complete_authorization(
        &self,
        session: &mut Session,
        code: &str,
    ) -> Result<AuthorizationOutcome> {
        if session.is_authenticated() {
            tracing::info!(session_id = %session.id, "session already authenticated, ignoring code");
            return Ok(AuthorizationOutcome::AlreadyAuthenticated);
        }

        let flow = self
            .flows()
            .get(&session.id)
            .cloned()
            .ok_or_else(|| AgentError::FlowLost(session.id.clone()))?;

        let response = self.endpoint.exchange_code(&self.provider, code).await?;
        let (client_id, client_secret) = self.provider.client_credentials()?;
        let now = unix_now();
        let scopes = response
            .scope
            .as_deref()
            .map(|scope| scope.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| self.provider.scopes.clone());

        session.token = Some(TokenMaterial {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            token_uri: self.provider.token_uri.clone(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scopes,
            expires_at: response.expires_in.map(|secs| now.saturating_add(secs)),
        });
        session.authenticated = true;
        session.awaiting_code = false;
        session.oauth_state = None;
        session.auth_code = Some(code.to_string());
        self.sessions.save(session).await?;

        self.flows().remove(&session.id);
        tracing::info!(
            session_id = %session.id,
            state = %flow.state,
            elapsed_secs = now.saturating_sub(flow.started_at),
            "authorization completed"
        );
        Ok(AuthorizationOutcome::Authorized)
    }

    /// Returns usable credentials, refreshing and persisting them when expired.
    pub async fn ensure_valid(&self, session: &mut Session) -> Result<TokenMaterial> {
        let token = match (&session.token, session.authenticated) {
            (Some(token), true) => token.clone(),
            _ => return Err(AgentError::AuthenticationRequired(session.id.clone())),
        };

        if !token.is_expired() {
            return Ok(token);
        }
        if token.refresh_token.is_none() {
            tracing::warn!(session_id = %session.id, "token expired without refresh token");
            return Err(AgentError::AuthenticationRequired(session.id.clone()));
        }

        let response = match self.endpoint.refresh(&token).await {
            Ok(response) => response,
            Err(AgentError::TokenExchange(reason)) => {
                tracing::warn!(session_id = %session.id, %reason, "token refresh rejected");
                return Err(AgentError::AuthenticationRequired(session.id.clone()));
            }
            Err(err) => return Err(err),
        };

        let mut refreshed = token;
        refreshed.access_token = response.access_token;
        if let Some(rotated) = response.refresh_token {
            refreshed.refresh_token = Some(rotated);
        }
        refreshed.expires_at = response.expires_in.map(|secs| unix_now().saturating_add(secs));
        session.token = Some(refreshed.clone());
        self.sessions.save(session).await?;
        tracing::debug!(session_id = %session.id, "access token refreshed");
        Ok(refreshed)
    }

    pub fn auth_status(&self, session: &Session) -> AuthStatus {
        let token = session.token.as_ref();
        AuthStatus {
            authenticated: session.is_authenticated(),
            awaiting_code: session.awaiting_code,
            scopes: token.map(|t| t.scopes.clone()).unwrap_or_default(),
            expires_at: token.and_then(|t| t.expires_at),
        }
    }

    /// Forgets the session's credentials and any pending flow.
    pub async fn reset(&self, session: &mut Session) -> Result<()> {
        self.flows().remove(&session.id);
        session.clear_credentials();
        self.sessions.save(session).await?;
        tracing::info!(session_id = %session.id, "credentials reset");
        Ok(())
    }
}
