//! Assembles a [`ConversationRouter`] from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, ToolBackendKind};
use crate::error::{AgentError, Result};
use crate::intent::{IntentResolver, KeywordResolver, ModelResolver};
use crate::invoker::{RetryPolicy, ToolBackend, ToolInvoker};
use crate::llm::OpenAIClient;
use crate::mcp::{HttpTransport, McpClient, McpToolBackend};
use crate::oauth::{CredentialBroker, HttpTokenEndpoint};
use crate::router::ConversationRouter;
use crate::session::SessionRegistry;
use crate::storage::open_store;
use crate::tool::ToolRegistry;
use crate::tools::{register_calendar_tools, register_gmail_tools, GoogleApi};

/// Built-in Google tools for the configured provider.
pub fn builtin_tools(provider: &str, timeout: Duration) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    match provider {
        "gmail" => register_gmail_tools(&mut registry, GoogleApi::gmail(timeout)?),
        "calendar" => register_calendar_tools(&mut registry, GoogleApi::calendar(timeout)?),
        other => {
            return Err(AgentError::Configuration(format!(
                "no built-in tools for provider `{other}`; configure an MCP backend"
            )))
        }
    }
    Ok(registry)
}

async fn tool_backend(cfg: &AppConfig) -> Result<Arc<dyn ToolBackend>> {
    let timeout = Duration::from_secs(cfg.tools.http_timeout_secs);
    match cfg.tools.backend {
        ToolBackendKind::Registry => Ok(Arc::new(builtin_tools(&cfg.provider.name, timeout)?)),
        ToolBackendKind::Mcp => {
            let url = cfg.tools.mcp_url.clone().ok_or_else(|| {
                AgentError::Configuration("tools.mcp_url is required for the mcp backend".into())
            })?;
            let backend = McpToolBackend::new(McpClient::new(HttpTransport::new(&url, timeout)?));
            match backend.refresh_tools().await {
                Ok(names) => tracing::info!(url = %url, tools = ?names, "mcp tools discovered"),
                Err(err) => tracing::warn!(url = %url, error = %err, "mcp tool discovery failed"),
            }
            Ok(Arc::new(backend))
        }
    }
}

fn resolver(cfg: &AppConfig) -> Result<Arc<dyn IntentResolver>> {
    match cfg.model.provider.as_str() {
        "keyword" => Ok(Arc::new(KeywordResolver::for_provider(&cfg.provider.name)?)),
        "openai" => {
            let model = Arc::new(OpenAIClient::from_config(&cfg.model)?);
            let persona = format!(
                "You are a helpful assistant that manages the user's {} account through tools.",
                cfg.provider.name
            );
            Ok(Arc::new(ModelResolver::new(model, persona)))
        }
        other => Err(AgentError::Configuration(format!(
            "unknown model provider `{other}`"
        ))),
    }
}

pub async fn build_router(cfg: &AppConfig) -> Result<ConversationRouter> {
    // Fail before serving anything if the OAuth client is not configured.
    cfg.provider.client_credentials()?;

    let store = open_store(&cfg.storage).await?;
    let sessions = SessionRegistry::new(store, Duration::from_secs(cfg.session.timeout_secs));
    let endpoint = Arc::new(HttpTokenEndpoint::new(Duration::from_secs(
        cfg.tools.http_timeout_secs,
    ))?);
    let broker = Arc::new(CredentialBroker::new(
        cfg.provider.clone(),
        endpoint,
        sessions.clone(),
    ));
    let invoker = Arc::new(
        ToolInvoker::new(broker.clone(), tool_backend(cfg).await?).with_policy(
            RetryPolicy::single_retry(Duration::from_millis(cfg.tools.retry_delay_ms)),
        ),
    );

    ConversationRouter::new(
        sessions,
        broker,
        invoker,
        resolver(cfg)?,
        cfg.session.max_history,
    )
}

#[cfg(feature = "server")]
async fn socket_addr(host: &str, port: u16) -> Result<std::net::SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| AgentError::Configuration(format!("cannot resolve listen address {host}:{port}")))
}

/// Runs the agent API and the OAuth redirect server until either stops, and
/// purges idle sessions in the background.
#[cfg(feature = "server")]
pub async fn serve(cfg: AppConfig) -> Result<()> {
    use crate::server::{AgentServer, CallbackServer};

    let router = Arc::new(build_router(&cfg).await?);
    let agent_addr = socket_addr(&cfg.server.host, cfg.server.port).await?;
    let callback_addr = socket_addr(&cfg.callback.host, cfg.callback.port).await?;

    let sweeper = Arc::clone(&router);
    let every = Duration::from_secs((cfg.session.timeout_secs / 4).max(30));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(err) = sweeper.purge_expired().await {
                tracing::warn!(error = %err, "session purge failed");
            }
        }
    });

    tracing::info!(
        provider = %cfg.provider.name,
        agent = %agent_addr,
        callback = %callback_addr,
        "starting agent"
    );
    tokio::try_join!(
        AgentServer::new(router).serve(agent_addr),
        CallbackServer::from_config(&cfg.callback)?.serve(callback_addr),
    )?;
    Ok(())
}
