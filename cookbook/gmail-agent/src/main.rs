//! Gmail agent: chat API on :8088, OAuth redirect server on :8080.
//!
//! Configure with `gmail-agent.toml` (or `AGENT_CONFIG=<path>`) and the
//! `AGENT_CLIENT_ID` / `AGENT_CLIENT_SECRET` environment variables.

use oauth_session_agent::{app, init_tracing, AppConfig, ProviderConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::var("AGENT_CONFIG").unwrap_or_else(|_| "gmail-agent.toml".into());
    let cfg = AppConfig::load(&path, AppConfig::for_provider(ProviderConfig::google_gmail()))?;
    init_tracing(&cfg.logging)?;
    tracing::info!(config = %path, "loaded configuration");

    app::serve(cfg).await
}
