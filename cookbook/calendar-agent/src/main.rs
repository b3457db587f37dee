use oauth_session_agent::{app, init_tracing, AppConfig, ProviderConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let path =
        std::env::var("AGENT_CONFIG").unwrap_or_else(|_| "calendar-agent.toml".into());
    let defaults = AppConfig::for_provider(ProviderConfig::google_calendar());
    let cfg = AppConfig::load(&path, defaults)?;
    init_tracing(&cfg.logging)?;

    if let Err(err) = app::serve(cfg).await {
        tracing::error!(error = %err, "calendar agent stopped");
        return Err(err);
    }
    Ok(())
}
