use std::sync::Arc;

use agent_link::config::HubConfig;
use agent_link::hub::{AgentHub, LogEvents};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = agent_link::logging::init("agent-link-hub");

    let config = HubConfig::from_env();

    eprintln!("🔗 Agent Link hub v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent WS: ws://0.0.0.0:{}/ws/agent", config.port);
    eprintln!("   API: http://0.0.0.0:{}/api/agents", config.port);
    eprintln!("   Uploads: {}", config.upload_dir.display());
    if config.is_insecure() {
        eprintln!("   ⚠ AGENT_LINK_SECRET not set: any client can register and dispatch");
        warn!("No shared secret configured, running in insecure mode");
    }

    let port = config.port;
    let hub = AgentHub::new(config, Arc::new(LogEvents));
    let _watchdog = hub.spawn_watchdog();

    let app = hub.router();
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port, "Hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
