use agent_link::config::WorkerConfig;
use agent_link::worker::WorkerRuntime;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = agent_link::logging::init("agent-link-worker");

    let config = WorkerConfig::from_env()?;

    eprintln!("🛠  Agent Link worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Name: {}", config.name);
    eprintln!("   Hub: {}", config.hub_url);
    eprintln!("   Command: {}", config.command.join(" "));
    eprintln!("   Workdir: {}", config.workdir.display());

    let runtime = WorkerRuntime::new(config);

    tokio::select! {
        result = std::sync::Arc::clone(&runtime).run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!(running = runtime.running_count().await, "Shutting down, killing running tasks");
            runtime.kill_all().await;
            // Give supervisors a moment to terminate their process groups.
            tokio::time::sleep(runtime.config().kill_grace).await;
        }
    }

    Ok(())
}
