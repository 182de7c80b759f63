//! marvel-daemon: per-project hook daemon.
//!
//! Bound to one project directory via `MARVEL_PROJECT_DIR`; serves hook
//! requests on a per-user unix socket and exits when the last session
//! leaves.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use marvel_daemon::config::SecurityConfig;
use marvel_daemon::server::Server;
use marvel_daemon::state::DaemonState;
use marvel_security::EvaluatorSession;

fn init_tracing(debug: bool) {
    let default_level = if debug { "marvel=debug" } else { "marvel=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let project_root = std::env::var("MARVEL_PROJECT_DIR")
        .map(PathBuf::from)
        .context("MARVEL_PROJECT_DIR must point at the project root")?;

    let debug = std::env::var("MARVEL_DEBUG").is_ok();
    init_tracing(debug);

    let security_dir = project_root.join("marvel").join("security");
    let config = SecurityConfig::load(&security_dir);

    let evaluator = Arc::new(EvaluatorSession::new(config.evaluator.clone()));
    let state = DaemonState::new(project_root.clone(), config, evaluator.clone());

    // Socket-path problems are fatal before any state exists.
    let (server, listener) = Server::bind(Arc::clone(&state))
        .await
        .context("daemon startup failed")?;

    let idle_watchdog = evaluator.spawn_idle_watchdog();
    let pending_sweeper = state.pending.spawn_sweeper();
    let registry_sweeper = state.registry.spawn_sweeper();

    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        let sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        info!("termination signal received");
        signal_state.signal_shutdown();
    });

    info!(project = %project_root.display(), "marvel daemon started");
    server.run(listener).await;

    // Orderly teardown: evaluator first, then timers, then the files.
    state.evaluator.shutdown().await;
    idle_watchdog.abort();
    pending_sweeper.abort();
    registry_sweeper.abort();
    server.cleanup();

    info!("marvel daemon stopped");
    Ok(())
}
