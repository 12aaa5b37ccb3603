use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tracing::{debug, error, info};

use librelay::SessionRegistry;
use relay_protocol::{LifecycleEvent, SessionState};

use crate::config::ServerConfig;
use crate::connection;

pub type SharedRegistry = Arc<SessionRegistry>;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write PID file
    let pid_path = relay_protocol::paths::pid_file_path();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let listener = UnixListener::bind(&config.socket_path)?;
    info!(socket = %config.socket_path.display(), pid = std::process::id(), "relay server started");

    let registry: SharedRegistry = Arc::new(SessionRegistry::new(config.registry_config()));

    spawn_reaper(Arc::clone(&registry), config.reaper_interval_ms);

    // Handle shutdown signals
    let socket_path = config.socket_path.clone();
    let pid_path_clone = pid_path.clone();
    let shutdown_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        // End every live tail with the terminal control event before the
        // process goes away.
        for info in shutdown_registry.list_sessions().await {
            shutdown_registry.remove_session(&info.id).await;
        }
        let _ = std::fs::remove_file(&socket_path);
        let _ = std::fs::remove_file(&pid_path_clone);
        std::process::exit(0);
    });

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    connection::handle_client(stream, registry).await;
                });
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}

/// Drive TIMEOUT from the server clock: the state machine itself makes no
/// timing decisions. A stale session moves to closing, then is finalized.
fn spawn_reaper(registry: SharedRegistry, interval_ms: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            reap_stale_sessions(&registry).await;
        }
    });
}

pub async fn reap_stale_sessions(registry: &SessionRegistry) {
    for info in registry.list_sessions().await {
        if !matches!(info.state, SessionState::Active | SessionState::Paused) {
            continue;
        }
        match registry.send(&info.id, &LifecycleEvent::Timeout).await {
            Ok(_) => {
                info!(session_id = %info.id, "stale session timed out");
                if let Err(err) = registry.send(&info.id, &LifecycleEvent::Close).await {
                    error!(session_id = %info.id, error = %err, "failed to finalize stale session");
                }
            }
            Err(err) => {
                // Not stale yet, or raced with another transition.
                debug!(session_id = %info.id, error = %err, "session not reaped");
            }
        }
    }
}
