use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::registry::Registry;
use dashmap::DashMap;
use sigrelay_common::types::close_reason;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Maximum number of connections that have not registered yet.
/// Bounds the sockets a client can hold open without claiming an id.
pub const MAX_PENDING_REGISTRATIONS: usize = 1000;

const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared state for the relay server.
pub struct ServerState {
    /// Id ↔ connection registry.
    pub registry: Registry,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Open connections, registered or not.
    pub active_connections: AtomicUsize,
    /// Permits held by connections that have not registered yet.
    pub pending_registrations: Semaphore,
}

impl ServerState {
    /// Fresh state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
            ip_connections: DashMap::new(),
            active_connections: AtomicUsize::new(0),
            pending_registrations: Semaphore::new(MAX_PENDING_REGISTRATIONS),
        }
    }
}

/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When the paired sender sends or is dropped, the accept loop stops
/// accepting new connections, asks every registered session to close, and
/// waits for in-flight sessions to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("server listening on {}", local_addr);
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        sessions.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", sessions.len());
                break;
            }
        }
    }

    let mut closing = 0usize;
    for (_, handle) in state.registry.snapshot() {
        if handle.close(close_reason::SHUTDOWN) {
            closing += 1;
        }
    }
    tracing::debug!(closing, "asked registered sessions to close");

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            sessions.len()
        );
        sessions.abort_all();
    }

    info!("server shut down gracefully");
    Ok(())
}
