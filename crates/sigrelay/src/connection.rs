use crate::error::RelayError;
use crate::metrics::gauges;
use crate::server::ServerState;
use crate::session::Session;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Counts a connection against the global and per-IP limits while alive.
struct AdmissionGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl AdmissionGuard {
    /// Claim a slot for `ip`, or `None` if the per-IP limit is reached.
    fn claim(state: &Arc<ServerState>, ip: IpAddr) -> Option<Self> {
        // Entry API keeps check and increment atomic per IP.
        match state.ip_connections.entry(ip) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    return None;
                }
                *entry.get_mut() += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        Some(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();

        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            remove = *entry == 0;
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Upgrade an accepted socket to WebSocket and run its session to completion.
///
/// # Errors
///
/// Returns an error if a limit refuses the connection, the upgrade fails, or
/// the session ends abnormally.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    let Some(_admission) = AdmissionGuard::claim(&state, peer_addr.ip()) else {
        tracing::debug!(ip = %peer_addr.ip(), limit = state.config.max_conns_ip, "per-IP connection limit exceeded");
        return Err(RelayError::IpLimitReached);
    };

    let Ok(permit) = state.pending_registrations.try_acquire() else {
        tracing::warn!("pending registration limit reached, rejecting {}", peer_addr);
        return Err(RelayError::PendingLimitReached);
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(state.config.max_message_size);
    ws_config.max_frame_size = Some(state.config.max_message_size);

    let ws_stream = timeout(
        state.config.register_timeout(),
        tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)),
    )
    .await
    .map_err(|_| RelayError::HandshakeTimeout)??;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut session = Session::new(&state).with_permit(permit);
    tracing::debug!(conn = %session.handle().id(), peer = %peer_addr, "connection accepted");

    session.run(&mut ws_tx, &mut ws_rx).await
}
