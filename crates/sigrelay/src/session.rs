//! Per-connection session: registration handshake, then the relay loop.
//!
//! ```text
//! Connecting ──welcome──▶ AwaitingRegistration ──register──▶ Registered ──▶ Closed
//!                                │ timeout / violation                ▲
//!                                └────────────────────────────────────┘
//! ```

use crate::error::{ProtocolError, RelayError};
use crate::metrics::{counters, gauges, histograms};
use crate::presence;
use crate::registry::{ConnHandle, ConnId, Registry, RegistryError};
use crate::router;
use crate::server::ServerState;
use crate::throttle::Throttle;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sigrelay_common::types::close_reason;
use sigrelay_common::{ClientId, Envelope, ServerEnvelope};
use std::borrow::Cow;
use tokio::sync::{mpsc, SemaphorePermit};
use tokio::time::{interval_at, timeout, Duration, Instant};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

/// Lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, nothing sent yet.
    Connecting,
    /// Waiting for the first message, which must be `register`.
    AwaitingRegistration,
    /// Registered under the given id and relaying.
    Registered(ClientId),
    /// Finished; the registry slot has been released.
    Closed,
}

/// Releases a registry slot exactly once, when dropped.
struct Registration<'a> {
    registry: &'a Registry,
    id: ClientId,
    conn: ConnId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.registry.unregister(&self.id, self.conn) {
            gauges::peers_registered(self.registry.len());
            tracing::info!(id = %self.id, conn = %self.conn, "unregistered");
        } else {
            tracing::debug!(id = %self.id, conn = %self.conn, "registration already replaced");
        }
    }
}

/// One connection's state machine.
pub struct Session<'a> {
    state: &'a ServerState,
    handle: ConnHandle,
    outbound: mpsc::Receiver<String>,
    phase: SessionState,
    permit: Option<SemaphorePermit<'a>>,
}

impl<'a> Session<'a> {
    /// Create a session in the `Connecting` state.
    #[must_use]
    pub fn new(state: &'a ServerState) -> Self {
        let (handle, outbound) = ConnHandle::new(state.config.send_queue);
        Self {
            state,
            handle,
            outbound,
            phase: SessionState::Connecting,
            permit: None,
        }
    }

    /// Hold `permit` until registration completes or the session ends.
    #[must_use]
    pub fn with_permit(mut self, permit: SemaphorePermit<'a>) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.phase
    }

    /// Handle other sessions use to reach this connection.
    #[must_use]
    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    /// Drive the session until the connection ends. Always finishes `Closed`.
    ///
    /// # Errors
    ///
    /// Returns the failure that ended the session; a peer closing normally
    /// or an eviction is `Ok`.
    pub async fn run<Tx, Rx>(&mut self, ws_tx: &mut Tx, ws_rx: &mut Rx) -> Result<(), RelayError>
    where
        Tx: Sink<Message> + Unpin,
        Rx: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let result = self.drive(ws_tx, ws_rx).await;
        self.permit = None;
        self.phase = SessionState::Closed;
        result
    }

    async fn drive<Tx, Rx>(&mut self, ws_tx: &mut Tx, ws_rx: &mut Rx) -> Result<(), RelayError>
    where
        Tx: Sink<Message> + Unpin,
        Rx: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        if self.state.config.issue_ids {
            let welcome = ServerEnvelope::Welcome {
                id: uuid::Uuid::new_v4().to_string(),
            };
            send_text(ws_tx, welcome.to_string()).await?;
        }
        self.phase = SessionState::AwaitingRegistration;

        let Some(registration) = self.await_registration(ws_tx, ws_rx).await? else {
            return Ok(());
        };
        let id = registration.id.clone();
        self.phase = SessionState::Registered(id.clone());
        let announcement = presence::announce(&self.state.registry, &id, self.handle.id());
        for text in announcement.greeting {
            send_text(ws_tx, text).await?;
        }

        let result = self.relay(ws_tx, ws_rx, &id).await;
        drop(registration);
        result
    }

    /// Wait for a valid `register` and claim the id. `None` if the peer left first.
    async fn await_registration<Tx, Rx>(
        &mut self,
        ws_tx: &mut Tx,
        ws_rx: &mut Rx,
    ) -> Result<Option<Registration<'a>>, RelayError>
    where
        Tx: Sink<Message> + Unpin,
        Rx: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let deadline = self.state.config.register_timeout();
        let claimed = match timeout(deadline, read_register(ws_rx)).await {
            Ok(Ok(Some(id))) => self.register(id).map_err(|_| ProtocolError::MissingId),
            Ok(Ok(None)) => {
                counters::registrations_total("abandoned");
                tracing::debug!(conn = %self.handle.id(), "closed before registering");
                return Ok(None);
            }
            Ok(Err(RelayError::Protocol(e))) => Err(e),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                counters::registrations_total("timeout");
                tracing::debug!(conn = %self.handle.id(), "registration timeout");
                let msg = format!("no register within {}s", deadline.as_secs());
                reject(ws_tx, close_reason::REGISTRATION_TIMEOUT, msg).await;
                return Err(RelayError::RegistrationTimeout);
            }
        };

        match claimed {
            Ok(registration) => Ok(Some(registration)),
            Err(e) => {
                counters::registrations_total("rejected");
                tracing::debug!(conn = %self.handle.id(), error = %e, "rejecting connection");
                reject(ws_tx, e.close_reason(), e.to_string()).await;
                Err(e.into())
            }
        }
    }

    fn register(&mut self, id: ClientId) -> Result<Registration<'a>, RegistryError> {
        let state: &'a ServerState = self.state;
        let registry = &state.registry;
        let conn = self.handle.id();

        if let Some(evicted) = registry.register(id.clone(), self.handle.clone())? {
            counters::evictions_total();
            if evicted.close(close_reason::EVICTED) {
                tracing::info!(id = %id, old = %evicted.id(), new = %conn, "evicting previous connection");
            }
        }
        self.permit = None;
        counters::registrations_total("registered");
        gauges::peers_registered(registry.len());
        tracing::info!(id = %id, conn = %conn, "registered");

        Ok(Registration { registry, id, conn })
    }

    /// Registered phase: forward queued frames out, route inbound envelopes.
    async fn relay<Tx, Rx>(&mut self, ws_tx: &mut Tx, ws_rx: &mut Rx, id: &str) -> Result<(), RelayError>
    where
        Tx: Sink<Message> + Unpin,
        Rx: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let config = &self.state.config;
        let registry = &self.state.registry;
        let handle = &self.handle;
        let outbound = &mut self.outbound;

        let mut throttle = Throttle::new(config.msg_rate);
        let period = Duration::from_secs(config.ping_interval);
        let mut ping_interval = interval_at(Instant::now() + period, period);
        let idle_timeout = Duration::from_secs(config.idle_timeout);
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                biased;
                reason = handle.closed() => {
                    tracing::debug!(id, reason, "closing on request");
                    send_close(ws_tx, reason).await;
                    return Ok(());
                }
                Some(text) = outbound.recv() => {
                    send_text(ws_tx, text).await?;
                }
                msg = ws_rx.next() => {
                    last_activity = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            on_text(ws_tx, registry, id, text, &mut throttle).await?;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            counters::messages_dropped_total("binary");
                            tracing::debug!(id, "ignoring binary frame");
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                        Some(Ok(_)) => {}
                    }
                }
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() >= idle_timeout {
                        tracing::debug!(id, "idle timeout reached, closing connection");
                        send_close(ws_tx, close_reason::IDLE_TIMEOUT).await;
                        return Ok(());
                    }
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        return Err(RelayError::ConnectionClosed);
                    }
                }
            }
        }
    }
}

/// Read frames until the first data frame and require it to be `register`.
async fn read_register<Rx>(ws_rx: &mut Rx) -> Result<Option<ClientId>, RelayError>
where
    Rx: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(parse_register(&text)?)),
            Some(Ok(Message::Binary(_))) => return Err(ProtocolError::BinaryFrame.into()),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(RelayError::WebSocket(e)),
        }
    }
}

fn parse_register(text: &str) -> Result<ClientId, ProtocolError> {
    let envelope = Envelope::parse(text)?;
    if !envelope.is_register() {
        return Err(ProtocolError::UnexpectedType(
            envelope.kind().map(str::to_owned),
        ));
    }
    match envelope.id() {
        Some(id) if !id.is_empty() => Ok(id.to_owned()),
        _ => Err(ProtocolError::MissingId),
    }
}

async fn on_text<Tx>(
    ws_tx: &mut Tx,
    registry: &Registry,
    id: &str,
    text: String,
    throttle: &mut Throttle,
) -> Result<(), RelayError>
where
    Tx: Sink<Message> + Unpin,
{
    let envelope = match Envelope::parse(&text) {
        Ok(envelope) => envelope,
        Err(e) => {
            counters::messages_dropped_total("malformed");
            tracing::debug!(id, error = %e, "dropping malformed envelope");
            return Ok(());
        }
    };

    if envelope.is_register() {
        counters::registrations_total("duplicate");
        let notice = ServerEnvelope::error(
            close_reason::ALREADY_REGISTERED,
            format!("connection is already registered as {id}"),
        );
        return send_text(ws_tx, notice.to_string()).await;
    }

    if !throttle.allow() {
        counters::messages_dropped_total("rate_limit");
        tracing::debug!(id, "rate limited");
        return Ok(());
    }

    let start = Instant::now();
    router::route(registry, id, &envelope, text);
    histograms::route_latency_seconds(start.elapsed().as_secs_f64());
    Ok(())
}

async fn send_text<Tx>(ws_tx: &mut Tx, text: String) -> Result<(), RelayError>
where
    Tx: Sink<Message> + Unpin,
{
    ws_tx
        .send(Message::Text(text))
        .await
        .map_err(|_| RelayError::ConnectionClosed)
}

async fn send_close<Tx>(ws_tx: &mut Tx, reason: &'static str)
where
    Tx: Sink<Message> + Unpin,
{
    let code = if reason == close_reason::SHUTDOWN {
        CloseCode::Away
    } else {
        CloseCode::Policy
    };
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if ws_tx.send(Message::Close(Some(frame))).await.is_err() {
        tracing::debug!(reason, "failed to send close frame");
    }
}

/// Tell the peer why, then close. Failures are ignored; the session is ending anyway.
async fn reject<Tx>(ws_tx: &mut Tx, reason: &'static str, msg: String)
where
    Tx: Sink<Message> + Unpin,
{
    let notice = ServerEnvelope::error(reason, msg);
    if send_text(ws_tx, notice.to_string()).await.is_ok() {
        send_close(ws_tx, reason).await;
    }
}
