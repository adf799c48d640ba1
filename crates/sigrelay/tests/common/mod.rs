#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sigrelay::config::ServerConfig;
use sigrelay::server::ServerState;
use sigrelay_common::ClientEnvelope;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        msg_rate: 600,
        max_message_size: 65_536,
        register_timeout: 5,
        ping_interval: 30,
        idle_timeout: 120,
        send_queue: 64,
        issue_ids: true,
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<Ws, Message>,
    pub ws_rx: futures_util::stream::SplitStream<Ws>,
    /// Id offered by the server in its `welcome` envelope.
    pub welcome_id: String,
}

impl TestClient {
    /// Open a socket and consume the `welcome` envelope.
    pub async fn connect(addr: &SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let (ws_tx, ws_rx) = ws.split();
        let mut client = Self {
            ws_tx,
            ws_rx,
            welcome_id: String::new(),
        };

        let welcome = client.recv_json().await;
        assert_eq!(welcome["type"], "welcome", "expected welcome, got {welcome}");
        client.welcome_id = welcome["id"].as_str().unwrap().to_owned();
        client
    }

    /// Connect and register as `id`, consuming the self-announcement and the
    /// `already_registered` reply.
    pub async fn register(addr: &SocketAddr, id: &str) -> (Self, Vec<String>) {
        let mut client = Self::connect(addr).await;
        let register = ClientEnvelope::Register { id: id.to_owned() };
        client.send_text(&register.to_string()).await;
        let joined = client.recv_json().await;
        assert_eq!(joined, json!({"type": "registered", "id": id}));
        let peers = client.recv_json().await;
        assert_eq!(peers["type"], "already_registered", "got {peers}");
        let ids = peers["ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_owned())
            .collect();
        (client, ids)
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_owned()))
            .await
            .unwrap();
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_text(&value.to_string()).await;
    }

    /// Next text frame as a raw string, skipping control frames.
    pub async fn recv_text(&mut self) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        let text = self.recv_text().await;
        serde_json::from_str(&text).unwrap()
    }

    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv_json()).await.ok()
    }

    /// Wait for the server to close the socket and return the close reason.
    pub async fn recv_close(&mut self) -> Option<String> {
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(frame)) => {
                        return frame.map(|f| f.reason.into_owned());
                    }
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
            None
        })
        .await;
        closed.expect("timeout waiting for close")
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    tweak(&mut config);
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = sigrelay::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

/// Like [`start_server`], but stopped by sending on the returned channel.
pub async fn start_server_with_shutdown() -> (
    SocketAddr,
    Arc<ServerState>,
    tokio::sync::watch::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(test_config(addr)));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());

    let state_clone = state.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = sigrelay::run_with_shutdown(listener, state_clone, shutdown_rx).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state, shutdown_tx, server)
}

/// Poll until `check` holds or a second has passed.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
