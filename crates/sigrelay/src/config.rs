use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the signaling relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "sigrelay")]
#[command(about = "WebSocket signaling relay for peer-to-peer connection setup")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "SIGRELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SIGRELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "SIGRELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "SIGRELAY_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum routed messages per minute per connection.
    #[arg(long, default_value = "600", env = "SIGRELAY_MSG_RATE")]
    pub msg_rate: u32,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "SIGRELAY_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Seconds a new connection has to send `register`.
    #[arg(long, default_value = "10", env = "SIGRELAY_REGISTER_TIMEOUT")]
    pub register_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "SIGRELAY_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "SIGRELAY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Outbound queue depth per connection.
    #[arg(long, default_value = "256", env = "SIGRELAY_SEND_QUEUE")]
    pub send_queue: usize,
    /// Offer each new connection a server-issued id in a `welcome` envelope.
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "SIGRELAY_ISSUE_IDS"
    )]
    pub issue_ids: bool,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum routed messages per minute per connection.
    pub msg_rate: u32,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Seconds a new connection has to send `register`.
    pub register_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Outbound queue depth per connection.
    pub send_queue: usize,
    /// Offer each new connection a server-issued id.
    pub issue_ids: bool,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.msg_rate == 0 {
            return Err("msg_rate must be greater than 0".to_string());
        }
        if self.msg_rate > 1_000_000 {
            return Err("msg_rate exceeds reasonable limit (1,000,000 msg/min)".to_string());
        }

        const MAX_ALLOWED_MESSAGE: usize = 16 * 1024 * 1024;
        if self.max_message_size == 0 {
            return Err("max_message_size must be greater than 0".to_string());
        }
        if self.max_message_size > MAX_ALLOWED_MESSAGE {
            return Err(format!(
                "max_message_size exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_MESSAGE
            ));
        }

        if self.register_timeout == 0 {
            return Err("register_timeout must be greater than 0".to_string());
        }
        if self.register_timeout > 300 {
            return Err("register_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout cannot be shorter than ping_interval".to_string());
        }

        if self.send_queue == 0 {
            return Err("send_queue must be greater than 0".to_string());
        }
        if self.send_queue > 65_536 {
            return Err("send_queue exceeds reasonable limit (65536)".to_string());
        }
        Ok(())
    }

    /// Registration deadline as a [`Duration`].
    #[must_use]
    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            msg_rate: args.msg_rate,
            max_message_size: args.max_message_size,
            register_timeout: args.register_timeout,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            send_queue: args.send_queue,
            issue_ids: args.issue_ids,
        }
    }
}
