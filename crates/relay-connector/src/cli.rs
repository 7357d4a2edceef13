use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Args {
    #[arg(long, short, env = "RUSTY_RELAY_SERVER")]
    /// The rusty-relay-server hostname e.g: localhost:8080 or my.server.com
    pub server: String,

    #[arg(long, env = "RUSTY_RELAY_TENANT")]
    /// Tenant this connector serves
    pub tenant: String,

    #[arg(long, env = "RUSTY_RELAY_SECRET", hide_env_values = true)]
    /// Tenant secret configured on rusty-relay-server
    pub secret: String,

    #[arg(long, env = "RUSTY_RELAY_TARGET")]
    /// Base URL of the private target e.g: http://localhost:3000
    pub target: String,

    #[arg(long, short)]
    /// Connect to rusty-relay-server without TLS
    pub insecure: bool,

    #[arg(long, short, env = "RUSTY_RELAY_CA_CERT")]
    /// Path to CA certificate (PEM encoded)
    pub ca_cert: Option<String>,

    #[arg(long, default_value_t = 1, env = "RUSTY_RELAY_CONNECTIONS")]
    /// Number of physical links to keep open
    pub connections: usize,

    #[arg(long, default_value_t = 500, env = "RUSTY_RELAY_RECONNECT_MIN_MS")]
    /// Shortest delay before reconnecting, in milliseconds
    pub reconnect_min_ms: u64,

    #[arg(long, default_value_t = 30_000, env = "RUSTY_RELAY_RECONNECT_MAX_MS")]
    /// Longest delay before reconnecting, in milliseconds
    pub reconnect_max_ms: u64,

    #[arg(long, default_value_t = 10_000, env = "RUSTY_RELAY_HANDSHAKE_TIMEOUT_MS")]
    /// How long to wait for the server to accept the handshake, in milliseconds
    pub handshake_timeout_ms: u64,

    #[arg(long, default_value_t = 64 * 1024, env = "RUSTY_RELAY_INLINE_BODY_LIMIT")]
    /// Response bodies up to this many bytes are sent inline
    pub inline_body_limit: u64,
}

impl Args {
    pub fn ws_url(&self) -> String {
        let protocol = if self.insecure { "ws://" } else { "wss://" };
        format!("{protocol}{}/connect", self.server)
    }

    pub fn http_url(&self) -> String {
        let protocol = if self.insecure { "http://" } else { "https://" };
        format!("{protocol}{}", self.server)
    }

    pub fn reconnect_delays(&self) -> (Duration, Duration) {
        let min = Duration::from_millis(self.reconnect_min_ms);
        let max = Duration::from_millis(self.reconnect_max_ms).max(min);
        (min, max)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

pub fn args() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_follow_insecure_flag() {
        let args = Args::parse_from([
            "rusty-relay-connector",
            "--server",
            "relay.example.com",
            "--tenant",
            "t1",
            "--secret",
            "s1",
            "--target",
            "http://localhost:3000",
            "--insecure",
        ]);

        assert_eq!(args.ws_url(), "ws://relay.example.com/connect");
        assert_eq!(args.http_url(), "http://relay.example.com");
        assert_eq!(args.connections, 1);
    }

    #[test]
    fn test_reconnect_max_is_never_below_min() {
        let args = Args::parse_from([
            "rusty-relay-connector",
            "-s",
            "localhost:8080",
            "--tenant",
            "t1",
            "--secret",
            "s1",
            "--target",
            "http://localhost:3000",
            "--reconnect-min-ms",
            "2000",
            "--reconnect-max-ms",
            "100",
        ]);

        let (min, max) = args.reconnect_delays();
        assert_eq!(min, Duration::from_secs(2));
        assert_eq!(max, Duration::from_secs(2));
    }
}
