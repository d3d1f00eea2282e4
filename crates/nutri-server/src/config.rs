use std::time::Duration;

/// Claim carrying the owning practitioner's id.
pub const DEFAULT_PRACTITIONER_CLAIM: &str = "practitioner_id";

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outbound queue length per remote connection.
    pub max_send_queue: usize,
    /// Buffered notifications per server-sent-events session.
    pub session_queue: usize,
    pub heartbeat_interval: Duration,
    /// Connections without a pong for this long are removed.
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub practitioner_claim: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5080,
            max_send_queue: 256,
            session_queue: 64,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(60),
            practitioner_claim: DEFAULT_PRACTITIONER_CLAIM.into(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
