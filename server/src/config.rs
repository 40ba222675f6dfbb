use std::time::Duration;

/// Tunables for the collaboration core. Everything has a sensible default;
/// only the bind address is read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Per-room ordering queue capacity.
    pub queue_capacity: usize,
    /// Per-connection outbound buffer. A member whose buffer fills is
    /// dropped rather than allowed to stall the room.
    pub outbound_buffer: usize,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    /// Default TTL for the exclusive edit lock.
    pub lock_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            queue_capacity: 1024,
            outbound_buffer: 64,
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("COLLAB_BIND") {
            config.bind = bind;
        }
        config
    }
}
