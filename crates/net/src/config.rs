use crate::protocol::DEFAULT_PORT;

/// Startup configuration for a session facade. All timing values are in
/// seconds and run off the update clock, not wall time.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub max_clients: usize,
    pub server_port: u16,
    /// Client bind port; 0 lets the OS pick.
    pub client_port: u16,
    pub timeout: f64,
    /// Length of the keys exchanged during the handshake.
    pub key_bytes: usize,
    pub client_queue_size: usize,
    pub server_queue_size_per_client: usize,
    pub client_message_budget: usize,
    pub server_message_budget: usize,
    pub reliable_window: usize,
    pub resend_interval: f64,
    pub handshake_resend_interval: f64,
    pub keepalive_interval: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_clients: 4,
            server_port: DEFAULT_PORT,
            client_port: 0,
            timeout: 10.0,
            key_bytes: 32,
            client_queue_size: 256,
            server_queue_size_per_client: 64,
            client_message_budget: 256,
            server_message_budget: 1024,
            reliable_window: 64,
            resend_interval: 0.1,
            handshake_resend_interval: 0.5,
            keepalive_interval: 1.0,
        }
    }
}
