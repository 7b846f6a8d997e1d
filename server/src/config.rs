//! Runtime configuration for the relay

use relay_protocol::{DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT};
use std::time::Duration;

/// All interfaces; the relay is meant for trusted networks
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;
/// Unexpected errors tolerated per connection before it is dropped
pub const DEFAULT_MAX_ERRORS: u32 = 50;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Canonical names allowed to run `SHOW USERS`
    pub privileged_users: Vec<String>,
    /// `None` lets an idle connection live forever
    pub idle_timeout: Option<Duration>,
    pub max_errors: u32,
    /// Outbound messages buffered per connection before deliveries are dropped
    pub queue_capacity: usize,
    pub max_frame_len: usize,
}

impl RelayConfig {
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_privileged(&self, name: &str) -> bool {
        self.privileged_users.iter().any(|user| user == name)
    }

    /// Converts a seconds value where 0 means "no timeout"
    pub fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            privileged_users: Vec::new(),
            idle_timeout: Self::idle_timeout_from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_errors: DEFAULT_MAX_ERRORS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
