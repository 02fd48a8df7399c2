use std::time::Duration;

use serde::{Deserialize, Serialize};

/// In-process broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Virtual host reported by connections.
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,

    /// Messages a queue holds while it has no consumer; further publishes are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            virtual_host: default_virtual_host(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_queue_capacity() -> usize {
    10_000
}

/// Mocked receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Wait bound used by the receiver's timed readers when none is given.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl ReceiverConfig {
    /// The default wait bound as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    500
}
