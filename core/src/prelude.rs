use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::line::DecodeError;

/// Settings for the radio modem's serial device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyUSB0`. `None` runs the reader inert.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Blocking read timeout; bounds how long a stop request can go unnoticed.
    pub read_timeout_ms: u64,
    /// Pause after an empty read before polling again.
    pub idle_poll_ms: u64,
    pub join_timeout_ms: u64,
    /// Longest partial line kept while waiting for its newline.
    pub max_line_bytes: usize,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            read_timeout_ms: 100,
            idle_poll_ms: 10,
            join_timeout_ms: 1000,
            max_line_bytes: 1024,
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Fusion window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub window_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { window_ms: 500 }
    }
}

impl FusionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Partner-station link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Delay after a failed connect attempt.
    pub retry_delay_ms: u64,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_buffer_bytes: usize,
    /// Longest partial message kept while waiting for its newline.
    pub max_frame_bytes: usize,
    pub join_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "192.168.154.1".to_string(),
            port: 65432,
            retry_delay_ms: 2000,
            max_retries: None,
            heartbeat_interval_ms: 500,
            connect_timeout_ms: 3000,
            read_buffer_bytes: 4096,
            max_frame_bytes: 64 * 1024,
            join_timeout_ms: 1000,
        }
    }
}

impl RelayConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Common error type for the link layer.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("not connected")]
    NotConnected,
    #[error("no tokio runtime available: {0}")]
    Runtime(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type LinkResult<T> = Result<T, LinkError>;
