//! Configuration for the ShatpadLink client core
//!
//! Loads configuration from a TOML file. The robot address itself is not
//! part of the configuration — it is always passed to `connect` by the
//! caller — only protocol defaults, timeouts, and the retry policy live
//! here.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::manager::BackoffPolicy;

/// Top-level client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    pub network: NetworkConfig,
    pub backoff: BackoffConfig,
    pub video: VideoConfig,
    pub logging: LoggingConfig,
}

/// Channel ports and socket timeouts
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Control (text command) channel port
    pub control_port: u16,
    /// Video frame channel port
    pub video_port: u16,
    /// Transport handshake deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-operation socket timeout in milliseconds
    pub io_timeout_ms: u64,
}

/// Retry schedule for connection establishment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackoffConfig {
    /// Number of connection attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Geometric growth factor per further attempt
    pub multiplier: f64,
}

impl BackoffConfig {
    /// Build the policy consumed by the manager.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// Video channel limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoConfig {
    /// Upper bound on a single encoded frame, in bytes
    pub max_frame_len: usize,
    /// Deadline for assembling one frame once its header arrived, in
    /// milliseconds
    pub frame_deadline_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout or stderr)
    pub output: String,
}

impl LinkConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration for the hexapod robot.
    pub fn hexapod_defaults() -> Self {
        Self {
            network: NetworkConfig {
                control_port: 5002,
                video_port: 8002,
                connect_timeout_ms: 5000,
                io_timeout_ms: 1000,
            },
            backoff: BackoffConfig {
                max_attempts: 3,
                base_delay_ms: 1000,
                multiplier: 2.0,
            },
            video: VideoConfig {
                max_frame_len: 10 * 1024 * 1024,
                frame_deadline_ms: 5000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                output: "stdout".to_string(),
            },
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::hexapod_defaults()
    }
}
