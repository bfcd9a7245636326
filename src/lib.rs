//! ShatpadLink - network core for the hexapod robot remote-control client
//!
//! Owns the two long-lived TCP channels to the robot: a text command
//! channel (`#`-delimited, newline-terminated records, default port 5002)
//! and a binary video channel (length-prefixed frames, default port 8002).
//! The UI layer drives it entirely through [`NetworkManager`]: `connect`,
//! `disconnect`, `send_command`, `get_video_frame`, `state`, and a
//! state-change notification.
//!
//! Rendering, command semantics, and settings persistence are the caller's
//! business; this crate only moves bytes reliably and tells the caller
//! when the link changes state.

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod guarded;
pub mod logging;
pub mod manager;
mod threading;
pub mod video;

// Re-export commonly used types
pub use command::{CommandChannel, CommandRecord};
pub use config::LinkConfig;
pub use connection::{Connection, ConnectionState, Connector};
pub use error::{Error, Result};
pub use guarded::{GuardedValue, ObserverId};
pub use manager::{BackoffPolicy, NetworkManager};
pub use video::{FrameHandle, VideoStream};
