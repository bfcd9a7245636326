//! Connection layer: one bidirectional byte stream to the robot.
//!
//! The rest of the crate is agnostic to the concrete transport; channels
//! receive an `Arc<dyn Connection>` and the manager obtains fresh instances
//! through a [`Connector`]. Two variants exist: [`TcpConnection`] for the
//! real socket and [`MockConnection`] as a deterministic in-memory double.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

mod mock;
mod tcp;

pub use mock::{MockConnection, MockConnector};
pub use tcp::{TcpConnection, TcpConnector};

/// Lifecycle of a connection, or of the manager that owns a pair of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the initial and terminal state
    Disconnected,
    /// Connection establishment in progress
    Connecting,
    /// Connected and exchanging data
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// A failure occurred; only a new `connect` recovers
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One bidirectional byte-stream endpoint (control or video).
///
/// Methods take `&self` so a reader thread can block in [`receive`] while
/// another thread calls [`close`] to unblock it.
///
/// [`receive`]: Connection::receive
/// [`close`]: Connection::close
pub trait Connection: Send + Sync {
    /// Write the entire buffer or fail; never reports a partial write.
    fn send(&self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Read up to `buf.len()` bytes from the stream.
    ///
    /// Returns `Ok(Some(n))` with `1..=buf.len()` bytes, or `Ok(None)` when
    /// no bytes arrived within `timeout` — the connection stays usable and
    /// the caller simply tries again. A zero-length read (peer closed) and
    /// any transport failure are `Err(Error::Connection)`.
    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;

    /// Close the connection.
    ///
    /// Idempotent and callable from any thread, including concurrently with
    /// an in-flight `send`/`receive`; those calls then fail with
    /// `Error::Connection` instead of blocking.
    fn close(&self);

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}

/// Factory producing a fresh [`Connection`] per attempt.
///
/// A connection is never reused across a connect/close cycle; the manager
/// asks its connector for a new instance on every retry.
pub trait Connector: Send + Sync {
    /// Open a new connection to `host:port`, blocking until the transport
    /// handshake completes or `timeout` elapses.
    fn open(&self, host: &str, port: u16, timeout: Duration) -> Result<Arc<dyn Connection>>;
}
