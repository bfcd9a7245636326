//! In-memory connection doubles for testing

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Connection, ConnectionState, Connector};
use crate::error::{Error, Result};

/// Deterministic in-memory [`Connection`] double.
///
/// Reads are scripted with [`push_read`](MockConnection::push_read): each
/// injected chunk is handed out starting with the next `receive` call, so
/// tests control segmentation precisely. Writes are captured for
/// inspection. `receive` parks on a condvar until data arrives, the peer
/// closes, or the timeout elapses, matching the blocking behavior of the
/// real socket.
#[derive(Clone)]
pub struct MockConnection {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<MockState>,
    cond: Condvar,
}

struct MockState {
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    peer_closed: bool,
    closed: bool,
}

impl MockConnection {
    /// Create a connected mock.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MockState {
                    reads: VecDeque::new(),
                    written: Vec::new(),
                    peer_closed: false,
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Queue one chunk of inbound data; a blocked `receive` wakes up.
    pub fn push_read(&self, data: &[u8]) {
        let mut state = self.inner.state.lock();
        state.reads.push_back(data.to_vec());
        self.inner.cond.notify_all();
    }

    /// Simulate the peer closing its end. Queued chunks are still drained;
    /// after that, `receive` fails with `Error::Connection`.
    pub fn close_peer(&self) {
        let mut state = self.inner.state.lock();
        state.peer_closed = true;
        self.inner.cond.notify_all();
    }

    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.state.lock().written.clone()
    }

    /// Number of injected chunks not yet consumed by `receive`.
    pub fn pending_reads(&self) -> usize {
        self.inner.state.lock().reads.len()
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MockConnection {
    fn send(&self, data: &[u8], _timeout: Duration) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::Connection("connection closed".to_string()));
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();

        loop {
            if state.closed {
                return Err(Error::Connection("connection closed".to_string()));
            }
            if let Some(mut chunk) = state.reads.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    // Hand the remainder to the next receive call.
                    let rest = chunk.split_off(n);
                    state.reads.push_front(rest);
                }
                return Ok(Some(n));
            }
            if state.peer_closed {
                return Err(Error::Connection("connection closed by peer".to_string()));
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.cond.notify_all();
    }

    fn state(&self) -> ConnectionState {
        if self.inner.state.lock().closed {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }
}

/// Scripted [`Connector`] double for exercising the manager's retry loop.
///
/// The first `failures` calls to `open` fail with `Error::Connection`;
/// every later call opens a fresh [`MockConnection`]. Opened connections
/// are retained in call order — for each successful manager attempt, the
/// control connection precedes the video connection.
pub struct MockConnector {
    inner: Arc<Mutex<ConnectorScript>>,
}

struct ConnectorScript {
    failures_remaining: usize,
    opened: Vec<MockConnection>,
    attempts: usize,
}

impl MockConnector {
    /// Connector whose every `open` succeeds.
    pub fn new() -> Self {
        Self::failing_times(0)
    }

    /// Connector whose first `count` opens fail.
    pub fn failing_times(count: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectorScript {
                failures_remaining: count,
                opened: Vec::new(),
                attempts: 0,
            })),
        }
    }

    /// Total number of `open` calls so far.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    /// Handles onto every connection opened so far, in call order.
    pub fn opened(&self) -> Vec<MockConnection> {
        self.inner.lock().opened.clone()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MockConnector {
    fn open(&self, host: &str, port: u16, _timeout: Duration) -> Result<Arc<dyn Connection>> {
        let mut script = self.inner.lock();
        script.attempts += 1;
        if script.failures_remaining > 0 {
            script.failures_remaining -= 1;
            return Err(Error::Connection(format!(
                "scripted connect failure for {}:{}",
                host, port
            )));
        }
        let conn = MockConnection::new();
        script.opened.push(conn.clone());
        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[test]
    fn test_chunks_are_not_coalesced() {
        let conn = MockConnection::new();
        conn.push_read(b"abc");
        conn.push_read(b"def");

        let mut buf = [0u8; 16];
        assert_eq!(conn.receive(&mut buf, TIMEOUT).unwrap(), Some(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(conn.receive(&mut buf, TIMEOUT).unwrap(), Some(3));
        assert_eq!(&buf[..3], b"def");
    }

    #[test]
    fn test_oversized_chunk_is_split() {
        let conn = MockConnection::new();
        conn.push_read(b"abcdef");

        let mut buf = [0u8; 4];
        assert_eq!(conn.receive(&mut buf, TIMEOUT).unwrap(), Some(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(conn.receive(&mut buf, TIMEOUT).unwrap(), Some(2));
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn test_receive_times_out_without_data() {
        let conn = MockConnection::new();
        let start = Instant::now();
        let mut buf = [0u8; 4];
        assert_eq!(conn.receive(&mut buf, TIMEOUT).unwrap(), None);
        assert!(start.elapsed() >= TIMEOUT);
    }

    #[test]
    fn test_peer_close_drains_queued_data_first() {
        let conn = MockConnection::new();
        conn.push_read(b"tail");
        conn.close_peer();

        let mut buf = [0u8; 16];
        assert_eq!(conn.receive(&mut buf, TIMEOUT).unwrap(), Some(4));
        assert!(conn.receive(&mut buf, TIMEOUT).is_err());
    }

    #[test]
    fn test_close_fails_io_and_is_idempotent() {
        let conn = MockConnection::new();
        conn.close();
        conn.close();

        let mut buf = [0u8; 4];
        assert!(conn.receive(&mut buf, TIMEOUT).is_err());
        assert!(conn.send(b"x", TIMEOUT).is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_send_captures_writes() {
        let conn = MockConnection::new();
        conn.send(b"CMD_MOVE#1\n", TIMEOUT).unwrap();
        conn.send(b"CMD_LED#255\n", TIMEOUT).unwrap();
        assert_eq!(conn.written(), b"CMD_MOVE#1\nCMD_LED#255\n");
    }

    #[test]
    fn test_connector_scripted_failures() {
        let connector = MockConnector::failing_times(2);
        assert!(connector.open("robot", 5002, TIMEOUT).is_err());
        assert!(connector.open("robot", 5002, TIMEOUT).is_err());
        assert!(connector.open("robot", 5002, TIMEOUT).is_ok());
        assert_eq!(connector.attempts(), 3);
        assert_eq!(connector.opened().len(), 1);
    }
}
