//! TCP socket connection

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use super::{Connection, ConnectionState, Connector};
use crate::error::{Error, Result};
use crate::guarded::GuardedValue;

/// TCP implementation of [`Connection`].
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    state: GuardedValue<ConnectionState>,
}

impl TcpConnection {
    /// Connect to `host:port`, blocking until the handshake completes or
    /// `timeout` elapses.
    ///
    /// Resolution or refused-connection failures surface as
    /// `Error::Connection`; an expired handshake deadline as `Error::Timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = resolve(host, port)?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock {
                Error::Timeout
            } else {
                Error::Connection(format!("connect to {} failed: {}", addr, e))
            }
        })?;

        log::info!("connected to {}", addr);

        Ok(Self {
            stream,
            peer: addr,
            state: GuardedValue::new(ConnectionState::Connected, "tcp_connection_state"),
        })
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Connection(format!("failed to resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| Error::Connection(format!("no addresses for {}:{}", host, port)))
}

impl Connection for TcpConnection {
    fn send(&self, data: &[u8], timeout: Duration) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(Error::Connection("not connected".to_string()));
        }

        self.stream.set_write_timeout(Some(timeout))?;

        // write_all retries partial writes internally; callers never see a
        // partial-write count.
        match (&self.stream).write_all(data) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Err(Error::Timeout)
            }
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                Err(Error::Connection(format!(
                    "send to {} failed: {}",
                    self.peer, e
                )))
            }
        }
    }

    fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        if self.state.get() != ConnectionState::Connected {
            return Err(Error::Connection("not connected".to_string()));
        }

        self.stream.set_read_timeout(Some(timeout))?;

        match (&self.stream).read(buf) {
            Ok(0) => {
                self.state.set(ConnectionState::Disconnected);
                Err(Error::Connection(format!("{} closed by peer", self.peer)))
            }
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => {
                self.state.set(ConnectionState::Disconnected);
                Err(Error::Connection(format!(
                    "receive from {} failed: {}",
                    self.peer, e
                )))
            }
        }
    }

    fn close(&self) {
        if self.state.get() == ConnectionState::Disconnected {
            return;
        }
        // Shut down both halves so a thread parked in receive wakes up with
        // an error instead of blocking until its timeout.
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state.set(ConnectionState::Disconnected);
        log::debug!("connection to {} closed", self.peer);
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Default connector producing real TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(&self, host: &str, port: u16, timeout: Duration) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(TcpConnection::connect(host, port, timeout)?))
    }
}
