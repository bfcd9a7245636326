//! Text command channel
//!
//! Wire format: ASCII fields separated by `#`, records terminated by `\n`,
//! e.g. `CMD_MOVE#1#10#-5#8#3\n`. Outbound records are written through the
//! underlying connection; inbound bytes are reassembled into complete
//! records by a dedicated reader thread and handed to the owner through a
//! bounded queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::guarded::GuardedValue;
use crate::threading::join_with_timeout;

/// Well-known command codes understood by the robot firmware.
pub mod codes {
    pub const CMD_MOVE: &str = "CMD_MOVE";
    pub const CMD_LED: &str = "CMD_LED";
    pub const CMD_LED_MOD: &str = "CMD_LED_MOD";
    pub const CMD_HEAD: &str = "CMD_HEAD";
    pub const CMD_SONIC: &str = "CMD_SONIC";
    pub const CMD_POWER: &str = "CMD_POWER";
    pub const CMD_BUZZER: &str = "CMD_BUZZER";
    pub const CMD_BALANCE: &str = "CMD_BALANCE";
    pub const CMD_CALIBRATION: &str = "CMD_CALIBRATION";
    pub const CMD_ATTITUDE: &str = "CMD_ATTITUDE";
    pub const CMD_POSITION: &str = "CMD_POSITION";
    pub const CMD_RELAX: &str = "CMD_RELAX";
    pub const CMD_SERVOPOWER: &str = "CMD_SERVOPOWER";
}

/// One parsed inbound record: `#`-separated fields, first field is the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    fields: Vec<String>,
}

impl CommandRecord {
    /// Parse a record from a line with the trailing `\n` already stripped.
    pub fn parse(line: &str) -> Self {
        Self {
            fields: line.split('#').map(str::to_string).collect(),
        }
    }

    /// The command code (first field).
    pub fn code(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// All fields in wire order, code included.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Assemble a terminated wire record from fields.
    pub fn to_wire(fields: &[&str]) -> String {
        let mut out = fields.join("#");
        out.push('\n');
        out
    }
}

/// Capacity of the inbound record queue; a full queue drops the newest
/// record with a log line.
const RECORD_QUEUE_CAPACITY: usize = 64;

/// Receive timeout of the reader loop, bounding the stop-flag check interval.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `stop` waits for the reader thread to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 4096;

/// Newline-terminated text command framing over one [`Connection`].
///
/// Owns a single reader thread for the lifetime of the channel. The channel
/// never reconnects on its own: a connection failure moves its state to
/// `Error` and the reader exits.
pub struct CommandChannel {
    conn: Arc<dyn Connection>,
    records: Receiver<CommandRecord>,
    state: Arc<GuardedValue<ConnectionState>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl CommandChannel {
    /// Start the channel and its reader thread over `conn`.
    pub fn start(conn: Arc<dyn Connection>) -> Result<Self> {
        let (tx, rx) = bounded(RECORD_QUEUE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(GuardedValue::new(
            ConnectionState::Connected,
            "command_channel_state",
        ));

        let reader = {
            let conn = Arc::clone(&conn);
            let stop = Arc::clone(&stop);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("command-reader".to_string())
                .spawn(move || {
                    debug!("command reader started");
                    match reader_loop(conn.as_ref(), &tx, &stop) {
                        Ok(()) => state.set(ConnectionState::Disconnected),
                        Err(e) => {
                            if stop.load(Ordering::Relaxed) {
                                // Force-closed during shutdown; not a failure.
                                state.set(ConnectionState::Disconnected);
                            } else {
                                error!("command channel failed: {}", e);
                                state.set(ConnectionState::Error);
                            }
                        }
                    }
                    debug!("command reader exiting");
                })?
        };

        info!("command channel started");

        Ok(Self {
            conn,
            records: rx,
            state,
            stop,
            reader: Some(reader),
        })
    }

    /// Send one fully terminated record.
    ///
    /// The channel never appends delimiters; a record without its trailing
    /// newline is rejected before any I/O.
    pub fn send_command(&self, text: &str, timeout: Duration) -> Result<()> {
        if !text.ends_with('\n') {
            return Err(Error::Protocol(format!(
                "unterminated command record: {:?}",
                text
            )));
        }
        self.conn.send(text.as_bytes(), timeout)
    }

    /// Inbound record queue, in wire order.
    pub fn records(&self) -> &Receiver<CommandRecord> {
        &self.records
    }

    /// Current channel state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Channel state cell, observed by the manager to escalate background
    /// reader failures.
    pub(crate) fn state_cell(&self) -> &Arc<GuardedValue<ConnectionState>> {
        &self.state
    }

    /// Signal the reader to stop, force-close the connection to unblock a
    /// parked `receive`, and join the thread with a bounded timeout.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.conn.close();
        if let Some(handle) = self.reader.take() {
            join_with_timeout(handle, JOIN_TIMEOUT, "command-reader");
            info!("command channel stopped");
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    conn: &dyn Connection,
    tx: &Sender<CommandRecord>,
    stop: &AtomicBool,
) -> Result<()> {
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while !stop.load(Ordering::Relaxed) {
        match conn.receive(&mut chunk, READ_TIMEOUT)? {
            Some(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                dispatch_complete(&mut buffer, tx);
            }
            None => {
                // No data within the timeout; loop again after the flag check.
            }
        }
    }

    Ok(())
}

/// Split off and dispatch every complete `\n`-terminated record in `buffer`,
/// leaving any trailing partial record buffered for the next read.
fn dispatch_complete(buffer: &mut Vec<u8>, tx: &Sender<CommandRecord>) {
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        if line.is_empty() {
            continue;
        }
        if tx.try_send(CommandRecord::parse(&line)).is_err() {
            warn!("record queue full, dropping inbound record");
        }
    }
}
