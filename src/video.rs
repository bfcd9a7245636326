//! Video frame channel
//!
//! Wire format: `[u32 little-endian length][payload]`, repeated
//! indefinitely. Only the most recently completed frame is retained; an
//! undelivered older frame is overwritten, never queued. A frame length of
//! zero or above the configured maximum means the stream offset can no
//! longer be trusted, and the channel dies rather than guess a resync
//! point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::guarded::GuardedValue;
use crate::threading::join_with_timeout;

/// Default upper bound on a single encoded frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Default deadline for assembling one frame once its header arrived.
pub const DEFAULT_FRAME_DEADLINE: Duration = Duration::from_secs(5);

/// Receive timeout of the reader loop, bounding the stop-flag check interval.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `stop` waits for the reader thread to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK_SIZE: usize = 4096;

/// Single-slot latest-frame buffer with a frame-ready condition.
struct FrameSlot {
    latest: Mutex<Option<Vec<u8>>>,
    ready: Condvar,
}

/// Cheap clonable handle onto the latest-frame slot.
///
/// Lets a render loop poll for frames without going through the manager's
/// channel lock on every call.
#[derive(Clone)]
pub struct FrameHandle {
    slot: Arc<FrameSlot>,
}

impl FrameHandle {
    /// Latest frame, waiting up to `timeout` if none has arrived yet.
    ///
    /// Repeated calls without a new delivery return the same frame again;
    /// consumers must tolerate repeats. Returns `None` only once `timeout`
    /// has fully elapsed with the slot still empty.
    pub fn get_frame(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut latest = self.slot.latest.lock();
        while latest.is_none() {
            if self.slot.ready.wait_until(&mut latest, deadline).timed_out() {
                break;
            }
        }
        latest.clone()
    }
}

/// Length-prefixed binary frame framing over one [`Connection`].
///
/// Owns a single reader thread for the lifetime of the stream. Like the
/// command channel, it never reconnects on its own.
pub struct VideoStream {
    conn: Arc<dyn Connection>,
    slot: Arc<FrameSlot>,
    state: Arc<GuardedValue<ConnectionState>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl VideoStream {
    /// Start the stream and its reader thread over `conn`.
    pub fn start(
        conn: Arc<dyn Connection>,
        max_frame_len: usize,
        frame_deadline: Duration,
    ) -> Result<Self> {
        let slot = Arc::new(FrameSlot {
            latest: Mutex::new(None),
            ready: Condvar::new(),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(GuardedValue::new(
            ConnectionState::Connected,
            "video_stream_state",
        ));

        let reader = {
            let conn = Arc::clone(&conn);
            let slot = Arc::clone(&slot);
            let stop = Arc::clone(&stop);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("video-reader".to_string())
                .spawn(move || {
                    debug!("video reader started");
                    match reader_loop(conn.as_ref(), &slot, &stop, max_frame_len, frame_deadline) {
                        Ok(()) => state.set(ConnectionState::Disconnected),
                        Err(e) => {
                            if stop.load(Ordering::Relaxed) {
                                // Force-closed during shutdown; not a failure.
                                state.set(ConnectionState::Disconnected);
                            } else {
                                error!("video channel failed: {}", e);
                                state.set(ConnectionState::Error);
                            }
                        }
                    }
                    debug!("video reader exiting");
                })?
        };

        info!("video stream started");

        Ok(Self {
            conn,
            slot,
            state,
            stop,
            reader: Some(reader),
        })
    }

    /// Latest frame, waiting up to `timeout` if none has arrived yet.
    pub fn get_frame(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.frames().get_frame(timeout)
    }

    /// Handle onto the latest-frame slot.
    pub fn frames(&self) -> FrameHandle {
        FrameHandle {
            slot: Arc::clone(&self.slot),
        }
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
            join_with_timeout(handle, JOIN_TIMEOUT, "video-reader");
            info!("video stream stopped");
        }
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    conn: &dyn Connection,
    slot: &FrameSlot,
    stop: &AtomicBool,
    max_frame_len: usize,
    frame_deadline: Duration,
) -> Result<()> {
    while !stop.load(Ordering::Relaxed) {
        // Header: exactly 4 bytes, accumulated across short reads. No
        // deadline here — between frames the stream is legitimately idle.
        let header = match read_exact(conn, 4, None, stop)? {
            Some(h) => h,
            None => break,
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;

        if len == 0 {
            return Err(Error::Protocol(
                "zero-length frame, stream desynchronized".to_string(),
            ));
        }
        if len > max_frame_len {
            return Err(Error::FrameTooLarge {
                len,
                max: max_frame_len,
            });
        }

        // Payload: exactly `len` bytes under an overall per-frame deadline.
        let payload = match read_exact(conn, len, Some(Instant::now() + frame_deadline), stop)? {
            Some(p) => p,
            None => break,
        };

        let mut latest = slot.latest.lock();
        *latest = Some(payload);
        slot.ready.notify_all();
    }

    Ok(())
}

/// Accumulate exactly `len` bytes from `conn`.
///
/// Returns `Ok(None)` when the stop flag was raised mid-read, and
/// `Err(Error::Timeout)` when `deadline` expires first — for a frame
/// payload that means the stream is desynchronized and the channel dies.
fn read_exact(
    conn: &dyn Connection,
    len: usize,
    deadline: Option<Instant>,
    stop: &AtomicBool,
) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::with_capacity(len);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    while out.len() < len {
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        let want = (len - out.len()).min(chunk.len());
        match conn.receive(&mut chunk[..want], READ_TIMEOUT)? {
            Some(n) => out.extend_from_slice(&chunk[..n]),
            None => {
                // No data yet; deadline and stop flag re-checked above.
            }
        }
    }

    Ok(Some(out))
}
