//! Thread helpers shared by the channel reader loops.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Join `handle`, giving up after `timeout`.
///
/// `JoinHandle::join` has no deadline, so this polls `is_finished` and
/// abandons the handle on overrun; the leaked thread is logged, not retried.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{} thread did not stop within {:?}", name, timeout);
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        log::error!("{} thread panicked", name);
    }
}
