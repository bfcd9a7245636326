//! Connection lifecycle orchestration
//!
//! The [`NetworkManager`] owns both channels to the robot and is the only
//! entry point the UI layer talks to: `connect`, `disconnect`,
//! `send_command`, `get_video_frame`, `state`, and a state-change
//! notification. Establishment retries with exponential backoff; teardown
//! force-closes the sockets to unblock the reader threads and joins them
//! with a bounded timeout.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::command::{CommandChannel, CommandRecord};
use crate::config::LinkConfig;
use crate::connection::{ConnectionState, Connector, TcpConnector};
use crate::error::{Error, Result};
use crate::guarded::{GuardedValue, ObserverId};
use crate::video::{FrameHandle, VideoStream, DEFAULT_FRAME_DEADLINE, DEFAULT_MAX_FRAME_LEN};

/// Delay schedule between connection attempts, growing geometrically.
///
/// Pure configuration; the manager consults it, it holds no mutable state.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Number of connection attempts before `connect` gives up
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Growth factor applied per further attempt
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Delay to sleep after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .mul_f64(self.multiplier.powi(attempt.saturating_sub(1) as i32))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Default control-channel port on the robot.
pub const DEFAULT_CONTROL_PORT: u16 = 5002;

/// Default video-channel port on the robot.
pub const DEFAULT_VIDEO_PORT: u16 = 8002;

/// Default transport handshake deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-operation socket timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

struct Channels {
    command: CommandChannel,
    video: VideoStream,
}

/// Orchestrates the control and video channels to the robot.
pub struct NetworkManager {
    connector: Arc<dyn Connector>,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
    io_timeout: Duration,
    max_frame_len: usize,
    frame_deadline: Duration,
    state: Arc<GuardedValue<ConnectionState>>,
    channels: Mutex<Option<Channels>>,
    // Serializes connect/disconnect so teardown cannot interleave with an
    // establishment in progress.
    ops: Mutex<()>,
}

impl NetworkManager {
    /// Manager over real TCP connections with the default policy.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(TcpConnector), BackoffPolicy::default())
    }

    /// Manager over real TCP connections configured from `config`.
    pub fn with_config(config: &LinkConfig) -> Self {
        let mut manager = Self::with_connector(Arc::new(TcpConnector), config.backoff.policy());
        manager.connect_timeout = Duration::from_millis(config.network.connect_timeout_ms);
        manager.io_timeout = Duration::from_millis(config.network.io_timeout_ms);
        manager.max_frame_len = config.video.max_frame_len;
        manager.frame_deadline = Duration::from_millis(config.video.frame_deadline_ms);
        manager
    }

    /// Constructor injection point for the connection variant.
    pub fn with_connector(connector: Arc<dyn Connector>, backoff: BackoffPolicy) -> Self {
        Self {
            connector,
            backoff,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            frame_deadline: DEFAULT_FRAME_DEADLINE,
            state: Arc::new(GuardedValue::new(
                ConnectionState::Disconnected,
                "network_manager_state",
            )),
            channels: Mutex::new(None),
            ops: Mutex::new(()),
        }
    }

    /// Current manager state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether both channels are up.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register a state-change observer.
    pub fn on_state_changed<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.state.add_observer(move |old, new| observer(*old, *new))
    }

    /// Remove a previously registered state observer.
    pub fn remove_state_observer(&self, id: ObserverId) {
        self.state.remove_observer(id);
    }

    /// Connect both channels to the robot, retrying with exponential
    /// backoff up to the configured attempt limit.
    ///
    /// Allowed from `Disconnected` and — as the only recovery path — from
    /// `Error`; anything else is `Error::InvalidState`. The call blocks
    /// through every retry and returns once both channels are up or all
    /// attempts failed, in which case the state returns to `Disconnected`.
    pub fn connect(&self, host: &str, control_port: u16, video_port: u16) -> Result<()> {
        let _guard = self.ops.lock();

        match self.state.get() {
            ConnectionState::Disconnected => {}
            ConnectionState::Error => {
                // Leftover channels from the failed session die here.
                self.teardown_channels();
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "connect requires a disconnected manager, state is {}",
                    other
                )));
            }
        }

        self.state.set(ConnectionState::Connecting);

        let mut last_err = Error::Connection("no connection attempts made".to_string());

        for attempt in 1..=self.backoff.max_attempts {
            if attempt > 1 {
                info!("connection attempt {}/{}", attempt, self.backoff.max_attempts);
            }
            match self.try_connect(host, control_port, video_port) {
                Ok(channels) => {
                    let command_state = Arc::clone(channels.command.state_cell());
                    let video_state = Arc::clone(channels.video.state_cell());
                    *self.channels.lock() = Some(channels);
                    self.state.set(ConnectionState::Connected);
                    // A reader that died while the manager was still
                    // `Connecting` was skipped by the escalation observer;
                    // re-check now that it would escalate.
                    if command_state.get() == ConnectionState::Error
                        || video_state.get() == ConnectionState::Error
                    {
                        self.state.set(ConnectionState::Error);
                    }
                    info!(
                        "connected to {} (control {}, video {})",
                        host, control_port, video_port
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("connection attempt {} failed: {}", attempt, e);
                    last_err = e;
                    if attempt < self.backoff.max_attempts {
                        thread::sleep(self.backoff.delay_for(attempt));
                    }
                }
            }
        }

        error!(
            "failed to connect to {} after {} attempts",
            host, self.backoff.max_attempts
        );
        self.state.set(ConnectionState::Disconnected);
        Err(last_err)
    }

    /// One establishment attempt: two fresh connections, both channels
    /// started. Any partial result is closed before the error propagates.
    fn try_connect(&self, host: &str, control_port: u16, video_port: u16) -> Result<Channels> {
        let control = self.connector.open(host, control_port, self.connect_timeout)?;
        let video = match self.connector.open(host, video_port, self.connect_timeout) {
            Ok(conn) => conn,
            Err(e) => {
                control.close();
                return Err(e);
            }
        };

        let command = match CommandChannel::start(Arc::clone(&control)) {
            Ok(channel) => channel,
            Err(e) => {
                control.close();
                video.close();
                return Err(e);
            }
        };
        let video_stream =
            match VideoStream::start(Arc::clone(&video), self.max_frame_len, self.frame_deadline) {
                Ok(stream) => stream,
                Err(e) => {
                    // Dropping the command channel stops its reader.
                    drop(command);
                    video.close();
                    return Err(e);
                }
            };

        // Background reader failures surface only through the manager
        // state; callers observe it instead of catching exceptions from
        // threads they do not own.
        self.escalate_channel_errors(command.state_cell());
        self.escalate_channel_errors(video_stream.state_cell());

        Ok(Channels {
            command,
            video: video_stream,
        })
    }

    fn escalate_channel_errors(&self, channel_state: &Arc<GuardedValue<ConnectionState>>) {
        let manager_state = Arc::clone(&self.state);
        channel_state.add_observer(move |_, new| {
            if *new == ConnectionState::Error && manager_state.get() == ConnectionState::Connected {
                manager_state.set(ConnectionState::Error);
            }
        });
    }

    /// Tear down both channels and their connections.
    ///
    /// Calling this while already `Disconnected` is a no-op, never an
    /// error. The reader threads are unblocked by force-closing the
    /// sockets and then joined with a bounded timeout; an overrun is
    /// logged and the thread abandoned.
    pub fn disconnect(&self) {
        let _guard = self.ops.lock();

        if self.state.get() == ConnectionState::Disconnected {
            return;
        }

        self.state.set(ConnectionState::Disconnecting);
        self.teardown_channels();
        self.state.set(ConnectionState::Disconnected);
        info!("disconnected from robot");
    }

    fn teardown_channels(&self) {
        let channels = self.channels.lock().take();
        if let Some(mut channels) = channels {
            channels.command.stop();
            channels.video.stop();
        }
    }

    /// Send one fully terminated command record over the control channel.
    pub fn send_command(&self, command: &str) -> Result<()> {
        if self.state.get() != ConnectionState::Connected {
            return Err(Error::Connection("not connected to robot".to_string()));
        }
        let channels = self.channels.lock();
        match channels.as_ref() {
            Some(channels) => channels.command.send_command(command, self.io_timeout),
            None => Err(Error::Connection("not connected to robot".to_string())),
        }
    }

    /// Latest video frame, waiting up to `timeout` for the first one.
    ///
    /// Returns `None` immediately when not connected.
    pub fn get_video_frame(&self, timeout: Duration) -> Option<Vec<u8>> {
        if self.state.get() != ConnectionState::Connected {
            return None;
        }
        let frames = {
            let channels = self.channels.lock();
            channels.as_ref().map(|channels| channels.video.frames())
        };
        frames.and_then(|frames| frames.get_frame(timeout))
    }

    /// Handle onto the latest-frame slot, for render loops that poll
    /// without going through the manager.
    pub fn video_frames(&self) -> Option<FrameHandle> {
        let channels = self.channels.lock();
        channels.as_ref().map(|channels| channels.video.frames())
    }

    /// Next inbound record from the robot, waiting up to `timeout`.
    ///
    /// A timeout is the non-error `Ok(None)` outcome.
    pub fn recv_command(&self, timeout: Duration) -> Result<Option<CommandRecord>> {
        if self.state.get() != ConnectionState::Connected {
            return Err(Error::Connection("not connected to robot".to_string()));
        }
        let records = {
            let channels = self.channels.lock();
            match channels.as_ref() {
                Some(channels) => channels.command.records().clone(),
                None => return Err(Error::Connection("not connected to robot".to_string())),
            }
        };
        match records.recv_timeout(timeout) {
            Ok(record) => Ok(Some(record)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Connection("command channel closed".to_string()))
            }
        }
    }

    /// Inbound record queue, for event-loop integration.
    pub fn commands(&self) -> Option<Receiver<CommandRecord>> {
        let channels = self.channels.lock();
        channels
            .as_ref()
            .map(|channels| channels.command.records().clone())
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, MockConnection, MockConnector};
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_millis(500);

    /// Backoff short enough for tests: delays 20ms, 40ms.
    fn test_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    fn manager_with(connector: Arc<MockConnector>) -> NetworkManager {
        NetworkManager::with_connector(connector, test_backoff())
    }

    fn wait_for_state(manager: &NetworkManager, state: ConnectionState) {
        let deadline = Instant::now() + TIMEOUT;
        while manager.state() != state {
            assert!(
                Instant::now() < deadline,
                "state never became {}, still {}",
                state,
                manager.state()
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_backoff_delays() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_connect_success() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(Arc::clone(&connector));

        manager.connect("robot.local", 5002, 8002).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        // One control and one video connection, in that order.
        assert_eq!(connector.opened().len(), 2);
    }

    #[test]
    fn test_connect_while_connected_is_invalid_state() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(connector);

        manager.connect("robot.local", 5002, 8002).unwrap();
        let err = manager.connect("robot.local", 5002, 8002).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_retries_with_backoff_then_succeeds() {
        // Two failed attempts (one failed open each), then success.
        let connector = Arc::new(MockConnector::failing_times(2));
        let manager = manager_with(Arc::clone(&connector));

        let start = Instant::now();
        manager.connect("robot.local", 5002, 8002).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(manager.state(), ConnectionState::Connected);
        // Slept 20ms + 40ms between the three attempts.
        assert!(elapsed >= Duration::from_millis(60), "elapsed {:?}", elapsed);
        // 1 failed open per failed attempt + control and video on success.
        assert_eq!(connector.attempts(), 4);
    }

    #[test]
    fn test_connect_gives_up_after_max_attempts() {
        let connector = Arc::new(MockConnector::failing_times(usize::MAX));
        let manager = manager_with(Arc::clone(&connector));

        let start = Instant::now();
        let err = manager.connect("robot.local", 5002, 8002).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(elapsed >= Duration::from_millis(60), "elapsed {:?}", elapsed);
        assert_eq!(connector.attempts(), 3);
    }

    /// Connector whose first video-port open fails after the control open
    /// already succeeded, exercising the partial-attempt cleanup path.
    struct SplitConnector {
        inner: MockConnector,
        fail_video_once: std::sync::atomic::AtomicBool,
    }

    impl Connector for SplitConnector {
        fn open(
            &self,
            host: &str,
            port: u16,
            timeout: Duration,
        ) -> Result<Arc<dyn crate::connection::Connection>> {
            if port == DEFAULT_VIDEO_PORT
                && self
                    .fail_video_once
                    .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(Error::Connection("video port refused".to_string()));
            }
            self.inner.open(host, port, timeout)
        }
    }

    #[test]
    fn test_partial_attempt_closes_control_connection() {
        let split = Arc::new(SplitConnector {
            inner: MockConnector::new(),
            fail_video_once: std::sync::atomic::AtomicBool::new(true),
        });
        let manager =
            NetworkManager::with_connector(Arc::clone(&split) as Arc<dyn Connector>, test_backoff());

        manager.connect("robot.local", 5002, 8002).unwrap();

        // Attempt one opened a control connection that must now be closed;
        // the second attempt's pair is live.
        let opened = split.inner.opened();
        assert_eq!(opened.len(), 3);
        assert_eq!(opened[0].state(), ConnectionState::Disconnected);
        assert_eq!(opened[1].state(), ConnectionState::Connected);
        assert_eq!(opened[2].state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_twice_is_a_noop() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(connector);

        manager.connect("robot.local", 5002, 8002).unwrap();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_state_transition_sequence() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(connector);

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let transitions_clone = Arc::clone(&transitions);
        manager.on_state_changed(move |old, new| {
            transitions_clone.lock().push((old, new));
        });

        manager.connect("robot.local", 5002, 8002).unwrap();
        manager.disconnect();

        use ConnectionState::*;
        assert_eq!(
            *transitions.lock(),
            vec![
                (Disconnected, Connecting),
                (Connecting, Connected),
                (Connected, Disconnecting),
                (Disconnecting, Disconnected),
            ]
        );
    }

    #[test]
    fn test_send_command_while_disconnected_is_an_error() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(Arc::clone(&connector));

        let err = manager.send_command("CMD_MOVE#1#0#0#8#0\n").unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        // No connection was ever opened, so no I/O happened.
        assert_eq!(connector.attempts(), 0);
    }

    #[test]
    fn test_send_command_writes_to_control_connection() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(Arc::clone(&connector));

        manager.connect("robot.local", 5002, 8002).unwrap();
        manager.send_command("CMD_BUZZER#1\n").unwrap();

        let control = &connector.opened()[0];
        assert_eq!(control.written(), b"CMD_BUZZER#1\n");
    }

    #[test]
    fn test_get_video_frame_while_disconnected_is_none() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(connector);
        assert!(manager.get_video_frame(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_video_frames_flow_through_manager() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(Arc::clone(&connector));

        manager.connect("robot.local", 5002, 8002).unwrap();

        let video: &MockConnection = &connector.opened()[1];
        let mut wire = 5u32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"frame");
        video.push_read(&wire);

        let frame = manager.get_video_frame(TIMEOUT).expect("no frame");
        assert_eq!(frame, b"frame");
    }

    #[test]
    fn test_inbound_records_flow_through_manager() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(Arc::clone(&connector));

        manager.connect("robot.local", 5002, 8002).unwrap();

        let control = &connector.opened()[0];
        control.push_read(b"CMD_SONIC#27\n");

        let record = manager.recv_command(TIMEOUT).unwrap().expect("no record");
        assert_eq!(record.fields(), ["CMD_SONIC", "27"]);

        // Nothing further queued: timeout is a non-error None.
        assert!(manager.recv_command(Duration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn test_background_failure_escalates_to_error_state() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(Arc::clone(&connector));

        manager.connect("robot.local", 5002, 8002).unwrap();

        // Robot drops the control connection.
        connector.opened()[0].close_peer();
        wait_for_state(&manager, ConnectionState::Error);
    }

    #[test]
    fn test_connect_recovers_from_error_state() {
        let connector = Arc::new(MockConnector::new());
        let manager = manager_with(Arc::clone(&connector));

        manager.connect("robot.local", 5002, 8002).unwrap();
        connector.opened()[1].close_peer();
        wait_for_state(&manager, ConnectionState::Error);

        manager.connect("robot.local", 5002, 8002).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.opened().len(), 4);
    }
}
