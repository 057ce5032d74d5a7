//! The forwarding engine: couples a BLE serial characteristic to a PTY master.
//!
//! Lifecycle is an explicit state machine:
//!
//! ```text
//! Idle -> Connecting -> Running -> ShuttingDown -> Terminated
//!              \______________________________________/
//!                        (setup failure)
//! ```
//!
//! [`ForwardingEngine::establish`] performs setup (BLE connect and subscribe
//! first, PTY allocation second) and [`ForwardingEngine::run`] relays bytes in
//! both directions until one side goes away or the stop token is cancelled.

use crate::chunk::{chunks, effective_mtu};
use crate::error::{BridgeError, BridgeResult};
use crate::link::{BleLink, Notifications};
use crate::pty::{PtyAllocator, PtyEvent, PtyMaster};
use crate::session::Session;
use std::cell::Cell;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default number of bytes taken from the PTY master per read.
pub const DEFAULT_READ_BUFFER: usize = 1024;

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunk size override. `None` uses the link's MTU or the 20 byte default.
    pub mtu: Option<usize>,
    /// Upper bound of a single PTY master read.
    pub read_buffer: usize,
    /// Extra attempts after a failed characteristic write.
    pub write_retries: u32,
    /// Pause between write attempts.
    pub retry_delay: Duration,
    /// Pause between consecutive chunk writes, for modules that drop
    /// back-to-back write-without-response packets.
    pub write_interval: Duration,
    /// Capacity of the channels between the PTY threads and the relays.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: None,
            read_buffer: DEFAULT_READ_BUFFER,
            write_retries: 3,
            retry_delay: Duration::from_millis(20),
            write_interval: Duration::ZERO,
            channel_capacity: 64,
        }
    }
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Connecting,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Connecting => "connecting",
            EngineState::Running => "running",
            EngineState::ShuttingDown => "shutting-down",
            EngineState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Why a running session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The serial client closed the slave.
    PtyClosed,
    /// The peripheral dropped the connection.
    PeerDisconnected,
    /// The stop token was cancelled.
    Stopped,
    /// Reading or writing the PTY master failed.
    PtyFailed,
    /// A chunk could not be written within the retry budget.
    WriteFailed,
}

impl ShutdownReason {
    /// Whether the process should exit with status 0.
    pub fn is_clean(self) -> bool {
        matches!(
            self,
            ShutdownReason::PtyClosed | ShutdownReason::PeerDisconnected | ShutdownReason::Stopped
        )
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownReason::PtyClosed => "pty closed",
            ShutdownReason::PeerDisconnected => "peer disconnected",
            ShutdownReason::Stopped => "stopped",
            ShutdownReason::PtyFailed => "pty i/o failed",
            ShutdownReason::WriteFailed => "ble write failed",
        };
        f.write_str(s)
    }
}

/// Drives one bridge session from setup to teardown.
pub struct ForwardingEngine {
    config: EngineConfig,
    state: watch::Sender<EngineState>,
    stop: CancellationToken,
}

impl ForwardingEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            config,
            state,
            stop: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Token that stops the session when cancelled (e.g. on SIGTERM).
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn transition(&self, next: EngineState) {
        let prev = self.state.send_replace(next);
        debug!(from = %prev, to = %next, "engine state");
    }

    /// Move Running → ShuttingDown. Only the first caller wins, and only its
    /// reason is reported.
    fn begin_shutdown(&self, reason: Option<ShutdownReason>) -> bool {
        let moved = self.state.send_if_modified(|s| {
            if *s == EngineState::Running {
                *s = EngineState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if moved {
            let reason = reason.unwrap_or(ShutdownReason::Stopped);
            info!(%reason, "shutting down");
        }
        moved
    }

    /// Connect `link` to `address`, subscribe, then allocate a PTY.
    ///
    /// The PTY is only requested once the link is up, so a failed connect
    /// leaves nothing behind. A failed allocation disconnects the link.
    pub async fn establish<L: BleLink>(
        &self,
        mut link: L,
        address: &str,
        allocator: &dyn PtyAllocator,
    ) -> BridgeResult<Session<L>> {
        self.transition(EngineState::Connecting);
        info!(address, "connecting");

        if let Err(e) = link.connect(address).await {
            warn!(address, error = %e, "connect failed");
            self.transition(EngineState::Terminated);
            return Err(e);
        }

        let notifications = match link.subscribe().await {
            Ok(n) => n,
            Err(e) => return Err(self.abort_setup(&mut link, e).await),
        };

        let port = match allocator.open() {
            Ok(p) => p,
            Err(e) => return Err(self.abort_setup(&mut link, e).await),
        };

        let pty = match PtyMaster::attach(
            port,
            self.config.read_buffer,
            self.config.channel_capacity,
        ) {
            Ok(p) => p,
            Err(e) => return Err(self.abort_setup(&mut link, e).await),
        };

        let mtu = effective_mtu(self.config.mtu, link.mtu());
        info!(address, mtu, path = %pty.slave_path().display(), "session established");
        self.transition(EngineState::Running);

        Ok(Session {
            link,
            pty,
            notifications,
            mtu,
            running: self.stop.clone(),
        })
    }

    async fn abort_setup<L: BleLink>(&self, link: &mut L, err: BridgeError) -> BridgeError {
        warn!(error = %err, "setup failed, releasing link");
        if let Err(e) = link.disconnect().await {
            warn!(error = %e, "disconnect after failed setup");
        }
        self.transition(EngineState::Terminated);
        err
    }

    /// Relay until either side ends or the stop token fires, then tear down.
    pub async fn run<L: BleLink>(&self, session: Session<L>) -> ShutdownReason {
        let Session {
            mut link,
            pty,
            mut notifications,
            mtu,
            running,
        } = session;
        let (mut pty_events, pty_input, port) = pty.into_parts();
        debug!(mtu, "relay started");

        let first = Cell::new(None);
        let finish = |reason: Option<ShutdownReason>| {
            if self.begin_shutdown(reason) {
                first.set(reason);
            }
            running.cancel();
        };
        let uplink = async {
            finish(self.pty_to_ble(&mut link, &mut pty_events, mtu, &running).await);
        };
        let downlink = async {
            finish(ble_to_pty(&mut notifications, &pty_input, &running).await);
        };
        tokio::join!(uplink, downlink);
        let reason = first.get().unwrap_or(ShutdownReason::Stopped);

        if let Err(e) = link.disconnect().await {
            warn!(error = %e, "ble disconnect failed");
        }
        drop(pty_input);
        drop(pty_events);
        drop(port);

        self.transition(EngineState::Terminated);
        info!(%reason, "session terminated");
        reason
    }

    /// PTY master → characteristic writes. `None` means the stop token fired.
    async fn pty_to_ble<L: BleLink>(
        &self,
        link: &mut L,
        events: &mut mpsc::Receiver<PtyEvent>,
        mtu: usize,
        running: &CancellationToken,
    ) -> Option<ShutdownReason> {
        loop {
            let event = tokio::select! {
                biased;
                _ = running.cancelled() => return None,
                event = events.recv() => event,
            };

            match event {
                Some(PtyEvent::Data(data)) => {
                    trace!(len = data.len(), data = %hex::encode(&data), "pty -> ble");
                    let mut first = true;
                    for chunk in chunks(&data, mtu) {
                        if !first
                            && !self.config.write_interval.is_zero()
                            && !pause(self.config.write_interval, running).await
                        {
                            return None;
                        }
                        first = false;
                        match self.write_with_retry(link, chunk, running).await {
                            Ok(true) => {}
                            Ok(false) => return None,
                            Err(e) => {
                                warn!(
                                    error = %e,
                                    retries = self.config.write_retries,
                                    "giving up on ble write"
                                );
                                return Some(ShutdownReason::WriteFailed);
                            }
                        }
                    }
                }
                Some(PtyEvent::Eof) | None => {
                    info!("pty slave closed");
                    return Some(ShutdownReason::PtyClosed);
                }
                Some(PtyEvent::Failed(e)) => {
                    warn!(error = %e, "pty i/o failed");
                    return Some(ShutdownReason::PtyFailed);
                }
            }
        }
    }

    /// Write one chunk, retrying up to `write_retries` extra times.
    ///
    /// `Ok(false)` means the stop token fired before the chunk went out.
    async fn write_with_retry<L: BleLink>(
        &self,
        link: &mut L,
        chunk: &[u8],
        running: &CancellationToken,
    ) -> BridgeResult<bool> {
        let mut attempt = 0;
        loop {
            match link.write_characteristic(chunk).await {
                Ok(()) => return Ok(true),
                Err(e) if attempt < self.config.write_retries => {
                    attempt += 1;
                    debug!(
                        attempt,
                        max = self.config.write_retries,
                        error = %e,
                        "ble write failed, retrying"
                    );
                    if !pause(self.config.retry_delay, running).await {
                        debug!(attempt, "stop requested, abandoning write");
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sleep for `delay` unless the stop token fires first. Returns false if it did.
async fn pause(delay: Duration, running: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = running.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Notifications → PTY master. `None` means the stop token fired.
async fn ble_to_pty(
    notifications: &mut Notifications,
    input: &mpsc::Sender<Vec<u8>>,
    running: &CancellationToken,
) -> Option<ShutdownReason> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = running.cancelled() => return None,
            frame = notifications.recv() => frame,
        };

        let Some(frame) = frame else {
            info!("ble peer disconnected");
            return Some(ShutdownReason::PeerDisconnected);
        };
        trace!(len = frame.len(), data = %hex::encode(&frame), "ble -> pty");

        tokio::select! {
            biased;
            _ = running.cancelled() => return None,
            sent = input.send(frame) => {
                if sent.is_err() {
                    warn!("pty writer is gone");
                    return Some(ShutdownReason::PtyFailed);
                }
            }
        }
    }
}
