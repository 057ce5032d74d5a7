//! The single bridge session of a process.

use crate::link::{BleLink, LinkState, Notifications};
use crate::pty::PtyMaster;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// A connected link and an allocated PTY, ready to relay.
///
/// Built by [`ForwardingEngine::establish`](crate::ForwardingEngine::establish)
/// and consumed by [`ForwardingEngine::run`](crate::ForwardingEngine::run).
pub struct Session<L> {
    pub(crate) link: L,
    pub(crate) pty: PtyMaster,
    pub(crate) notifications: Notifications,
    pub(crate) mtu: usize,
    /// Running flag shared by both relays. Cancelled means stop.
    pub(crate) running: CancellationToken,
}

impl<L: BleLink> Session<L> {
    /// Path a serial client should open.
    pub fn slave_path(&self) -> &Path {
        self.pty.slave_path()
    }

    /// Chunk size used for PTY→BLE writes.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_cancelled()
    }
}
