//! BLE link capability consumed by the forwarding engine.
//!
//! The engine never talks to a Bluetooth stack directly. It drives anything
//! implementing [`BleLink`]: the btleplug adapter in the CLI, or the in-memory
//! mock used by the tests.

use crate::error::{BridgeError, BridgeResult};
use std::fmt;
use tokio::sync::mpsc;

/// Connection state of a BLE link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl LinkState {
    /// Whether `connect` may be attempted from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Failed)
    }

    /// Reject a connect attempt on a link that is live or already torn down.
    pub fn check_connect(self) -> BridgeResult<()> {
        if self.can_connect() {
            Ok(())
        } else {
            Err(BridgeError::Connect(format!("link is {self}")))
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Receiving end of the notification channel.
///
/// Every notification from the serial characteristic arrives as one `Vec<u8>`,
/// in the order the stack delivered it. The channel closes when the peer drops.
pub type Notifications = mpsc::Receiver<Vec<u8>>;

/// A GATT connection to a serial-profile module.
#[allow(async_fn_in_trait)]
pub trait BleLink {
    /// Connect to the peripheral at `address` (MAC style, `AA:BB:CC:DD:EE:FF`).
    async fn connect(&mut self, address: &str) -> BridgeResult<()>;

    /// Enable notifications on the serial characteristic.
    async fn subscribe(&mut self) -> BridgeResult<Notifications>;

    /// Write a single chunk, no larger than the MTU, to the peripheral.
    async fn write_characteristic(&mut self, chunk: &[u8]) -> BridgeResult<()>;

    /// Release the connection. Calling it twice is harmless.
    async fn disconnect(&mut self) -> BridgeResult<()>;

    /// Negotiated payload MTU, if the stack reports one.
    fn mtu(&self) -> Option<usize>;

    /// Current connection state.
    fn state(&self) -> LinkState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_allowed_only_before_success() {
        assert!(LinkState::Connecting.can_connect());
        assert!(LinkState::Failed.can_connect());
        assert!(!LinkState::Connected.can_connect());
        assert!(!LinkState::Disconnected.can_connect());
    }

    #[test]
    fn rejected_connect_names_state() {
        let err = LinkState::Connected.check_connect().unwrap_err();
        assert_eq!(err.to_string(), "ble connect failed: link is connected");
    }
}
