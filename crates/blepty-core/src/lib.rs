//! blepty-core: forwarding engine between a BLE serial module and a PTY.
//!
//! Provides the link and PTY capability traits, MTU chunking, the session
//! type, the forwarding engine state machine, and in-memory test doubles.

pub mod chunk;
pub mod engine;
pub mod error;
pub mod link;
pub mod mock;
pub mod pty;
pub mod session;

// Re-export commonly used items at crate root.
pub use chunk::{chunks, effective_mtu, DEFAULT_MTU};
pub use engine::{EngineConfig, EngineState, ForwardingEngine, ShutdownReason, DEFAULT_READ_BUFFER};
pub use error::{BridgeError, BridgeResult};
pub use link::{BleLink, LinkState, Notifications};
pub use pty::{PtyAllocator, PtyEvent, PtyMaster, PtyPort};
pub use session::Session;
