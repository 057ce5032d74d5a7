//! btleplug-backed BLE access: adapter selection, scanning, the serial link.

pub mod link;
pub mod scanner;

pub use link::{BtleLink, LinkSettings};

use blepty_core::{BridgeError, BridgeResult};
use btleplug::api::{BDAddr, Central, Manager as _};
use btleplug::platform::{Adapter, Manager};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// Serial characteristic of JNHuaMao (HM-10 style) modules, used for both
/// notifications and writes.
pub const SERIAL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

const PRIVILEGE_HINT: &str = "raw BLE access requires root, or grant the binary \
     capabilities with `sudo setcap 'cap_net_raw,cap_net_admin+eip' $(which blepty)`";

/// Map a btleplug error onto the bridge taxonomy.
///
/// Permission and lookup failures keep their own variants so the process can
/// report them with a distinct exit status; everything else goes through
/// `fallback`.
pub fn classify(err: btleplug::Error, fallback: fn(String) -> BridgeError) -> BridgeError {
    match err {
        btleplug::Error::PermissionDenied => BridgeError::PermissionDenied(PRIVILEGE_HINT.into()),
        btleplug::Error::DeviceNotFound => BridgeError::DeviceNotFound("peripheral vanished".into()),
        other => fallback(other.to_string()),
    }
}

/// Open the bluetooth adapter at `index` (0 is the first one the OS lists).
pub async fn open_adapter(index: usize) -> BridgeResult<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|e| classify(e, BridgeError::Adapter))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| classify(e, BridgeError::Adapter))?;
    let count = adapters.len();
    let adapter = adapters.into_iter().nth(index).ok_or_else(|| {
        BridgeError::Adapter(format!(
            "no bluetooth adapter at index {index} ({count} available)"
        ))
    })?;

    if let Ok(info) = adapter.adapter_info().await {
        debug!(index, adapter = %info, "using adapter");
    }
    Ok(adapter)
}

/// Parse a MAC-style address such as `00:0E:0B:03:05:FA`.
pub fn parse_address(address: &str) -> BridgeResult<BDAddr> {
    BDAddr::from_str(address.trim())
        .map_err(|e| BridgeError::InvalidAddress(format!("{address}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_separated_address() {
        let addr = parse_address("00:0E:0B:03:05:FA").unwrap();
        assert_eq!(addr.to_string().to_uppercase(), "00:0E:0B:03:05:FA");
    }

    #[test]
    fn rejects_garbage_address() {
        let err = parse_address("not-a-mac").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAddress(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn permission_denied_carries_hint() {
        let err = classify(btleplug::Error::PermissionDenied, BridgeError::Adapter);
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
        assert!(err.to_string().contains("setcap"));
    }

    #[test]
    fn other_errors_use_fallback() {
        let err = classify(btleplug::Error::NotConnected, BridgeError::Write);
        assert!(matches!(err, BridgeError::Write(_)));
    }

    #[test]
    fn serial_characteristic_is_ffe1() {
        assert_eq!(
            SERIAL_CHARACTERISTIC.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }
}
