//! Device discovery: timed scans, lookup by address or advertised name, and
//! characteristic listing.

use super::classify;
use blepty_core::{BridgeError, BridgeResult};
use btleplug::api::{BDAddr, Central, Characteristic, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between peripheral list polls while waiting for a target.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// What a scan learned about one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub address: BDAddr,
    pub rssi: Option<i16>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name: {}, address: {}",
            self.name.as_deref().unwrap_or("(unknown)"),
            self.address
        )?;
        if let Some(rssi) = self.rssi {
            write!(f, ", rssi: {rssi} dBm")?;
        }
        Ok(())
    }
}

/// A scanned device together with its handle.
pub struct Discovered {
    pub info: DeviceInfo,
    pub peripheral: Peripheral,
}

/// Scan for `window` and return everything seen, ordered by address.
pub async fn scan(adapter: &Adapter, window: Duration) -> BridgeResult<Vec<Discovered>> {
    info!(seconds = window.as_secs_f32(), "scanning");
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| classify(e, BridgeError::Adapter))?;
    tokio::time::sleep(window).await;

    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| classify(e, BridgeError::Adapter));
    if let Err(e) = adapter.stop_scan().await {
        warn!(error = %e, "failed to stop scan");
    }

    let mut found = Vec::new();
    for peripheral in peripherals? {
        let props = match peripheral.properties().await {
            Ok(props) => props,
            Err(e) => {
                debug!(error = %e, "skipping peripheral without properties");
                continue;
            }
        };
        let info = DeviceInfo {
            name: props.as_ref().and_then(|p| p.local_name.clone()),
            address: peripheral.address(),
            rssi: props.as_ref().and_then(|p| p.rssi),
        };
        found.push(Discovered { info, peripheral });
    }
    found.sort_by_key(|d| d.info.address.to_string());
    debug!(count = found.len(), "scan finished");
    Ok(found)
}

/// Scan until a peripheral with `address` shows up or `window` elapses.
pub async fn find_by_address(
    adapter: &Adapter,
    address: BDAddr,
    window: Duration,
) -> BridgeResult<Peripheral> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| classify(e, BridgeError::Adapter))?;

    let deadline = tokio::time::Instant::now() + window;
    let result = loop {
        let peripherals = match adapter.peripherals().await {
            Ok(p) => p,
            Err(e) => break Err(classify(e, BridgeError::Adapter)),
        };
        if let Some(p) = peripherals.into_iter().find(|p| p.address() == address) {
            debug!(%address, "peripheral found");
            break Ok(p);
        }
        if tokio::time::Instant::now() >= deadline {
            break Err(BridgeError::DeviceNotFound(format!(
                "{address} not seen within {}s",
                window.as_secs()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    if let Err(e) = adapter.stop_scan().await {
        warn!(error = %e, "failed to stop scan");
    }
    result
}

/// Pick the single device advertising `name`.
pub fn resolve_name<'a>(
    devices: impl IntoIterator<Item = &'a DeviceInfo>,
    name: &str,
) -> BridgeResult<BDAddr> {
    let matches: Vec<&DeviceInfo> = devices
        .into_iter()
        .filter(|d| d.name.as_deref() == Some(name))
        .collect();
    match matches.as_slice() {
        [] => Err(BridgeError::DeviceNotFound(format!(
            "no matching devices found for '{name}'"
        ))),
        [only] => Ok(only.address),
        many => Err(BridgeError::DeviceNotFound(format!(
            "multiple matching devices found for '{name}': {}",
            many.iter()
                .map(|d| d.address.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Connect briefly and list the peripheral's characteristics.
pub async fn characteristics(
    peripheral: &Peripheral,
    connect_timeout: Duration,
) -> BridgeResult<Vec<Characteristic>> {
    match tokio::time::timeout(connect_timeout, peripheral.connect()).await {
        Ok(result) => result.map_err(|e| classify(e, BridgeError::Connect))?,
        Err(_) => {
            return Err(BridgeError::Connect(format!(
                "timed out after {}s",
                connect_timeout.as_secs()
            )))
        }
    }

    let discovered = peripheral
        .discover_services()
        .await
        .map_err(|e| classify(e, BridgeError::Connect));
    let chars = peripheral.characteristics().into_iter().collect();
    if let Err(e) = peripheral.disconnect().await {
        debug!(error = %e, "disconnect after characteristic listing");
    }
    discovered?;
    Ok(chars)
}
