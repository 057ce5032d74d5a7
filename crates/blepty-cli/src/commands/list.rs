//! `blepty list`: scan and print nearby devices.
//!
//! With `--characteristics` each device is connected in turn and its GATT
//! characteristics are printed beneath it; devices that refuse the
//! connection are reported and skipped.

use anyhow::{Context, Result};
use btleplug::api::Characteristic;
use tracing::warn;

use crate::ble::{self, scanner};
use crate::config::BridgeConfig;

/// Scan for the configured window and print what was seen.
pub async fn run(cfg: &BridgeConfig, with_characteristics: bool) -> Result<()> {
    let adapter = ble::open_adapter(cfg.adapter)
        .await
        .context("failed to open bluetooth adapter")?;
    let found = scanner::scan(&adapter, cfg.scan_timeout)
        .await
        .context("scan failed")?;

    if found.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Devices");
    for device in &found {
        println!("  {}", device.info);
        if !with_characteristics {
            continue;
        }
        match scanner::characteristics(&device.peripheral, cfg.connect_timeout).await {
            Ok(chars) => {
                for c in &chars {
                    println!("    {}", describe(c));
                }
            }
            Err(e) => {
                warn!(address = %device.info.address, error = %e, "cannot read characteristics");
                println!("    (characteristics unavailable: {e})");
            }
        }
    }
    println!("\n{} device(s) found.", found.len());

    Ok(())
}

fn describe(c: &Characteristic) -> String {
    let marker = if c.uuid == ble::SERIAL_CHARACTERISTIC {
        "  [serial]"
    } else {
        ""
    };
    format!(
        "uuid: {}, service: {}, properties: {:?}{marker}",
        c.uuid, c.service_uuid, c.properties
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::CharPropFlags;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    #[test]
    fn marks_the_serial_characteristic() {
        let c = Characteristic {
            uuid: ble::SERIAL_CHARACTERISTIC,
            service_uuid: Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb),
            properties: CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE,
            descriptors: BTreeSet::new(),
        };
        let line = describe(&c);
        assert!(line.starts_with("uuid: 0000ffe1-"));
        assert!(line.contains("service: 0000ffe0-"));
        assert!(line.ends_with("[serial]"));
    }
}
