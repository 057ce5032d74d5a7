//! [`BleLink`] implementation on top of btleplug.
//!
//! Notifications from the serial characteristic are forwarded by a spawned
//! task into the channel handed to the engine. The same task watches the
//! adapter's event stream and closes the channel when the peripheral
//! disconnects, which is how the engine learns about a peer drop.

use super::{classify, parse_address, scanner};
use blepty_core::{BleLink, BridgeError, BridgeResult, LinkState, Notifications};
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the notification channel. Frames are at most one MTU each.
const NOTIFY_CAPACITY: usize = 256;

/// Where and how to reach the serial characteristic.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub characteristic: Uuid,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
}

/// A GATT connection to one serial module.
pub struct BtleLink {
    adapter: Adapter,
    settings: LinkSettings,
    state: LinkState,
    peripheral: Option<Peripheral>,
    serial: Option<Characteristic>,
    forwarder: Option<JoinHandle<()>>,
}

impl BtleLink {
    pub fn new(adapter: Adapter, settings: LinkSettings) -> Self {
        Self {
            adapter,
            settings,
            state: LinkState::Connecting,
            peripheral: None,
            serial: None,
            forwarder: None,
        }
    }

    async fn open(&self, address: &str) -> BridgeResult<(Peripheral, Characteristic)> {
        let addr = parse_address(address)?;
        let peripheral =
            scanner::find_by_address(&self.adapter, addr, self.settings.scan_timeout).await?;

        match tokio::time::timeout(self.settings.connect_timeout, peripheral.connect()).await {
            Ok(result) => result.map_err(|e| classify(e, BridgeError::Connect))?,
            Err(_) => {
                return Err(BridgeError::Connect(format!(
                    "{address}: timed out after {}s",
                    self.settings.connect_timeout.as_secs()
                )))
            }
        }

        if let Err(e) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(classify(e, BridgeError::Connect));
        }

        let wanted = self.settings.characteristic;
        let Some(serial) = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == wanted)
        else {
            let _ = peripheral.disconnect().await;
            return Err(BridgeError::Connect(format!(
                "{address} has no serial characteristic {wanted}"
            )));
        };
        debug!(uuid = %serial.uuid, properties = ?serial.properties, "serial characteristic");
        Ok((peripheral, serial))
    }

    fn connected(&self) -> Option<(&Peripheral, &Characteristic)> {
        self.peripheral.as_ref().zip(self.serial.as_ref())
    }
}

impl BleLink for BtleLink {
    async fn connect(&mut self, address: &str) -> BridgeResult<()> {
        self.state.check_connect()?;
        self.state = LinkState::Connecting;

        match self.open(address).await {
            Ok((peripheral, serial)) => {
                info!(address, "ble connected");
                self.peripheral = Some(peripheral);
                self.serial = Some(serial);
                self.state = LinkState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = LinkState::Failed;
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self) -> BridgeResult<Notifications> {
        let (peripheral, serial) = self
            .connected()
            .ok_or_else(|| BridgeError::Connect(format!("cannot subscribe, link is {}", self.state)))?;

        peripheral
            .subscribe(serial)
            .await
            .map_err(|e| classify(e, BridgeError::Connect))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| classify(e, BridgeError::Connect))?;
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| classify(e, BridgeError::Connect))?;

        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        let id = peripheral.id();
        let uuid = serial.uuid;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    n = notifications.next() => match n {
                        Some(n) if n.uuid == uuid => {
                            if tx.send(n.value).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => {
                            debug!("notification stream ended");
                            break;
                        }
                    },
                    e = events.next() => match e {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            info!("peripheral disconnected");
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        self.forwarder = Some(handle);
        debug!(%uuid, "notifications enabled");
        Ok(rx)
    }

    async fn write_characteristic(&mut self, chunk: &[u8]) -> BridgeResult<()> {
        let (peripheral, serial) = self
            .connected()
            .ok_or_else(|| BridgeError::Write(format!("link is {}", self.state)))?;

        let write_type = if serial
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        let result = peripheral.write(serial, chunk, write_type).await;
        match result {
            Ok(()) => Ok(()),
            Err(btleplug::Error::NotConnected) => {
                self.state = LinkState::Disconnected;
                Err(BridgeError::Write("peripheral not connected".into()))
            }
            Err(e) => Err(classify(e, BridgeError::Write)),
        }
    }

    async fn disconnect(&mut self) -> BridgeResult<()> {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        self.serial = None;
        let Some(peripheral) = self.peripheral.take() else {
            return Ok(());
        };
        if self.state == LinkState::Connected {
            self.state = LinkState::Disconnected;
        }

        match peripheral.disconnect().await {
            Ok(()) => {
                info!("ble disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "ble disconnect failed");
                Err(classify(e, BridgeError::Other))
            }
        }
    }

    fn mtu(&self) -> Option<usize> {
        // btleplug does not expose the negotiated ATT MTU.
        None
    }

    fn state(&self) -> LinkState {
        self.state
    }
}
