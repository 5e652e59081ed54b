//! [`BleCentral`] backed by the host Bluetooth stack through btleplug.
//!
//! | Platform | Stack | Advertisement address |
//! |---|---|---|
//! | Linux | BlueZ (D-Bus) | real MAC |
//! | Windows | WinRT | real MAC |
//! | macOS | CoreBluetooth | none: CoreBluetooth hides MACs, so discovery by address never matches |

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, Service,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::central::{AdvertisementCallback, BleCentral, NotificationSink, ScanStop};
use crate::error::BleError;
use crate::types::Advertisement;

/// A connected peripheral.
#[derive(Clone, Debug)]
pub struct BtleDevice {
    /// The address the device was connected by.
    pub address: String,
    peripheral: Peripheral,
}

/// A discovered GATT service on a connected peripheral.
#[derive(Clone, Debug)]
pub struct BtleService {
    peripheral: Peripheral,
    service: Service,
}

/// A discovered GATT characteristic on a connected peripheral.
#[derive(Clone, Debug)]
pub struct BtleCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl BtleCharacteristic {
    pub fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }
}

/// The first Bluetooth adapter of the host.
pub struct BtleplugCentral {
    adapter: OnceLock<Adapter>,
    scan: ScanStop,
    discover_timeout: Duration,
}

impl Default for BtleplugCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl BtleplugCentral {
    pub fn new() -> Self {
        Self {
            adapter: OnceLock::new(),
            scan: ScanStop::default(),
            discover_timeout: Duration::from_secs(15),
        }
    }

    fn adapter(&self) -> Result<&Adapter, BleError> {
        self.adapter.get().ok_or(BleError::AdapterNotEnabled)
    }

    /// Look up a peripheral the adapter has already seen by MAC address.
    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, BleError> {
        for p in self.adapter()?.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Ok(p);
                }
            }
        }
        Err(BleError::UnknownDevice(address.to_owned()))
    }
}

fn advertisement_from(props: &PeripheralProperties) -> Advertisement {
    let address = if props.address.into_inner() == [0; 6] {
        None
    } else {
        Some(props.address.to_string())
    };
    Advertisement {
        address,
        local_name: props.local_name.clone(),
        rssi: props.rssi,
        services: props.services.clone(),
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    type Device = BtleDevice;
    type Service = BtleService;
    type Characteristic = BtleCharacteristic;

    async fn enable_adapter(&self) -> Result<(), BleError> {
        if self.adapter.get().is_some() {
            return Ok(());
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleError::NoAdapter)?;

        // ── macOS: wait for the CoreBluetooth manager to reach poweredOn ─────
        // CBCentralManager starts in an "unknown" state; scanning before it
        // reports PoweredOn is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                            break;
                        }
                        debug!("macOS: adapter state = {state:?}, waiting…");
                    }
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        if let Ok(info) = adapter.adapter_info().await {
            info!("using adapter {info}");
        }
        // A concurrent call may have won; either adapter is fine.
        let _ = self.adapter.set(adapter);
        Ok(())
    }

    async fn scan(&self, on_advertisement: AdvertisementCallback) -> Result<(), BleError> {
        // Registered first: discovery calls stop_scan even after a failed scan.
        let Some(stop) = self.scan.begin() else {
            return Ok(());
        };
        let adapter = self.adapter()?.clone();

        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        debug!("scan started");

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let Ok(peripheral) = adapter.peripheral(&id).await else {
                continue;
            };
            if let Ok(Some(props)) = peripheral.properties().await {
                on_advertisement(advertisement_from(&props));
            }
        }

        debug!("scan loop finished");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scan.stop();
        self.adapter()?.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<BtleDevice, BleError> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral.connect().await?;

        // BlueZ reports the connection before the remote GATT cache is
        // populated; discovering too early returns an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        info!("connected to {address}");
        Ok(BtleDevice {
            address: address.to_owned(),
            peripheral,
        })
    }

    async fn disconnect(&self, device: &BtleDevice) -> Result<(), BleError> {
        device.peripheral.disconnect().await?;
        debug!("disconnected from {}", device.address);
        Ok(())
    }

    async fn discover_services(
        &self,
        device: &BtleDevice,
        uuids: &[Uuid],
    ) -> Result<Vec<BtleService>, BleError> {
        let timeout = self.discover_timeout;
        tokio::time::timeout(timeout, device.peripheral.discover_services())
            .await
            .map_err(|_| BleError::Timeout {
                operation: "discover_services",
                timeout,
            })??;

        let services = device.peripheral.services();
        Ok(uuids
            .iter()
            .filter_map(|uuid| services.iter().find(|s| s.uuid == *uuid))
            .map(|service| BtleService {
                peripheral: device.peripheral.clone(),
                service: service.clone(),
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        service: &BtleService,
        uuids: &[Uuid],
    ) -> Result<Vec<BtleCharacteristic>, BleError> {
        Ok(uuids
            .iter()
            .filter_map(|uuid| {
                service
                    .service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == *uuid)
            })
            .map(|c| BtleCharacteristic {
                peripheral: service.peripheral.clone(),
                characteristic: c.clone(),
            })
            .collect())
    }

    async fn enable_notifications(
        &self,
        characteristic: &BtleCharacteristic,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<(), BleError> {
        let peripheral = characteristic.peripheral.clone();
        let uuid = characteristic.characteristic.uuid;
        peripheral.subscribe(&characteristic.characteristic).await?;
        let mut notifications = peripheral.notifications().await?;

        // ── Disconnect watcher ──────────────────────────────────────────────
        // The adapter's DeviceDisconnected event usually fires before the
        // notification stream notices the link is gone.
        let adapter = self.adapter()?.clone();
        let peripheral_id = peripheral.id();
        let watcher_sink = Arc::clone(&sink);
        let watcher = tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("disconnect watcher: device {id:?} disconnected");
                                watcher_sink.closed();
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("disconnect watcher: could not subscribe to adapter events: {e}");
                }
            }
        });

        // ── Notification pump ────────────────────────────────────────────────
        tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(notif) = notifications.next().await {
                if notif.uuid != uuid {
                    continue;
                }
                count += 1;
                if count <= 3 || count % 500 == 0 {
                    debug!("notif #{count} uuid={uuid} len={}", notif.value.len());
                }
                sink.notify(&notif.value).await;
            }
            info!("notification stream ended after {count} notification(s)");
            sink.closed();
            watcher.abort();
        });

        Ok(())
    }
}
