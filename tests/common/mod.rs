//! Scripted [`BleCentral`] double shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulseox_rs::central::{AdvertisementCallback, BleCentral, NotificationSink};
use pulseox_rs::error::BleError;
use pulseox_rs::protocol::{RX_CHARACTERISTIC, TRANSPARENT_UART_SERVICE, TX_CHARACTERISTIC};
use pulseox_rs::types::Advertisement;
use tokio::sync::Notify;
use uuid::Uuid;

pub const TARGET: &str = "00:A0:50:C8:E7:31";

/// One valid frame: signal 4, pleth 61, bar 3, pulse 72, SpO2 97.
pub const FRAME: [u8; 5] = [0x84, 61, 3, 72, 97];

/// Every scan replays `adverts` synchronously from inside `scan`, then waits
/// for `stop_scan`.  Connected targets expose the UART service; notifications
/// replay `payloads` once.
#[derive(Default)]
pub struct MockCentral {
    pub adverts: Mutex<Vec<Advertisement>>,
    pub payloads: Mutex<Vec<Vec<u8>>>,
    /// Call `closed()` on the sink right after replaying `payloads`.
    pub close_after_payloads: AtomicBool,
    /// Number of upcoming `enable_adapter` calls that fail.
    pub enable_failures: AtomicUsize,
    pub fail_scan: AtomicBool,
    pub fail_connect: AtomicBool,
    pub missing_rx: AtomicBool,
    /// Time `discover_services` takes.
    pub discovery_delay: Mutex<Duration>,

    pub enables: AtomicUsize,
    pub scans: AtomicUsize,
    pub stop_scans: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,

    stop: Notify,
    sinks: Mutex<Vec<Arc<dyn NotificationSink>>>,
}

impl MockCentral {
    pub fn advertising(addresses: &[&str]) -> Arc<Self> {
        let mock = Self::default();
        *mock.adverts.lock().unwrap() = addresses
            .iter()
            .map(|a| Advertisement::with_address(*a))
            .collect();
        Arc::new(mock)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    type Device = String;
    type Service = Uuid;
    type Characteristic = Uuid;

    async fn enable_adapter(&self) -> Result<(), BleError> {
        self.enables.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .enable_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(BleError::NoAdapter)
        } else {
            Ok(())
        }
    }

    async fn scan(&self, on_advertisement: AdvertisementCallback) -> Result<(), BleError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(BleError::Other("radio busy".into()));
        }
        let adverts = self.adverts.lock().unwrap().clone();
        for adv in adverts {
            on_advertisement(adv);
        }
        self.stop.notified().await;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.stop_scans.fetch_add(1, Ordering::SeqCst);
        self.stop.notify_one();
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<String, BleError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BleError::UnknownDevice(address.to_owned()));
        }
        Ok(address.to_owned())
    }

    async fn disconnect(&self, _device: &String) -> Result<(), BleError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        for sink in self.sinks.lock().unwrap().drain(..) {
            sink.closed();
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        _device: &String,
        uuids: &[Uuid],
    ) -> Result<Vec<Uuid>, BleError> {
        let delay = *self.discovery_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(uuids
            .iter()
            .copied()
            .filter(|u| *u == TRANSPARENT_UART_SERVICE)
            .collect())
    }

    async fn discover_characteristics(
        &self,
        _service: &Uuid,
        uuids: &[Uuid],
    ) -> Result<Vec<Uuid>, BleError> {
        let missing_rx = self.missing_rx.load(Ordering::SeqCst);
        Ok(uuids
            .iter()
            .copied()
            .filter(|u| *u == TX_CHARACTERISTIC || (*u == RX_CHARACTERISTIC && !missing_rx))
            .collect())
    }

    async fn enable_notifications(
        &self,
        _characteristic: &Uuid,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<(), BleError> {
        self.sinks.lock().unwrap().push(Arc::clone(&sink));
        let payloads = self.payloads.lock().unwrap().clone();
        let close = self.close_after_payloads.load(Ordering::SeqCst);
        tokio::spawn(async move {
            for payload in payloads {
                sink.notify(&payload).await;
            }
            if close {
                sink.closed();
            }
        });
        Ok(())
    }
}
