//! An in-memory `Transport` driven by a script, for tests and for running the driver without a
//! radio. Every call is recorded, and GATT operations on the connection are checked to never
//! overlap.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::debug;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::device::constants::MUSIC_BIKE_SERVICE;
use crate::device::transport::{Transport, TransportEvent};
use crate::device::types::{CharProps, CharacteristicId, GattCharacteristic, GattService};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(Uuid),
    StopScan,
    Connect(String),
    Discover(String),
    EnableLocal(String, Uuid),
    WriteDescriptor(String, Uuid, Uuid, Vec<u8>),
    Write(String, Uuid, Vec<u8>),
    Disconnect(String),
}

/// How the scripted peripheral behaves.
#[derive(Debug, Clone)]
pub struct Script {
    pub services: Vec<GattService>,
    /// connect() to these addresses never completes
    pub hold_connect: HashSet<String>,
    pub fail_connect: Option<String>,
    pub fail_discover: Option<String>,
    pub fail_scan: Option<String>,
    pub fail_local: HashSet<Uuid>,
    pub fail_descriptor: HashSet<Uuid>,
    /// emit LinkDown after a disconnect, like most platforms do
    pub link_down_on_disconnect: bool,
    pub latency: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            services: music_bike_services(&CharacteristicId::all()),
            hold_connect: HashSet::new(),
            fail_connect: None,
            fail_discover: None,
            fail_scan: None,
            fail_local: HashSet::new(),
            fail_descriptor: HashSet::new(),
            link_down_on_disconnect: true,
            latency: Duration::from_millis(5),
        }
    }
}

/// The Music Bike service exposing `ids`, with the properties the firmware declares.
pub fn music_bike_services(ids: &[CharacteristicId]) -> Vec<GattService> {
    let characteristics = ids.iter().map(|id| {
        let properties = if id.is_notify() {
            CharProps { notify: true, ..CharProps::default() }
        } else {
            CharProps { write: true, ..CharProps::default() }
        };
        GattCharacteristic { uuid: id.uuid(), properties }
    }).collect();

    vec![GattService { uuid: MUSIC_BIKE_SERVICE, characteristics }]
}

pub struct ScriptedTransport {
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    gatt_active: AtomicUsize,
    gatt_max: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Arc<Self> {
        let (events_tx, events_rx) = unbounded();

        Arc::new(ScriptedTransport {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            gatt_active: AtomicUsize::new(0),
            gatt_max: AtomicUsize::new(0),
        })
    }

    pub fn edit_script<F: FnOnce(&mut Script)>(&self, edit: F) {
        edit(&mut self.script.lock().expect("Failed to lock script"));
    }

    pub fn inject(&self, event: TransportEvent) {
        if self.events_tx.unbounded_send(event).is_err() {
            debug!("Scripted event dropped: driver is gone");
        }
    }

    pub fn advertise(&self, address: &str, name: Option<&str>) {
        self.inject(TransportEvent::Advertisement {
            address: address.to_string(),
            name: name.map(String::from),
            services: vec![MUSIC_BIKE_SERVICE],
        });
    }

    pub fn notify(&self, address: &str, id: CharacteristicId, value: &[u8]) {
        self.inject(TransportEvent::Notification {
            address: address.to_string(),
            uuid: id.uuid(),
            value: value.to_vec(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("Failed to lock calls").clone()
    }

    /// The highest number of GATT operations that were ever running at the same time.
    pub fn max_concurrent_gatt(&self) -> usize {
        self.gatt_max.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) -> Script {
        self.calls.lock().expect("Failed to lock calls").push(call);
        self.script.lock().expect("Failed to lock script").clone()
    }

    async fn gatt_operation(&self, latency: Duration) {
        let active = self.gatt_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gatt_max.fetch_max(active, Ordering::SeqCst);
        sleep(latency).await;
        self.gatt_active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn failure(reason: &str) -> DeviceError {
    DeviceError::Btle { source: btleplug::Error::Other(reason.to_string().into()) }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>, DeviceError> {
        let receiver = self.events_rx.lock().expect("Failed to lock events").take();
        match receiver {
            Some(receiver) => Ok(receiver.boxed()),
            None => Err(failure("events() already taken")),
        }
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), DeviceError> {
        let script = self.record(Call::StartScan(service));
        match script.fail_scan {
            Some(reason) => Err(failure(&reason)),
            None => Ok(()),
        }
    }

    async fn stop_scan(&self) -> Result<(), DeviceError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<(), DeviceError> {
        let script = self.record(Call::Connect(address.to_string()));
        if script.hold_connect.contains(address) {
            futures::future::pending::<()>().await;
        }

        sleep(script.latency).await;
        match script.fail_connect {
            Some(reason) => Err(failure(&reason)),
            None => Ok(()),
        }
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<GattService>, DeviceError> {
        let script = self.record(Call::Discover(address.to_string()));
        sleep(script.latency).await;
        match script.fail_discover {
            Some(reason) => Err(failure(&reason)),
            None => Ok(script.services),
        }
    }

    async fn enable_local_notifications(&self, address: &str, characteristic: Uuid) -> Result<(), DeviceError> {
        let script = self.record(Call::EnableLocal(address.to_string(), characteristic));
        self.gatt_operation(Duration::ZERO).await;
        if script.fail_local.contains(&characteristic) {
            return Err(DeviceError::MissingCharacteristic);
        }
        Ok(())
    }

    async fn write_descriptor(&self, address: &str, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<(), DeviceError> {
        let script = self.record(Call::WriteDescriptor(address.to_string(), characteristic, descriptor, value.to_vec()));
        self.gatt_operation(script.latency).await;
        if script.fail_descriptor.contains(&characteristic) {
            return Err(failure("descriptor write failed"));
        }
        Ok(())
    }

    async fn write(&self, address: &str, characteristic: Uuid, value: &[u8]) -> Result<(), DeviceError> {
        let script = self.record(Call::Write(address.to_string(), characteristic, value.to_vec()));
        self.gatt_operation(script.latency).await;
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), DeviceError> {
        let script = self.record(Call::Disconnect(address.to_string()));
        if script.link_down_on_disconnect {
            self.inject(TransportEvent::LinkDown { address: address.to_string() });
        }
        Ok(())
    }
}
