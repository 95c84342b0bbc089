use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{CLIENT_CHARACTERISTIC_CONFIGURATION, ENABLE_NOTIFICATION_VALUE};
use crate::device::transport::{Transport, TransportEvent};
use crate::device::types::{CharProps, GattCharacteristic, GattService};
use crate::error::DeviceError;

// Peripherals the adapter has reported, by the address string handed out to the driver.
#[derive(Default)]
struct Registry {
    peripherals: Mutex<HashMap<String, Peripheral>>,
    addresses: Mutex<HashMap<PeripheralId, String>>,
}

impl Registry {
    fn insert(&self, address: String, peripheral: Peripheral) {
        self.addresses.lock().expect("Failed to lock registry").insert(peripheral.id(), address.clone());
        self.peripherals.lock().expect("Failed to lock registry").insert(address, peripheral);
    }

    fn get(&self, address: &str) -> Option<Peripheral> {
        self.peripherals.lock().expect("Failed to lock registry").get(address).cloned()
    }

    fn address_of(&self, id: &PeripheralId) -> Option<String> {
        self.addresses.lock().expect("Failed to lock registry").get(id).cloned()
    }
}

fn peripheral_address(peripheral: &Peripheral, properties: &PeripheralProperties) -> String {
    // macOS does not expose the MAC address, the platform id is the stable key there
    if properties.address.into_inner() != [0u8; 6] {
        properties.address.to_string()
    } else {
        format!("{:?}", peripheral.id())
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, DeviceError> {
    peripheral.characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or(DeviceError::MissingCharacteristic)
}

fn char_props(flags: CharPropFlags) -> CharProps {
    CharProps {
        notify: flags.contains(CharPropFlags::NOTIFY),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}

async fn report_advertisement(adapter: &Adapter, registry: &Registry, events: &UnboundedSender<TransportEvent>, id: &PeripheralId) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            warn!("Failed to query BLE adapter for peripheral: {}", err);
            return;
        },
    };

    match peripheral.properties().await {
        Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
        Ok(None) => debug!("Peripheral has no properties"),
        Ok(Some(properties)) => {
            let address = peripheral_address(&peripheral, &properties);
            registry.insert(address.clone(), peripheral);

            let event = TransportEvent::Advertisement {
                address,
                name: properties.local_name,
                services: properties.services,
            };
            if events.unbounded_send(event).is_err() {
                debug!("Transport event receiver dropped");
            }
        },
    }
}

async fn central_events_task(
    cancel: CancellationToken,
    adapter: Adapter,
    registry: Arc<Registry>,
    events: UnboundedSender<TransportEvent>,
) {
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = events.unbounded_send(TransportEvent::AdapterError { reason: err.to_string() });
            return;
        },
    };

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => match event {
                None => {
                    warn!("Adapter event stream ended");
                    let _ = events.unbounded_send(TransportEvent::AdapterError { reason: String::from("adapter event stream ended") });
                    break 'mainloop;
                },
                Some(CentralEvent::DeviceDiscovered(id))
                | Some(CentralEvent::DeviceUpdated(id))
                | Some(CentralEvent::ServicesAdvertisement { id, .. }) => {
                    report_advertisement(&adapter, &registry, &events, &id).await;
                },
                Some(CentralEvent::DeviceDisconnected(id)) => {
                    if let Some(address) = registry.address_of(&id) {
                        debug!("Peripheral {} disconnected", address);
                        let _ = events.unbounded_send(TransportEvent::LinkDown { address });
                    }
                },
                Some(_) => {},
            },
        }
    }
}

/// `Transport` on top of the first btleplug adapter.
pub struct BtleTransport {
    // keeps the platform manager alive for as long as the adapter is used
    _manager: Manager,
    adapter: Adapter,
    registry: Arc<Registry>,
    forwarders: Mutex<HashMap<String, CancellationToken>>,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    cancel: CancellationToken,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let (events_tx, events_rx) = unbounded();
        let registry = Arc::new(Registry::default());
        let cancel = CancellationToken::new();

        spawn(central_events_task(cancel.child_token(), adapter.clone(), registry.clone(), events_tx.clone()));

        Ok(BtleTransport {
            _manager: manager,
            adapter,
            registry,
            forwarders: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel,
        })
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral, DeviceError> {
        if let Some(peripheral) = self.registry.get(address) {
            return Ok(peripheral);
        }

        // not seen during this run (e.g. a remembered address): ask the adapter directly
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                let candidate = peripheral_address(&peripheral, &properties);
                self.registry.insert(candidate.clone(), peripheral.clone());
                if candidate == address {
                    return Ok(peripheral);
                }
            }
        }

        Err(DeviceError::UnknownPeripheral(address.to_string()))
    }

    fn stop_forwarding(&self, address: &str) {
        if let Some(token) = self.forwarders.lock().expect("Failed to lock forwarders").remove(address) {
            token.cancel();
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>, DeviceError> {
        let receiver = self.events_rx.lock().expect("Failed to lock events").take();
        receiver.map(|receiver| receiver.boxed()).ok_or(DeviceError::NoAdapter)
    }

    async fn start_scan(&self, service: Uuid) -> Result<(), DeviceError> {
        let filter = ScanFilter {
            services: vec![service],
        };

        info!("Scanning for service {}", service);
        self.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), DeviceError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(address).await?;
        info!("Connecting to peripheral {}...", address);
        peripheral.connect().await?;
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<Vec<GattService>, DeviceError> {
        let peripheral = self.peripheral(address).await?;
        info!("Connected; Discovering services...");
        peripheral.discover_services().await?;

        let services = peripheral.services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics
                    .into_iter()
                    .map(|characteristic| GattCharacteristic {
                        uuid: characteristic.uuid,
                        properties: char_props(characteristic.properties),
                    })
                    .collect(),
            })
            .collect();

        Ok(services)
    }

    async fn enable_local_notifications(&self, address: &str, characteristic: Uuid) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(address).await?;
        find_characteristic(&peripheral, characteristic)?;

        if self.forwarders.lock().expect("Failed to lock forwarders").contains_key(address) {
            return Ok(());
        }

        // one stream per peripheral carries the notifications of every subscribed characteristic
        let mut notification_stream = peripheral.notifications().await?;
        let cancel = self.cancel.child_token();
        let events = self.events_tx.clone();
        let address_clone = address.to_string();
        self.forwarders.lock().expect("Failed to lock forwarders").insert(address.to_string(), cancel.clone());

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    data = notification_stream.next() => match data {
                        Some(data) => {
                            let event = TransportEvent::Notification {
                                address: address_clone.clone(),
                                uuid: data.uuid,
                                value: data.value,
                            };
                            if events.unbounded_send(event).is_err() {
                                break 'mainloop;
                            }
                        },
                        None => break 'mainloop,
                    },
                }
            }
            debug!("Stopped forwarding notifications of {}", address_clone);
        });

        Ok(())
    }

    async fn write_descriptor(&self, address: &str, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = find_characteristic(&peripheral, characteristic)?;

        if descriptor == CLIENT_CHARACTERISTIC_CONFIGURATION && value == &ENABLE_NOTIFICATION_VALUE[..] {
            // some platforms refuse direct CCCD writes; subscribe() performs the same write
            debug!("Subscribing to characteristic {:?} {:?}", characteristic.service_uuid, characteristic.uuid);
            peripheral.subscribe(&characteristic).await?;
            return Ok(());
        }

        let descriptor = characteristic.descriptors
            .iter()
            .find(|candidate| candidate.uuid == descriptor)
            .ok_or(DeviceError::MissingCharacteristic)?;
        peripheral.write_descriptor(descriptor, value).await?;
        Ok(())
    }

    async fn write(&self, address: &str, characteristic: Uuid, value: &[u8]) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = find_characteristic(&peripheral, characteristic)?;

        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        peripheral.write(&characteristic, value, write_type).await?;
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), DeviceError> {
        self.stop_forwarding(address);

        let peripheral = match self.registry.get(address) {
            Some(peripheral) => peripheral,
            None => return Ok(()),
        };

        // also cancels a connection that is still being established
        match peripheral.disconnect().await {
            Ok(()) | Err(btleplug::Error::NotConnected) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
