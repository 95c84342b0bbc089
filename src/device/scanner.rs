use futures::channel::mpsc::UnboundedSender;
use indexmap::IndexMap;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::device::constants::{NAME_REQUIRES_CONNECT, UNKNOWN_DEVICE_NAME};
use crate::device::types::{ConnectionStatus, DeviceHandle, ErrorReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    Status(ConnectionStatus),
    /// The scan stopped; the status goes back to idle unless something else took over meanwhile.
    Finished,
    StartRadioScan { generation: u64 },
    StopRadioScan,
    StartTimer { generation: u64 },
    Devices(Vec<DeviceHandle>),
}

/// One advertisement as reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

/// Time-bounded discovery of peripherals that advertise `service`, deduplicated by address.
pub struct Scanner {
    service: Uuid,
    scanning: bool,
    generation: u64,
    found: IndexMap<String, DeviceHandle>,
    feed: Option<UnboundedSender<DeviceHandle>>,
}

impl Scanner {
    pub fn new(service: Uuid) -> Self {
        Scanner {
            service,
            scanning: false,
            generation: 0,
            found: IndexMap::new(),
            feed: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.found.values().cloned().collect()
    }

    pub fn device(&self, address: &str) -> Option<&DeviceHandle> {
        self.found.get(address)
    }

    /// Drops the entry of a device that has been connected to.
    pub fn forget(&mut self, address: &str) -> Vec<ScanAction> {
        match self.found.shift_remove(address) {
            Some(device) => {
                debug!("Forgetting {} ({})", device.name, device.address);
                vec![ScanAction::Devices(self.devices())]
            },
            None => vec![],
        }
    }

    /// Starts a scan session, emitting every new matching device on `feed`. Calling this while
    /// a scan is running only swaps the feed.
    pub fn start(&mut self, feed: UnboundedSender<DeviceHandle>) -> Vec<ScanAction> {
        if self.scanning {
            debug!("Scan already in progress");
            self.feed = Some(feed);
            return vec![];
        }

        info!("Starting scan for service {}", self.service);
        self.scanning = true;
        self.generation += 1;
        self.found.clear();
        self.feed = Some(feed);

        vec![
            ScanAction::Devices(vec![]),
            ScanAction::Status(ConnectionStatus::Scanning),
            ScanAction::StartRadioScan { generation: self.generation },
            ScanAction::StartTimer { generation: self.generation },
        ]
    }

    /// Stopping an inactive scanner is a no-op.
    pub fn stop(&mut self) -> Vec<ScanAction> {
        if !self.scanning {
            debug!("Scan not active or already stopped");
            return vec![];
        }

        info!("Stopping scan ({} devices found)", self.found.len());
        self.scanning = false;
        // dropping the sender ends the stream handed out by start()
        self.feed = None;

        vec![ScanAction::StopRadioScan, ScanAction::Finished]
    }

    pub fn on_timeout(&mut self, generation: u64) -> Vec<ScanAction> {
        if !self.scanning || generation != self.generation {
            return vec![];
        }

        info!("Scan window elapsed");
        self.stop()
    }

    /// The radio failed (or refused) to scan. Failures for an older scan session are ignored.
    pub fn fail(&mut self, generation: Option<u64>, reason: String) -> Vec<ScanAction> {
        if let Some(generation) = generation {
            if generation != self.generation {
                return vec![];
            }
        }

        if !self.scanning {
            return vec![];
        }

        warn!("Scan failed: {}", reason);
        self.scanning = false;
        self.feed = None;

        vec![ScanAction::Status(ConnectionStatus::Error(ErrorReason::ScanFailed(reason)))]
    }

    pub fn on_advertisement(&mut self, advertisement: Advertisement, can_read_name: bool) -> Vec<ScanAction> {
        if !self.scanning {
            return vec![];
        }

        // Some environments ignore the scan filter, so check the service uuid again
        if !advertisement.services.contains(&self.service) {
            return vec![];
        }

        let name = if can_read_name {
            advertisement.name.unwrap_or(String::from(UNKNOWN_DEVICE_NAME))
        } else {
            String::from(NAME_REQUIRES_CONNECT)
        };

        match self.found.get_mut(&advertisement.address) {
            Some(existing) => {
                if existing.name == name || name == UNKNOWN_DEVICE_NAME {
                    return vec![];
                }

                // same device, better name: replace in place, do not emit it again
                existing.name = name;
                vec![ScanAction::Devices(self.devices())]
            },
            None => {
                let device = DeviceHandle { address: advertisement.address.clone(), name };
                info!("Device found: {} ({})", device.name, device.address);

                if let Some(feed) = &self.feed {
                    if feed.unbounded_send(device.clone()).is_err() {
                        debug!("Scan feed receiver dropped");
                    }
                }

                self.found.insert(advertisement.address, device);
                vec![ScanAction::Devices(self.devices())]
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::unbounded;
    use futures::StreamExt;

    const SERVICE: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc1);
    const OTHER: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

    fn advertisement(address: &str, name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
        Advertisement { address: address.to_string(), name: name.map(String::from), services }
    }

    #[test]
    fn repeated_advertisements_yield_one_device() {
        let (tx, mut rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        let actions = scanner.start(tx);
        assert!(actions.contains(&ScanAction::Status(ConnectionStatus::Scanning)));

        for _ in 0..5 {
            scanner.on_advertisement(advertisement("AA:BB:CC:DD:EE:FF", Some("MusicBike"), vec![SERVICE]), true);
        }

        assert_eq!(scanner.devices().len(), 1);
        assert_eq!(scanner.devices()[0].address, "AA:BB:CC:DD:EE:FF");

        scanner.stop();
        let emitted: Vec<_> = futures::executor::block_on(async { rx.by_ref().collect::<Vec<_>>().await });
        assert_eq!(emitted.len(), 1);
    }

    #[test]
    fn other_services_are_filtered() {
        let (tx, _rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        scanner.start(tx);

        assert!(scanner.on_advertisement(advertisement("11:22:33:44:55:66", Some("Headphones"), vec![OTHER]), true).is_empty());
        assert!(scanner.on_advertisement(advertisement("11:22:33:44:55:67", None, vec![]), true).is_empty());
        assert!(scanner.devices().is_empty());
    }

    #[test]
    fn names_use_sentinels() {
        let (tx, _rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        scanner.start(tx);

        scanner.on_advertisement(advertisement("AA:00:00:00:00:01", None, vec![SERVICE]), true);
        scanner.on_advertisement(advertisement("AA:00:00:00:00:02", Some("Bike"), vec![SERVICE]), false);

        assert_eq!(scanner.device("AA:00:00:00:00:01").unwrap().name, UNKNOWN_DEVICE_NAME);
        assert_eq!(scanner.device("AA:00:00:00:00:02").unwrap().name, NAME_REQUIRES_CONNECT);

        // a later advertisement carrying the name replaces the entry, it is not appended
        let actions = scanner.on_advertisement(advertisement("AA:00:00:00:00:01", Some("Bike"), vec![SERVICE]), true);
        assert_eq!(actions.len(), 1);
        assert_eq!(scanner.devices().len(), 2);
        assert_eq!(scanner.device("AA:00:00:00:00:01").unwrap().name, "Bike");
    }

    #[test]
    fn new_scan_clears_previous_results() {
        let (tx, _rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        scanner.start(tx);
        scanner.on_advertisement(advertisement("AA:00:00:00:00:01", None, vec![SERVICE]), true);
        scanner.stop();

        let (tx, _rx) = unbounded();
        let actions = scanner.start(tx);
        assert_eq!(actions[0], ScanAction::Devices(vec![]));
        assert!(scanner.devices().is_empty());
    }

    #[test]
    fn stopped_scanner_emits_nothing() {
        let (tx, mut rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        scanner.start(tx);
        assert_eq!(scanner.stop(), vec![ScanAction::StopRadioScan, ScanAction::Finished]);
        assert!(scanner.stop().is_empty());

        assert!(scanner.on_advertisement(advertisement("AA:00:00:00:00:01", None, vec![SERVICE]), true).is_empty());
        assert_eq!(rx.try_next().unwrap(), None);
    }

    #[test]
    fn timeout_only_applies_to_current_session() {
        let (tx, _rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        scanner.start(tx.clone());
        scanner.stop();
        scanner.start(tx);

        assert!(scanner.on_timeout(1).is_empty());
        assert!(scanner.is_scanning());
        assert_eq!(scanner.on_timeout(2), vec![ScanAction::StopRadioScan, ScanAction::Finished]);
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn connected_device_is_forgotten() {
        let (tx, _rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        scanner.start(tx);
        scanner.on_advertisement(advertisement("AA:00:00:00:00:01", Some("Bike"), vec![SERVICE]), true);
        scanner.on_advertisement(advertisement("AA:00:00:00:00:02", Some("Other bike"), vec![SERVICE]), true);

        let remaining = vec![DeviceHandle { address: "AA:00:00:00:00:02".to_string(), name: "Other bike".to_string() }];
        assert_eq!(scanner.forget("AA:00:00:00:00:01"), vec![ScanAction::Devices(remaining.clone())]);
        assert_eq!(scanner.devices(), remaining);
        assert!(scanner.forget("AA:00:00:00:00:01").is_empty());
    }

    #[test]
    fn failure_clears_scanning_flag() {
        let (tx, _rx) = unbounded();
        let mut scanner = Scanner::new(SERVICE);
        scanner.start(tx);

        let actions = scanner.fail(Some(1), "radio off".to_string());
        assert_eq!(actions, vec![ScanAction::Status(ConnectionStatus::Error(ErrorReason::ScanFailed("radio off".to_string())))]);
        assert!(!scanner.is_scanning());
        assert!(scanner.fail(None, "again".to_string()).is_empty());
    }
}
