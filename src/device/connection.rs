use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{
    CLIENT_CHARACTERISTIC_CONFIGURATION, CONNECT_DEADLINE, ENABLE_NOTIFICATION_VALUE, EVENT_HOLD,
    MUSIC_BIKE_SERVICE, SCAN_PERIOD,
};
use crate::device::debouncer::EventDebouncer;
use crate::device::machine::{Action, ConnectionStateMachine, Generation, SessionEvent};
use crate::device::queue::GattOperation;
use crate::device::scanner::{Advertisement, ScanAction, Scanner};
use crate::device::signals::Signals;
use crate::device::transport::{CapabilityCheck, Transport, TransportEvent};
use crate::device::types::{Capability, ConnectionStatus, DeviceHandle, ErrorReason, MotionEvent, Telemetry};
use crate::error::DeviceError;

/// Timing knobs of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    pub scan_period: Duration,
    pub event_hold: Duration,
    /// `None` waits for the radio forever
    pub connect_timeout: Option<Duration>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        DriverSettings {
            scan_period: Duration::from_millis(SCAN_PERIOD),
            event_hold: Duration::from_millis(EVENT_HOLD),
            connect_timeout: Some(Duration::from_millis(CONNECT_DEADLINE)),
        }
    }
}

struct CoreState {
    machine: ConnectionStateMachine,
    scanner: Scanner,
}

struct Shared {
    runtime: Handle,
    transport: Arc<dyn Transport>,
    capabilities: Box<dyn CapabilityCheck>,
    settings: DriverSettings,
    core: Mutex<CoreState>,
    // connect attempts still waiting on the radio, by session generation
    attempts: Mutex<HashMap<Generation, CancellationToken>>,
    status: watch::Sender<ConnectionStatus>,
    devices: watch::Sender<Vec<DeviceHandle>>,
    signals: Signals,
    debouncer: EventDebouncer,
    cancel: CancellationToken,
}

/// The Music Bike client. Cheap to clone; every clone drives the same connection.
///
/// Commands never block: they apply an input to the state machine and return. Progress is
/// reported on the status feed and the telemetry signals.
#[derive(Clone)]
pub struct MusicBike {
    shared: Arc<Shared>,
}

impl MusicBike {
    /// Takes the transport's event stream and starts pumping it. Must be called from within a
    /// tokio runtime.
    pub async fn start<T, C>(transport: Arc<T>, capabilities: C, settings: DriverSettings) -> Result<MusicBike, DeviceError>
    where
        T: Transport,
        C: CapabilityCheck,
    {
        let transport: Arc<dyn Transport> = transport;
        let events = transport.events().await?;
        let runtime = Handle::current();
        let signals = Signals::new();
        let debouncer = EventDebouncer::new(settings.event_hold, signals.last_event.clone(), runtime.clone());
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        let (devices, _) = watch::channel(Vec::new());

        let shared = Arc::new(Shared {
            runtime,
            transport,
            capabilities: Box::new(capabilities),
            settings,
            core: Mutex::new(CoreState {
                machine: ConnectionStateMachine::new(),
                scanner: Scanner::new(MUSIC_BIKE_SERVICE),
            }),
            attempts: Mutex::new(HashMap::new()),
            status,
            devices,
            signals,
            debouncer,
            cancel: CancellationToken::new(),
        });

        shared.runtime.spawn(pump_transport_events(shared.cancel.child_token(), Arc::downgrade(&shared), events));

        Ok(MusicBike { shared })
    }

    /// Starts a scan window. Matching devices are sent on the returned stream, once per
    /// address; the stream ends when the scan stops.
    pub fn start_scan(&self) -> UnboundedReceiver<DeviceHandle> {
        let (feed, devices) = unbounded();

        let mut core = self.shared.lock();
        if !self.shared.require(&core, &[Capability::RadioEnabled, Capability::Scan]) {
            return devices;
        }

        let actions = core.scanner.start(feed);
        self.shared.dispatch_scan(&mut core, actions);
        devices
    }

    pub fn stop_scan(&self) {
        let mut core = self.shared.lock();
        let actions = core.scanner.stop();
        self.shared.dispatch_scan(&mut core, actions);
    }

    /// Returns `false` when the request was refused: a missing capability, or a session with
    /// the same address that is already live.
    pub fn connect(&self, address: &str) -> bool {
        let mut core = self.shared.lock();
        if !self.shared.require(&core, &[Capability::RadioEnabled, Capability::Connect]) {
            return false;
        }

        let scan_actions = core.scanner.stop();
        self.shared.dispatch_scan(&mut core, scan_actions);

        match core.machine.connect(address) {
            Some(actions) => {
                self.shared.dispatch(&mut core, actions);
                true
            },
            None => false,
        }
    }

    pub fn disconnect(&self) {
        let mut core = self.shared.lock();
        let actions = core.machine.disconnect();
        self.shared.dispatch(&mut core, actions);
    }

    pub fn zero_accelerometer(&self) -> bool {
        let mut core = self.shared.lock();
        if !self.shared.require(&core, &[Capability::RadioEnabled, Capability::Connect]) {
            return false;
        }

        match core.machine.zero_accelerometer() {
            Some(actions) => {
                self.shared.dispatch(&mut core, actions);
                true
            },
            None => false,
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// The devices found by the current (or last) scan. Every update replaces the whole list.
    pub fn devices(&self) -> watch::Receiver<Vec<DeviceHandle>> {
        self.shared.devices.subscribe()
    }

    pub fn signals(&self) -> &Signals {
        &self.shared.signals
    }

    pub fn current_event(&self) -> MotionEvent {
        self.shared.debouncer.current_value()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().machine.is_ready()
    }

    /// True once every queued write (such as a zero command) has completed.
    pub fn is_settled(&self) -> bool {
        self.shared.lock().machine.is_settled()
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.lock().scanner.is_scanning()
    }

    pub fn connected_address(&self) -> Option<String> {
        self.shared.lock().machine.address().map(String::from)
    }

    /// Stops scanning, starts a disconnect and stops listening to the transport. Completions of
    /// operations that are already running are still applied.
    pub fn shutdown(&self) {
        {
            let mut core = self.shared.lock();
            let scan_actions = core.scanner.stop();
            self.shared.dispatch_scan(&mut core, scan_actions);
            let actions = core.machine.disconnect();
            self.shared.dispatch(&mut core, actions);
        }

        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, CoreState> {
        self.core.lock().expect("Failed to lock driver state")
    }

    fn require(&self, core: &CoreState, capabilities: &[Capability]) -> bool {
        for capability in capabilities {
            if !self.capabilities.has(*capability) {
                warn!("Request refused: missing {}", capability);
                self.publish_idle_status(core, ConnectionStatus::Error(ErrorReason::CapabilityMissing(*capability)));
                return false;
            }
        }

        true
    }

    // A live session owns the status feed; statuses that do not come from it are only logged.
    fn publish_idle_status(&self, core: &CoreState, status: ConnectionStatus) {
        match core.machine.status() {
            None => self.publish_status(status),
            Some(session) => debug!("Keeping status {:?} over {:?}", session, status),
        }
    }

    fn publish_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });

        if changed {
            info!("Status: {}", *self.status.borrow());
        }
    }

    fn handle(self: &Arc<Self>, event: SessionEvent) {
        let mut core = self.lock();
        let actions = core.machine.handle(event);
        self.dispatch(&mut core, actions);
    }

    // Called with the core lock held so that statuses come out in the order they were decided.
    fn dispatch_scan(self: &Arc<Self>, core: &mut CoreState, actions: Vec<ScanAction>) {
        for action in actions {
            match action {
                ScanAction::Status(status) => self.publish_idle_status(core, status),
                ScanAction::Finished => match core.machine.status() {
                    Some(session) => self.publish_status(session),
                    None => {
                        self.status.send_if_modified(|current| {
                            if *current != ConnectionStatus::Scanning {
                                return false;
                            }
                            *current = ConnectionStatus::Idle;
                            true
                        });
                    },
                },
                ScanAction::Devices(devices) => {
                    self.devices.send_replace(devices);
                },
                ScanAction::StartRadioScan { generation } => {
                    let shared = self.clone();
                    self.runtime.spawn(async move {
                        if let Err(err) = shared.transport.start_scan(MUSIC_BIKE_SERVICE).await {
                            let reason = if err.is_permission_error() {
                                String::from("permission denied")
                            } else {
                                err.to_string()
                            };

                            let mut core = shared.lock();
                            let actions = core.scanner.fail(Some(generation), reason);
                            shared.dispatch_scan(&mut core, actions);
                        }
                    });
                },
                ScanAction::StopRadioScan => {
                    let shared = self.clone();
                    self.runtime.spawn(async move {
                        if let Err(err) = shared.transport.stop_scan().await {
                            warn!("Stopping the radio scan failed: {}", err);
                        }
                    });
                },
                ScanAction::StartTimer { generation } => {
                    let shared = self.clone();
                    let cancel = self.cancel.child_token();
                    self.runtime.spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {},
                            _ = sleep(shared.settings.scan_period) => {
                                let mut core = shared.lock();
                                let actions = core.scanner.on_timeout(generation);
                                shared.dispatch_scan(&mut core, actions);
                            },
                        }
                    });
                },
            }
        }
    }

    // Same locking rule as dispatch_scan.
    fn dispatch(self: &Arc<Self>, core: &mut CoreState, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Status(status) => {
                    if status == ConnectionStatus::Ready {
                        // the device is connected now, it is no longer a scan result
                        if let Some(address) = core.machine.address().map(String::from) {
                            let scan_actions = core.scanner.forget(&address);
                            self.dispatch_scan(core, scan_actions);
                        }
                    }
                    self.publish_status(status);
                },
                Action::Publish(Telemetry::Event(event)) => self.debouncer.on_event(event),
                Action::Publish(telemetry) => self.signals.apply(telemetry),
                Action::Connect { generation, address } => {
                    let shared = self.clone();
                    let cancel = self.cancel.child_token();
                    self.attempts.lock().expect("Failed to lock connect attempts").insert(generation, cancel.clone());

                    self.runtime.spawn(async move {
                        let result = tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!("Connect attempt {} to {} abandoned", generation, address);
                                return;
                            },
                            result = shared.transport.connect(&address) => result.map_err(|err| err.to_string()),
                        };

                        shared.attempts.lock().expect("Failed to lock connect attempts").remove(&generation);
                        shared.handle(SessionEvent::ConnectResult { generation, address, result });
                    });
                },
                Action::Discover { generation, address } => {
                    let shared = self.clone();
                    self.runtime.spawn(async move {
                        let result = shared.transport.discover_services(&address).await.map_err(|err| err.to_string());
                        shared.handle(SessionEvent::Discovered { generation, result });
                    });
                },
                Action::Run { generation, address, ticket, operation } => {
                    let shared = self.clone();
                    self.runtime.spawn(async move {
                        let result = run_operation(shared.transport.as_ref(), &address, &operation).await;
                        if let Err(reason) = &result {
                            warn!("{:?} failed: {}", operation, reason);
                        }
                        shared.handle(SessionEvent::OperationComplete { generation, ticket, result });
                    });
                },
                Action::Disconnect { generation, address } => {
                    self.abandon_attempt(generation);
                    let shared = self.clone();
                    self.runtime.spawn(async move {
                        // releasing a link that is already gone is not an error worth reporting
                        if let Err(err) = shared.transport.disconnect(&address).await {
                            debug!("Disconnecting {} failed: {}", address, err);
                        }
                        shared.handle(SessionEvent::DisconnectComplete { generation });
                    });
                },
                Action::StartConnectTimer { generation } => {
                    if let Some(timeout) = self.settings.connect_timeout {
                        let shared = self.clone();
                        let cancel = self.cancel.child_token();
                        self.runtime.spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {},
                                _ = sleep(timeout) => shared.handle(SessionEvent::ConnectTimedOut { generation }),
                            }
                        });
                    }
                },
            }
        }
    }

    fn abandon_attempt(&self, generation: Generation) {
        let attempt = self.attempts.lock().expect("Failed to lock connect attempts").remove(&generation);
        if let Some(cancel) = attempt {
            cancel.cancel();
        }
    }

    #[cfg(test)]
    fn pending_attempts(&self) -> usize {
        self.attempts.lock().expect("Failed to lock connect attempts").len()
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement { address, name, services } => {
                let can_read_name = self.capabilities.has(Capability::Connect);
                let mut core = self.lock();
                let actions = core.scanner.on_advertisement(Advertisement { address, name, services }, can_read_name);
                self.dispatch_scan(&mut core, actions);
            },
            TransportEvent::Notification { address, uuid, value } => {
                self.handle(SessionEvent::Notification { address, uuid, value });
            },
            TransportEvent::LinkDown { address } => {
                self.handle(SessionEvent::LinkDown { address });
            },
            TransportEvent::LinkError { address, reason } => {
                self.handle(SessionEvent::LinkError { address, reason });
            },
            TransportEvent::AdapterError { reason } => {
                warn!("Adapter error: {}", reason);
                let mut core = self.lock();
                let actions = core.scanner.fail(None, reason);
                self.dispatch_scan(&mut core, actions);
            },
        }
    }
}

/// One notify-enable handshake (local delivery, then the CCCD write) or one plain write.
async fn run_operation(transport: &dyn Transport, address: &str, operation: &GattOperation) -> Result<(), String> {
    match operation {
        GattOperation::EnableNotifications(id) => {
            debug!("Enabling notifications for {}", id);
            transport.enable_local_notifications(address, id.uuid()).await
                .map_err(|err| err.to_string())?;
            transport.write_descriptor(address, id.uuid(), CLIENT_CHARACTERISTIC_CONFIGURATION, &ENABLE_NOTIFICATION_VALUE).await
                .map_err(|err| err.to_string())
        },
        GattOperation::Write { id, value } => {
            debug!("Writing {:?} to {}", value, id);
            transport.write(address, id.uuid(), value).await
                .map_err(|err| err.to_string())
        },
    }
}

// Forwards the transport feed one event at a time, so per-characteristic wire order is kept.
async fn pump_transport_events(
    cancel: CancellationToken,
    shared: Weak<Shared>,
    mut events: futures::stream::BoxStream<'static, TransportEvent>,
) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = events.next() => match event {
                None => {
                    info!("Transport event stream ended");
                    break 'mainloop;
                },
                Some(event) => match shared.upgrade() {
                    Some(shared) => shared.on_transport_event(event),
                    None => break 'mainloop,
                },
            },
        }
    }

    debug!("Transport event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::scripted::{music_bike_services, Call, Script, ScriptedTransport};
    use crate::device::transport::AllowAll;
    use crate::device::types::CharacteristicId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::timeout;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const OTHER_ADDRESS: &str = "11:22:33:44:55:66";

    async fn start(script: Script) -> (Arc<ScriptedTransport>, MusicBike) {
        let transport = ScriptedTransport::new(script);
        let driver = MusicBike::start(transport.clone(), AllowAll, DriverSettings::default()).await.unwrap();
        (transport, driver)
    }

    async fn wait_for_status(driver: &MusicBike, expected: ConnectionStatus) {
        let mut status = driver.status();
        timeout(Duration::from_secs(60), status.wait_for(|status| *status == expected))
            .await
            .expect("timed out waiting for status")
            .expect("status feed closed");
    }

    async fn wait_for_call(transport: &ScriptedTransport, call: Call) {
        for _ in 0..1000 {
            if transport.calls().contains(&call) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("{:?} was never issued", call);
    }

    fn descriptor_writes(transport: &ScriptedTransport) -> Vec<Call> {
        transport.calls().into_iter().filter(|call| matches!(call, Call::WriteDescriptor(..))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_runs_one_operation_at_a_time() {
        let (transport, driver) = start(Script::default()).await;

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        assert_eq!(transport.max_concurrent_gatt(), 1);

        let expected: Vec<Call> = CharacteristicId::all().into_iter()
            .filter(|id| id.is_notify())
            .map(|id| Call::WriteDescriptor(ADDRESS.to_string(), id.uuid(), CLIENT_CHARACTERISTIC_CONFIGURATION, ENABLE_NOTIFICATION_VALUE.to_vec()))
            .collect();
        assert_eq!(descriptor_writes(&transport), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_every_completion_even_failed_ones() {
        let ids = [
            CharacteristicId::Speed,
            CharacteristicId::Pitch,
            CharacteristicId::Roll,
            CharacteristicId::Yaw,
            CharacteristicId::GForce,
        ];
        let mut script = Script::default();
        script.services = music_bike_services(&ids);
        script.fail_local.insert(CharacteristicId::Roll.uuid());
        script.fail_descriptor.insert(CharacteristicId::Pitch.uuid());
        let (transport, driver) = start(script).await;

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        let local = transport.calls().into_iter().filter(|call| matches!(call, Call::EnableLocal(..))).count();
        assert_eq!(local, 5);
        // the characteristic that failed locally never got its descriptor written
        assert_eq!(descriptor_writes(&transport).len(), 4);
        assert!(driver.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_service_is_fatal() {
        let mut script = Script::default();
        script.services = vec![];
        let (transport, driver) = start(script).await;

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Error(ErrorReason::ServiceNotFound)).await;
        wait_for_call(&transport, Call::Disconnect(ADDRESS.to_string())).await;
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_is_decoded_and_published() {
        let (transport, driver) = start(Script::default()).await;
        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        let mut speed = driver.signals().speed.subscribe();
        transport.notify(ADDRESS, CharacteristicId::Speed, &[0x00, 0x00, 0x80, 0x3F]);
        timeout(Duration::from_secs(1), speed.wait_for(|sample| sample.value == 1.0)).await.unwrap().unwrap();

        let mut direction = driver.signals().hall_direction.subscribe();
        transport.notify(ADDRESS, CharacteristicId::HallDirection, &[1]);
        timeout(Duration::from_secs(1), direction.wait_for(|sample| sample.value == 1)).await.unwrap().unwrap();
        assert!(driver.signals().hall_direction.latest().at.is_some());

        // a malformed frame leaves the previous value in place
        transport.notify(ADDRESS, CharacteristicId::Speed, &[0x00, 0x00, 0x80]);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.signals().speed.value(), 1.0);
        assert!(driver.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn events_pulse_and_clear() {
        let (transport, driver) = start(Script::default()).await;
        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        let mut last_event = driver.signals().last_event.subscribe();
        transport.notify(ADDRESS, CharacteristicId::Event, &[1]);
        timeout(Duration::from_secs(1), last_event.wait_for(|sample| sample.value == MotionEvent::Jump)).await.unwrap().unwrap();
        assert_eq!(driver.current_event(), MotionEvent::Jump);

        // unknown codes do not touch the pulse
        transport.notify(ADDRESS, CharacteristicId::Event, &[7]);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(driver.current_event(), MotionEvent::Jump);

        sleep(Duration::from_millis(3_000)).await;
        assert_eq!(driver.current_event(), MotionEvent::None);
        assert_eq!(driver.signals().last_event.value(), MotionEvent::None);
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_elsewhere_tears_down_the_pending_attempt() {
        let mut script = Script::default();
        script.hold_connect.insert(ADDRESS.to_string());
        let (transport, driver) = start(script).await;

        assert!(driver.connect(ADDRESS));
        assert!(!driver.connect(ADDRESS));
        assert!(driver.connect(OTHER_ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        assert_eq!(driver.connected_address().as_deref(), Some(OTHER_ADDRESS));
        // the held attempt to the first address was cancelled, not left running
        assert_eq!(driver.shared.pending_attempts(), 0);
        let calls = transport.calls();
        assert!(calls.contains(&Call::Disconnect(ADDRESS.to_string())));
        assert!(calls.contains(&Call::Connect(OTHER_ADDRESS.to_string())));
        assert!(!calls.iter().any(|call| matches!(call, Call::Discover(address) if address == ADDRESS)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_gives_up() {
        let mut script = Script::default();
        script.hold_connect.insert(ADDRESS.to_string());
        let (transport, driver) = start(script).await;

        assert!(driver.connect(ADDRESS));
        sleep(Duration::from_millis(CONNECT_DEADLINE + 100)).await;

        assert_eq!(driver.current_status(), ConnectionStatus::Error(ErrorReason::ConnectTimeout));
        wait_for_call(&transport, Call::Disconnect(ADDRESS.to_string())).await;
        assert_eq!(driver.shared.pending_attempts(), 0);
        // a new attempt is allowed after the failure
        assert!(driver.connect(ADDRESS));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_can_be_retried() {
        let mut script = Script::default();
        script.fail_connect = Some("status 133".to_string());
        let (transport, driver) = start(script).await;

        assert!(driver.connect(ADDRESS));
        let mut status = driver.status();
        timeout(Duration::from_secs(1), status.wait_for(|status| matches!(status, ConnectionStatus::Error(ErrorReason::Transport(_)))))
            .await
            .unwrap()
            .unwrap();
        wait_for_call(&transport, Call::Disconnect(ADDRESS.to_string())).await;
        sleep(Duration::from_millis(50)).await;

        transport.edit_script(|script| script.fail_connect = None);
        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_failure_is_service_not_found() {
        let mut script = Script::default();
        script.fail_discover = Some("GATT 129".to_string());
        let (transport, driver) = start(script).await;

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Error(ErrorReason::ServiceNotFound)).await;
        wait_for_call(&transport, Call::Disconnect(ADDRESS.to_string())).await;
        assert!(!transport.calls().iter().any(|call| matches!(call, Call::EnableLocal(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_settles_on_disconnected() {
        let (transport, driver) = start(Script::default()).await;
        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        transport.inject(TransportEvent::LinkDown { address: ADDRESS.to_string() });
        wait_for_status(&driver, ConnectionStatus::Disconnected).await;
        assert_eq!(driver.connected_address(), None);

        let connects = transport.calls().into_iter().filter(|call| matches!(call, Call::Connect(_))).count();
        assert_eq!(connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_always_safe() {
        let (_transport, driver) = start(Script::default()).await;
        driver.disconnect();
        assert_eq!(driver.current_status(), ConnectionStatus::Disconnected);

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;
        driver.disconnect();
        driver.disconnect();
        wait_for_status(&driver, ConnectionStatus::Disconnected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_accelerometer_writes_once_ready() {
        let (transport, driver) = start(Script::default()).await;
        assert!(!driver.zero_accelerometer());

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;
        assert!(driver.zero_accelerometer());

        wait_for_call(&transport, Call::Write(ADDRESS.to_string(), CharacteristicId::AccelerometerZero.uuid(), vec![0x01])).await;
        assert_eq!(transport.max_concurrent_gatt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_deduplicates_and_filters() {
        let (transport, driver) = start(Script::default()).await;
        let mut found = driver.start_scan();
        assert_eq!(driver.current_status(), ConnectionStatus::Scanning);

        for _ in 0..4 {
            transport.advertise(ADDRESS, Some("Music Bike"));
        }
        transport.inject(TransportEvent::Advertisement {
            address: OTHER_ADDRESS.to_string(),
            name: Some("Headphones".to_string()),
            services: vec![],
        });
        sleep(Duration::from_millis(100)).await;
        driver.stop_scan();

        let emitted: Vec<DeviceHandle> = timeout(Duration::from_secs(1), found.by_ref().collect::<Vec<_>>()).await.unwrap();
        assert_eq!(emitted, vec![DeviceHandle { address: ADDRESS.to_string(), name: "Music Bike".to_string() }]);
        assert_eq!(driver.devices().borrow().len(), 1);
        assert_eq!(driver.current_status(), ConnectionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_stops_after_its_window() {
        let (transport, driver) = start(Script::default()).await;
        let _found = driver.start_scan();

        sleep(Duration::from_millis(SCAN_PERIOD + 100)).await;
        assert!(!driver.is_scanning());
        assert_eq!(driver.current_status(), ConnectionStatus::Idle);
        assert!(transport.calls().contains(&Call::StopScan));

        // stopping again is a no-op
        driver.stop_scan();
        assert_eq!(transport.calls().iter().filter(|call| **call == Call::StopScan).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_stops_the_scan() {
        let (transport, driver) = start(Script::default()).await;
        let _found = driver.start_scan();
        assert!(driver.connect(ADDRESS));
        assert!(!driver.is_scanning());
        wait_for_status(&driver, ConnectionStatus::Ready).await;
        assert!(transport.calls().contains(&Call::StopScan));
    }

    #[tokio::test(start_paused = true)]
    async fn scanning_while_ready_keeps_the_session_status() {
        let (transport, driver) = start(Script::default()).await;
        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        let _found = driver.start_scan();
        assert!(driver.is_scanning());
        assert_eq!(driver.current_status(), ConnectionStatus::Ready);

        sleep(Duration::from_millis(SCAN_PERIOD + 100)).await;
        assert!(!driver.is_scanning());
        assert!(driver.is_ready());
        assert_eq!(driver.current_status(), ConnectionStatus::Ready);

        // telemetry keeps flowing through the whole scan window
        transport.notify(ADDRESS, CharacteristicId::Yaw, &2.0f32.to_le_bytes());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.signals().yaw.value(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_request_keeps_the_session_status() {
        let scan_allowed = Arc::new(AtomicBool::new(true));
        let allowed = scan_allowed.clone();
        let transport = ScriptedTransport::new(Script::default());
        let driver = MusicBike::start(
            transport.clone(),
            move |capability: Capability| capability != Capability::Scan || allowed.load(Ordering::SeqCst),
            DriverSettings::default(),
        ).await.unwrap();

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        scan_allowed.store(false, Ordering::SeqCst);
        let mut found = driver.start_scan();
        assert_eq!(timeout(Duration::from_secs(1), found.next()).await.unwrap(), None);
        assert_eq!(driver.current_status(), ConnectionStatus::Ready);

        // without a session the refusal is what the feed reports
        driver.disconnect();
        wait_for_status(&driver, ConnectionStatus::Disconnected).await;
        let _found = driver.start_scan();
        assert_eq!(driver.current_status(), ConnectionStatus::Error(ErrorReason::CapabilityMissing(Capability::Scan)));
    }

    #[tokio::test(start_paused = true)]
    async fn connected_device_leaves_the_device_list() {
        let (transport, driver) = start(Script::default()).await;
        let _found = driver.start_scan();
        transport.advertise(ADDRESS, Some("Music Bike"));
        transport.advertise(OTHER_ADDRESS, Some("Music Bike 2"));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.devices().borrow().len(), 2);

        assert!(driver.connect(ADDRESS));
        wait_for_status(&driver, ConnectionStatus::Ready).await;

        let devices = driver.devices().borrow().clone();
        assert_eq!(devices, vec![DeviceHandle { address: OTHER_ADDRESS.to_string(), name: "Music Bike 2".to_string() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn radio_scan_failure_is_reported() {
        let mut script = Script::default();
        script.fail_scan = Some("radio off".to_string());
        let (_transport, driver) = start(script).await;

        let _found = driver.start_scan();
        let mut status = driver.status();
        timeout(Duration::from_secs(1), status.wait_for(|status| matches!(status, ConnectionStatus::Error(ErrorReason::ScanFailed(_)))))
            .await
            .unwrap()
            .unwrap();
        assert!(!driver.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_capabilities_block_requests() {
        let transport = ScriptedTransport::new(Script::default());
        let driver = MusicBike::start(transport.clone(), |capability: Capability| capability != Capability::Connect, DriverSettings::default())
            .await
            .unwrap();

        assert!(!driver.connect(ADDRESS));
        assert_eq!(driver.current_status(), ConnectionStatus::Error(ErrorReason::CapabilityMissing(Capability::Connect)));
        assert!(transport.calls().is_empty());

        // scanning still works, but names are withheld
        let mut found = driver.start_scan();
        transport.advertise(ADDRESS, Some("Music Bike"));
        let device = timeout(Duration::from_secs(1), found.next()).await.unwrap().unwrap();
        assert_eq!(device.name, crate::device::constants::NAME_REQUIRES_CONNECT);
    }
}
