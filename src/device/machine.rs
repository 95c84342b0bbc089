use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::device::constants::{COMMAND_ZERO_ACCELEROMETER, MUSIC_BIKE_SERVICE};
use crate::device::decoder::decode;
use crate::device::queue::{DrainStep, GattOperation, GattTable, OperationQueue, Ticket};
use crate::device::types::{
    CharacteristicId, ConnectionStatus, ErrorReason, GattService, Telemetry,
};

/// Identifies one connection session. Anything tagged with an older generation is stale.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    ServiceDiscovery,
    EnablingNotifications,
    Ready,
    Disconnecting,
}

impl SessionState {
    fn is_live(&self) -> bool {
        *self != SessionState::Disconnecting
    }
}

/// Something the transport (or a timer) reported back.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectResult { generation: Generation, address: String, result: Result<(), String> },
    Discovered { generation: Generation, result: Result<Vec<GattService>, String> },
    OperationComplete { generation: Generation, ticket: Ticket, result: Result<(), String> },
    DisconnectComplete { generation: Generation },
    ConnectTimedOut { generation: Generation },
    LinkDown { address: String },
    LinkError { address: String, reason: String },
    Notification { address: String, uuid: Uuid, value: Vec<u8> },
}

/// What the driver has to do as a result of an input.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Status(ConnectionStatus),
    Connect { generation: Generation, address: String },
    Discover { generation: Generation, address: String },
    Run { generation: Generation, address: String, ticket: Ticket, operation: GattOperation },
    Disconnect { generation: Generation, address: String },
    StartConnectTimer { generation: Generation },
    Publish(Telemetry),
}

struct Session {
    generation: Generation,
    address: String,
    state: SessionState,
    queue: OperationQueue,
    // filled in by service discovery
    gatt: Option<GattTable>,
    linked: bool,
}

/// Lifecycle of the single connection: connect, discover, enable notifications one at a time,
/// then decode telemetry. Pure: inputs go in, actions come out, no I/O happens here.
pub struct ConnectionStateMachine {
    session: Option<Session>,
    next_generation: Generation,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        ConnectionStateMachine { session: None, next_generation: 1 }
    }

    pub fn state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|session| session.state)
    }

    pub fn address(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.address.as_str())
    }

    pub fn generation(&self) -> Option<Generation> {
        self.session.as_ref().map(|session| session.generation)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == Some(SessionState::Ready)
    }

    /// The status that describes the current session, `None` without one.
    pub fn status(&self) -> Option<ConnectionStatus> {
        let session = self.session.as_ref()?;
        Some(match session.state {
            SessionState::Connecting => ConnectionStatus::Connecting(session.address.clone()),
            SessionState::ServiceDiscovery => ConnectionStatus::Discovering,
            SessionState::EnablingNotifications => ConnectionStatus::EnablingNotifications,
            SessionState::Ready => ConnectionStatus::Ready,
            SessionState::Disconnecting => ConnectionStatus::Disconnecting,
        })
    }

    /// No GATT operation is queued or in flight.
    pub fn is_settled(&self) -> bool {
        self.session.as_ref().map(|session| session.queue.is_idle()).unwrap_or(true)
    }

    /// Starts a session to `address`. Returns `None` (and does nothing) when a session to the same
    /// address is already connecting or connected. A session to another address is torn down first.
    pub fn connect(&mut self, address: &str) -> Option<Vec<Action>> {
        let mut actions = Vec::new();

        if let Some(session) = &self.session {
            if session.address == address && session.state.is_live() {
                info!("Already {:?} with {}; ignoring connect", session.state, address);
                return None;
            }
        }

        if let Some(previous) = self.session.take() {
            info!("Tearing down session with {} before connecting to {}", previous.address, address);
            actions.push(Action::Disconnect { generation: previous.generation, address: previous.address });
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        info!("Connecting to {} (session {})", address, generation);
        self.session = Some(Session {
            generation,
            address: address.to_string(),
            state: SessionState::Connecting,
            queue: OperationQueue::new(),
            gatt: None,
            linked: false,
        });

        actions.push(Action::Status(ConnectionStatus::Connecting(address.to_string())));
        actions.push(Action::Connect { generation, address: address.to_string() });
        actions.push(Action::StartConnectTimer { generation });
        Some(actions)
    }

    /// Always safe to call. Without a session this settles on `Disconnected`.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let session = match &mut self.session {
            None => return vec![Action::Status(ConnectionStatus::Disconnected)],
            Some(session) => session,
        };

        if session.state == SessionState::Disconnecting {
            debug!("Already disconnecting from {}", session.address);
            return vec![];
        }

        info!("Disconnecting from {}", session.address);
        session.state = SessionState::Disconnecting;
        // completions for anything still in flight are stale from here on
        session.queue.clear();

        vec![
            Action::Status(ConnectionStatus::Disconnecting),
            Action::Disconnect { generation: session.generation, address: session.address.clone() },
        ]
    }

    /// Queues a write of the zero command. Only possible when `Ready` and the peripheral exposes
    /// a writable accelerometer zero characteristic.
    pub fn zero_accelerometer(&mut self) -> Option<Vec<Action>> {
        let session = self.session.as_mut()?;

        if session.state != SessionState::Ready {
            warn!("Can not zero accelerometer while {:?}", session.state);
            return None;
        }

        let writable = session.gatt.as_ref()
            .and_then(|gatt| gatt.get(&CharacteristicId::AccelerometerZero))
            .map(|props| props.write || props.write_without_response)
            .unwrap_or(false);

        if !writable {
            warn!("Accelerometer zero characteristic is not available");
            return None;
        }

        session.queue.enqueue(GattOperation::Write {
            id: CharacteristicId::AccelerometerZero,
            value: COMMAND_ZERO_ACCELEROMETER.to_vec(),
        });

        let mut actions = Vec::new();
        self.drain(&mut actions);
        Some(actions)
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        let mut actions = Vec::new();

        match event {
            SessionEvent::ConnectResult { generation, address, result } => {
                if !self.is_current(generation, SessionState::Connecting) {
                    // the attempt was abandoned but the link came up anyway: nobody owns it
                    let owned = matches!(&self.session, Some(session) if session.address == address);
                    if result.is_ok() && !owned {
                        info!("Releasing link to {} from abandoned session {}", address, generation);
                        actions.push(Action::Disconnect { generation, address });
                    } else {
                        debug!("Ignoring stale connect result for session {}", generation);
                    }
                    return actions;
                }

                match result {
                    Ok(_) => {
                        let session = self.session.as_mut().expect("checked by is_current");
                        info!("Connected to {}; discovering services", session.address);
                        session.linked = true;
                        session.state = SessionState::ServiceDiscovery;
                        actions.push(Action::Status(ConnectionStatus::Discovering));
                        actions.push(Action::Discover { generation, address: session.address.clone() });
                    },
                    Err(reason) => self.fail(ErrorReason::Transport(reason), &mut actions),
                }
            },
            SessionEvent::Discovered { generation, result } => {
                if !self.is_current(generation, SessionState::ServiceDiscovery) {
                    debug!("Ignoring stale discovery result for session {}", generation);
                    return actions;
                }

                match result {
                    Ok(services) => self.on_discovered(services, &mut actions),
                    Err(reason) => {
                        warn!("Service discovery failed: {}", reason);
                        self.fail(ErrorReason::ServiceNotFound, &mut actions);
                    },
                }
            },
            SessionEvent::OperationComplete { generation, ticket, result } => {
                let accepted = match &mut self.session {
                    Some(session) if session.generation == generation && session.state.is_live() => {
                        session.queue.complete(ticket, &result)
                    },
                    _ => false,
                };

                if accepted {
                    self.drain(&mut actions);
                } else {
                    debug!("Ignoring completion from session {} ({:?})", generation, result);
                }
            },
            SessionEvent::DisconnectComplete { generation } => {
                if self.is_current(generation, SessionState::Disconnecting) {
                    info!("Disconnected");
                    self.session = None;
                    actions.push(Action::Status(ConnectionStatus::Disconnected));
                }
            },
            SessionEvent::ConnectTimedOut { generation } => {
                if self.is_current(generation, SessionState::Connecting) {
                    self.fail(ErrorReason::ConnectTimeout, &mut actions);
                }
            },
            SessionEvent::LinkDown { address } => {
                // before the link is up a link down can only belong to an earlier session
                let ours = matches!(&self.session, Some(session) if session.address == address && session.state != SessionState::Connecting);
                if !ours {
                    debug!("Ignoring link down for {}", address);
                    return actions;
                }

                if let Some(session) = self.session.take() {
                    actions.push(Action::Status(ConnectionStatus::Disconnected));

                    if session.state == SessionState::Disconnecting {
                        info!("Link to {} closed", address);
                    } else {
                        // no reconnect: retrying is up to the caller
                        warn!("Link to {} lost while {:?}", address, session.state);
                        actions.push(Action::Disconnect { generation: session.generation, address: session.address });
                    }
                }
            },
            SessionEvent::LinkError { address, reason } => {
                match &self.session {
                    Some(session) if session.address == address && session.state.is_live() => {
                        self.fail(ErrorReason::Transport(reason), &mut actions);
                    },
                    _ => debug!("Ignoring link error for {}: {}", address, reason),
                }
            },
            SessionEvent::Notification { address, uuid, value } => {
                self.on_notification(&address, &uuid, &value, &mut actions);
            },
        }

        actions
    }

    fn is_current(&self, generation: Generation, state: SessionState) -> bool {
        matches!(&self.session, Some(session) if session.generation == generation && session.state == state)
    }

    fn on_discovered(&mut self, services: Vec<GattService>, actions: &mut Vec<Action>) {
        let service = match services.into_iter().find(|service| service.uuid == MUSIC_BIKE_SERVICE) {
            Some(service) => service,
            None => {
                self.fail(ErrorReason::ServiceNotFound, actions);
                return;
            },
        };

        let session = self.session.as_mut().expect("session checked by caller");
        let gatt: GattTable = service.characteristics.iter()
            .filter_map(|characteristic| {
                CharacteristicId::from_uuid(&characteristic.uuid).map(|id| (id, characteristic.properties))
            })
            .collect();

        for id in CharacteristicId::all() {
            if !gatt.contains_key(&id) {
                debug!("{} characteristic not present; skipping", id);
            } else if id.is_notify() {
                session.queue.enqueue(GattOperation::EnableNotifications(id));
            }
        }

        info!("Found {} of {} characteristics; enabling {} notifications", gatt.len(), CharacteristicId::all().len(), session.queue.pending());
        session.gatt = Some(gatt);
        session.state = SessionState::EnablingNotifications;
        actions.push(Action::Status(ConnectionStatus::EnablingNotifications));

        self.drain(actions);
    }

    fn drain(&mut self, actions: &mut Vec<Action>) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };

        let link = if session.linked { session.gatt.as_ref() } else { None };
        match session.queue.drain(link) {
            DrainStep::Busy => {},
            DrainStep::Issue(ticket, operation) => {
                actions.push(Action::Run {
                    generation: session.generation,
                    address: session.address.clone(),
                    ticket,
                    operation,
                });
            },
            DrainStep::Empty { first } => {
                if first && session.state == SessionState::EnablingNotifications {
                    info!("Notifications enabled; {} ready", session.address);
                    session.state = SessionState::Ready;
                    actions.push(Action::Status(ConnectionStatus::Ready));
                }
            },
            DrainStep::Aborted => {
                self.fail(ErrorReason::Internal("no GATT link".to_string()), actions);
            },
        }
    }

    fn on_notification(&mut self, address: &str, uuid: &Uuid, value: &[u8], actions: &mut Vec<Action>) {
        let session = match &self.session {
            Some(session) if session.address == address => session,
            _ => return,
        };

        if session.state != SessionState::Ready {
            debug!("Dropping notification from {} while {:?}", uuid, session.state);
            return;
        }

        let id = match CharacteristicId::from_uuid(uuid) {
            Some(id) => id,
            None => {
                debug!("Notification from unknown characteristic {}", uuid);
                return;
            },
        };

        match decode(id, value) {
            Ok(Telemetry::IgnoredEvent(code)) => debug!("Ignoring event code {}", code),
            Ok(telemetry) => actions.push(Action::Publish(telemetry)),
            Err(err) => warn!("Dropping frame: {}", err),
        }
    }

    fn fail(&mut self, reason: ErrorReason, actions: &mut Vec<Action>) {
        if let Some(session) = self.session.take() {
            error!("Session with {} failed while {:?}: {}", session.address, session.state, reason);
            actions.push(Action::Status(ConnectionStatus::Error(reason)));
            actions.push(Action::Disconnect { generation: session.generation, address: session.address });
        }
    }

    #[cfg(test)]
    fn link_available(&self) -> bool {
        self.session.as_ref().map(|session| session.linked && session.gatt.is_some()).unwrap_or(false)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
