use std::collections::{BTreeMap, VecDeque};
use log::{debug, info, warn};

use crate::device::types::{CharProps, CharacteristicId};

/// Characteristics found on the connected peripheral, keyed by channel.
pub type GattTable = BTreeMap<CharacteristicId, CharProps>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOperation {
    /// Enable local delivery, then write the CCCD and wait for the write to complete.
    EnableNotifications(CharacteristicId),
    Write { id: CharacteristicId, value: Vec<u8> },
}

impl GattOperation {
    pub fn characteristic(&self) -> CharacteristicId {
        match self {
            GattOperation::EnableNotifications(id) => *id,
            GattOperation::Write { id, .. } => *id,
        }
    }
}

/// Identifies the one operation that is in flight. Completions carrying any other ticket are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStep {
    /// An operation is already outstanding; nothing to do until it completes.
    Busy,
    /// Issue this operation and report back with `complete(ticket, ..)`.
    Issue(Ticket, GattOperation),
    /// Nothing left to do. `first` is set only the first time the queue runs dry.
    Empty { first: bool },
    /// There is no GATT link; everything pending was discarded.
    Aborted,
}

/// Serializes GATT operations on one connection: strictly FIFO, at most one in flight.
#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<GattOperation>,
    in_flight: Option<(Ticket, GattOperation)>,
    next_ticket: u64,
    drained_once: bool,
    completions: usize,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, operation: GattOperation) {
        debug!("Queueing {:?} ({} pending)", operation, self.pending.len());
        self.pending.push_back(operation);
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of completions accepted since the queue was created.
    pub fn completions(&self) -> usize {
        self.completions
    }

    /// Drops everything, including the in-flight marker. A completion arriving later is ignored.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }

    /// Advances the queue. Re-entering while an operation is outstanding is a no-op.
    pub fn drain(&mut self, link: Option<&GattTable>) -> DrainStep {
        let table = match link {
            Some(table) => table,
            None => {
                warn!("No GATT link while draining; dropping {} queued operations", self.pending.len());
                self.clear();
                return DrainStep::Aborted;
            },
        };

        if self.in_flight.is_some() {
            return DrainStep::Busy;
        }

        while let Some(operation) = self.pending.pop_front() {
            let id = operation.characteristic();
            let props = table.get(&id).copied().unwrap_or_default();

            let usable = match &operation {
                GattOperation::EnableNotifications(_) => props.notify,
                GattOperation::Write { .. } => props.write || props.write_without_response,
            };

            if !usable {
                // not an error: the peripheral just doesn't offer this channel the way we need it
                info!("Skipping {:?}: characteristic does not support it ({:?})", operation, props);
                continue;
            }

            let ticket = Ticket(self.next_ticket);
            self.next_ticket += 1;
            self.in_flight = Some((ticket, operation.clone()));
            return DrainStep::Issue(ticket, operation);
        }

        let first = !self.drained_once;
        self.drained_once = true;
        DrainStep::Empty { first }
    }

    /// Clears the in-flight marker if `ticket` is the outstanding operation. Returns false for stale tickets.
    pub fn complete(&mut self, ticket: Ticket, result: &Result<(), String>) -> bool {
        match &self.in_flight {
            Some((current, operation)) if *current == ticket => {
                match result {
                    Ok(_) => debug!("{:?} completed", operation),
                    Err(err) => warn!("{:?} failed: {}", operation, err),
                }
                self.in_flight = None;
                self.completions += 1;
                true
            },
            _ => {
                debug!("Ignoring completion for stale ticket {:?}", ticket);
                false
            },
        }
    }
}
