use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::{Capability, GattService};
use crate::error::DeviceError;

/// Everything the radio reports without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Advertisement { address: String, name: Option<String>, services: Vec<Uuid> },
    Notification { address: String, uuid: Uuid, value: Vec<u8> },
    LinkDown { address: String },
    /// The link reported a non-success status; the session can not continue.
    LinkError { address: String, reason: String },
    /// The adapter itself failed (scan aborted, radio switched off, ...).
    AdapterError { reason: String },
}

/// The radio as seen by the driver. Implementations must allow concurrent calls, but the
/// driver never has more than one GATT operation outstanding per connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Unsolicited events. Called once, when the driver starts.
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>, DeviceError>;

    async fn start_scan(&self, service: Uuid) -> Result<(), DeviceError>;

    async fn stop_scan(&self) -> Result<(), DeviceError>;

    async fn connect(&self, address: &str) -> Result<(), DeviceError>;

    async fn discover_services(&self, address: &str) -> Result<Vec<GattService>, DeviceError>;

    /// Starts delivering notifications of `characteristic` to `events()`.
    async fn enable_local_notifications(&self, address: &str, characteristic: Uuid) -> Result<(), DeviceError>;

    /// Writes a descriptor of `characteristic` and waits for the peripheral to acknowledge.
    async fn write_descriptor(&self, address: &str, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<(), DeviceError>;

    async fn write(&self, address: &str, characteristic: Uuid, value: &[u8]) -> Result<(), DeviceError>;

    async fn disconnect(&self, address: &str) -> Result<(), DeviceError>;
}

/// Host supplied permission/radio checks, consulted before scan, connect and write requests.
pub trait CapabilityCheck: Send + Sync + 'static {
    fn has(&self, capability: Capability) -> bool;
}

/// For hosts without a permission model (desktop).
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn has(&self, _capability: Capability) -> bool {
        true
    }
}

impl<F> CapabilityCheck for F
where
    F: Fn(Capability) -> bool + Send + Sync + 'static,
{
    fn has(&self, capability: Capability) -> bool {
        self(capability)
    }
}
