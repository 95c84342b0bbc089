use std::fmt;
use enum_iterator::{all, Sequence};
use uuid::Uuid;

use crate::device::constants::{
    ACCELEROMETER_ZERO_CHARACTERISTIC, EVENT_CHARACTERISTIC, G_FORCE_CHARACTERISTIC,
    HALL_DIRECTION_CHARACTERISTIC, IMU_DIRECTION_CHARACTERISTIC, IMU_SPEED_STATE_CHARACTERISTIC,
    PITCH_CHARACTERISTIC, ROLL_CHARACTERISTIC, SPEED_CHARACTERISTIC, YAW_CHARACTERISTIC,
};

/// A peripheral seen during a scan. `address` is the stable key; `name` is whatever was
/// last advertised, or one of the sentinel names from `constants`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Sequence)]
pub enum CharacteristicId {
    Speed,
    Pitch,
    Roll,
    Yaw,
    GForce,
    Event,
    ImuDirection,
    HallDirection,
    ImuSpeedState,
    AccelerometerZero,
}

/// How the payload of a characteristic is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// 4 byte IEEE-754 single precision float, little-endian
    F32Le,
    /// first byte is an unsigned code
    Code,
    /// write-only command byte
    Command,
}

impl CharacteristicId {
    pub fn all() -> Vec<CharacteristicId> {
        all::<CharacteristicId>().collect::<Vec<_>>()
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            CharacteristicId::Speed => SPEED_CHARACTERISTIC,
            CharacteristicId::Pitch => PITCH_CHARACTERISTIC,
            CharacteristicId::Roll => ROLL_CHARACTERISTIC,
            CharacteristicId::Yaw => YAW_CHARACTERISTIC,
            CharacteristicId::GForce => G_FORCE_CHARACTERISTIC,
            CharacteristicId::Event => EVENT_CHARACTERISTIC,
            CharacteristicId::ImuDirection => IMU_DIRECTION_CHARACTERISTIC,
            CharacteristicId::HallDirection => HALL_DIRECTION_CHARACTERISTIC,
            CharacteristicId::ImuSpeedState => IMU_SPEED_STATE_CHARACTERISTIC,
            CharacteristicId::AccelerometerZero => ACCELEROMETER_ZERO_CHARACTERISTIC,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<CharacteristicId> {
        all::<CharacteristicId>().find(|id| id.uuid() == *uuid)
    }

    pub fn wire_format(&self) -> WireFormat {
        match self {
            CharacteristicId::Speed
            | CharacteristicId::Pitch
            | CharacteristicId::Roll
            | CharacteristicId::Yaw
            | CharacteristicId::GForce => WireFormat::F32Le,
            CharacteristicId::Event
            | CharacteristicId::ImuDirection
            | CharacteristicId::HallDirection
            | CharacteristicId::ImuSpeedState => WireFormat::Code,
            CharacteristicId::AccelerometerZero => WireFormat::Command,
        }
    }

    /// Whether this channel is pushed by the peripheral (as opposed to written by us).
    pub fn is_notify(&self) -> bool {
        self.wire_format() != WireFormat::Command
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            CharacteristicId::Speed => "Speed",
            CharacteristicId::Pitch => "Pitch",
            CharacteristicId::Roll => "Roll",
            CharacteristicId::Yaw => "Yaw",
            CharacteristicId::GForce => "G-Force",
            CharacteristicId::Event => "Event",
            CharacteristicId::ImuDirection => "IMU Direction",
            CharacteristicId::HallDirection => "Hall Direction",
            CharacteristicId::ImuSpeedState => "IMU Speed State",
            CharacteristicId::AccelerometerZero => "Accelerometer Zero",
        };

        write!(f, "{}", result)
    }
}

/// Characteristic properties as reported by service discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps {
    pub notify: bool,
    pub write: bool,
    pub write_without_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharProps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionEvent {
    Jump,
    Drop,
    #[default]
    None,
}

impl MotionEvent {
    pub fn is_idle(&self) -> bool {
        *self == MotionEvent::None
    }
}

impl fmt::Display for MotionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            MotionEvent::Jump => "JUMP",
            MotionEvent::Drop => "DROP",
            MotionEvent::None => "NONE",
        };

        write!(f, "{}", result)
    }
}

/// A decoded notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Telemetry {
    Speed(f32),
    Pitch(f32),
    Roll(f32),
    Yaw(f32),
    GForce(f32),
    /// An event code that maps to JUMP or DROP. Other codes never produce this variant.
    Event(MotionEvent),
    /// An event code other than JUMP/DROP; carries the raw code and is not published.
    IgnoredEvent(u8),
    ImuDirection(u8),
    HallDirection(u8),
    ImuSpeedState(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Sequence)]
pub enum Capability {
    Scan,
    Connect,
    RadioEnabled,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            Capability::Scan => "scan permission",
            Capability::Connect => "connect permission",
            Capability::RadioEnabled => "bluetooth enabled",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    ScanFailed(String),
    CapabilityMissing(Capability),
    ServiceNotFound,
    Transport(String),
    ConnectTimeout,
    Internal(String),
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::ScanFailed(reason) => write!(f, "Scan failed ({})", reason),
            ErrorReason::CapabilityMissing(capability) => write!(f, "Missing {}", capability),
            ErrorReason::ServiceNotFound => write!(f, "Service not found"),
            ErrorReason::Transport(reason) => write!(f, "Bluetooth error ({})", reason),
            ErrorReason::ConnectTimeout => write!(f, "Connection timed out"),
            ErrorReason::Internal(reason) => write!(f, "Internal error ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Scanning,
    Connecting(String),
    Discovering,
    EnablingNotifications,
    Ready,
    Disconnecting,
    Disconnected,
    Error(ErrorReason),
}

// The user visible notification text
impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Idle => write!(f, "Idle"),
            ConnectionStatus::Scanning => write!(f, "Scanning for Music Bike..."),
            ConnectionStatus::Connecting(address) => write!(f, "Connecting to {}...", address),
            ConnectionStatus::Discovering => write!(f, "Discovering services..."),
            ConnectionStatus::EnablingNotifications => write!(f, "Enabling notifications..."),
            ConnectionStatus::Ready => write!(f, "Connected"),
            ConnectionStatus::Disconnecting => write!(f, "Disconnecting..."),
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}
