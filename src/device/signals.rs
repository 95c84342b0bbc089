use std::sync::Arc;
use std::time::SystemTime;
use log::trace;
use tokio::sync::watch;

use crate::device::types::{MotionEvent, Telemetry};

/// A published value and when it was published. `at` is `None` until the first publish.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<T> {
    pub value: T,
    pub at: Option<SystemTime>,
}

/// Last-value-wins feed for one telemetry field. Publishing never blocks and never queues.
pub struct TelemetrySignal<T> {
    sender: Arc<watch::Sender<Sample<T>>>,
}

impl<T> Clone for TelemetrySignal<T> {
    fn clone(&self) -> Self {
        TelemetrySignal { sender: self.sender.clone() }
    }
}

impl<T: Clone + Send + Sync + 'static> TelemetrySignal<T> {
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(Sample { value: initial, at: None });
        TelemetrySignal { sender: Arc::new(sender) }
    }

    pub(crate) fn publish(&self, value: T) {
        self.sender.send_replace(Sample { value, at: Some(SystemTime::now()) });
    }

    pub fn subscribe(&self) -> watch::Receiver<Sample<T>> {
        self.sender.subscribe()
    }

    pub fn latest(&self) -> Sample<T> {
        self.sender.borrow().clone()
    }

    pub fn value(&self) -> T {
        self.sender.borrow().value.clone()
    }
}

/// All telemetry fields the driver publishes. Read-only for everyone outside the driver.
#[derive(Clone)]
pub struct Signals {
    pub speed: TelemetrySignal<f32>,
    pub pitch: TelemetrySignal<f32>,
    pub roll: TelemetrySignal<f32>,
    pub yaw: TelemetrySignal<f32>,
    pub g_force: TelemetrySignal<f32>,
    pub last_event: TelemetrySignal<MotionEvent>,
    pub imu_direction: TelemetrySignal<u8>,
    pub hall_direction: TelemetrySignal<u8>,
    pub imu_speed_state: TelemetrySignal<u8>,
}

impl Signals {
    pub fn new() -> Self {
        Signals {
            speed: TelemetrySignal::new(0.0),
            pitch: TelemetrySignal::new(0.0),
            roll: TelemetrySignal::new(0.0),
            yaw: TelemetrySignal::new(0.0),
            g_force: TelemetrySignal::new(0.0),
            last_event: TelemetrySignal::new(MotionEvent::None),
            imu_direction: TelemetrySignal::new(0),
            hall_direction: TelemetrySignal::new(0),
            imu_speed_state: TelemetrySignal::new(0),
        }
    }

    /// Publishes a decoded value. Events are not handled here, they go through the debouncer.
    pub(crate) fn apply(&self, telemetry: Telemetry) {
        trace!("Publishing {:?}", telemetry);

        match telemetry {
            Telemetry::Speed(value) => self.speed.publish(value),
            Telemetry::Pitch(value) => self.pitch.publish(value),
            Telemetry::Roll(value) => self.roll.publish(value),
            Telemetry::Yaw(value) => self.yaw.publish(value),
            Telemetry::GForce(value) => self.g_force.publish(value),
            Telemetry::ImuDirection(value) => self.imu_direction.publish(value),
            Telemetry::HallDirection(value) => self.hall_direction.publish(value),
            Telemetry::ImuSpeedState(value) => self.imu_speed_state.publish(value),
            Telemetry::Event(_) | Telemetry::IgnoredEvent(_) => {},
        }
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}
