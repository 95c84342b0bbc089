use std::sync::{Arc, Mutex};
use log::debug;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::device::signals::TelemetrySignal;
use crate::device::types::MotionEvent;

/// The event channel's derived state: the last event and when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPulse {
    pub value: MotionEvent,
    pub deadline: Option<Instant>,
}

impl EventPulse {
    fn idle() -> Self {
        EventPulse { value: MotionEvent::None, deadline: None }
    }

    pub fn value_at(&self, now: Instant) -> MotionEvent {
        match self.deadline {
            Some(deadline) if now < deadline => self.value,
            _ => MotionEvent::None,
        }
    }
}

struct PulseState {
    pulse: EventPulse,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Turns JUMP/DROP events into a pulse that reverts to NONE after `hold`.
/// A newer event restarts the window (last write wins).
pub struct EventDebouncer {
    hold: Duration,
    signal: TelemetrySignal<MotionEvent>,
    runtime: Handle,
    state: Arc<Mutex<PulseState>>,
}

impl EventDebouncer {
    pub fn new(hold: Duration, signal: TelemetrySignal<MotionEvent>, runtime: Handle) -> Self {
        EventDebouncer {
            hold,
            signal,
            runtime,
            state: Arc::new(Mutex::new(PulseState { pulse: EventPulse::idle(), generation: 0, timer: None })),
        }
    }

    pub fn on_event(&self, value: MotionEvent) {
        if value.is_idle() {
            return;
        }

        let mut state = self.state.lock().expect("Failed to lock EventDebouncer state");
        let deadline = Instant::now() + self.hold;
        state.generation += 1;
        state.pulse = EventPulse { value, deadline: Some(deadline) };
        self.signal.publish(value);
        debug!("Event {} published, holding until {:?}", value, deadline);

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let shared = self.state.clone();
        let signal = self.signal.clone();
        state.timer = Some(self.runtime.spawn(async move {
            sleep_until(deadline).await;

            let mut state = shared.lock().expect("Failed to lock EventDebouncer state");
            if state.generation == generation {
                state.pulse = EventPulse::idle();
                state.timer = None;
                signal.publish(MotionEvent::None);
                debug!("Event window elapsed");
            }
        }));
    }

    pub fn current_value(&self) -> MotionEvent {
        let state = self.state.lock().expect("Failed to lock EventDebouncer state");
        state.pulse.value_at(Instant::now())
    }

    pub fn pulse(&self) -> EventPulse {
        self.state.lock().expect("Failed to lock EventDebouncer state").pulse
    }
}

impl Drop for EventDebouncer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn debouncer() -> (EventDebouncer, TelemetrySignal<MotionEvent>) {
        let signal = TelemetrySignal::new(MotionEvent::None);
        let debouncer = EventDebouncer::new(Duration::from_millis(3000), signal.clone(), Handle::current());
        (debouncer, signal)
    }

    #[tokio::test(start_paused = true)]
    async fn reverts_to_none_after_window() {
        let (debouncer, signal) = debouncer();

        debouncer.on_event(MotionEvent::Jump);
        assert_eq!(debouncer.current_value(), MotionEvent::Jump);
        assert_eq!(signal.value(), MotionEvent::Jump);

        sleep(Duration::from_millis(3100)).await;
        assert_eq!(debouncer.current_value(), MotionEvent::None);
        assert_eq!(signal.value(), MotionEvent::None);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_event_restarts_window() {
        let (debouncer, signal) = debouncer();

        debouncer.on_event(MotionEvent::Jump);
        sleep(Duration::from_millis(2900)).await;
        debouncer.on_event(MotionEvent::Drop);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(debouncer.current_value(), MotionEvent::Drop);
        assert_eq!(signal.value(), MotionEvent::Drop);

        sleep(Duration::from_millis(2950)).await;
        assert_eq!(debouncer.current_value(), MotionEvent::None);
        assert_eq!(signal.value(), MotionEvent::None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_value_is_not_an_event() {
        let (debouncer, signal) = debouncer();

        debouncer.on_event(MotionEvent::None);
        assert_eq!(signal.latest().at, None);
        assert_eq!(debouncer.pulse().deadline, None);
    }
}
