use crate::device::constants::{EVENT_CODE_DROP, EVENT_CODE_JUMP};
use crate::device::types::{CharacteristicId, MotionEvent, Telemetry};
use crate::error::DecodeError;

const F32_LEN: usize = 4;

fn decode_f32(id: CharacteristicId, bytes: &[u8]) -> Result<f32, DecodeError> {
    let raw: [u8; F32_LEN] = bytes.try_into()
        .map_err(|_| DecodeError::WrongLength { id, expected: F32_LEN, actual: bytes.len() })?;

    Ok(f32::from_le_bytes(raw))
}

fn decode_code(id: CharacteristicId, bytes: &[u8]) -> Result<u8, DecodeError> {
    // extra bytes are tolerated, only the first one carries the code
    bytes.first().copied().ok_or(DecodeError::Empty { id })
}

/// Maps an event code to an event. Only the explicit JUMP/DROP codes produce one; every
/// other code (including 0) means "no new event".
pub fn event_from_code(code: u8) -> Option<MotionEvent> {
    match code {
        EVENT_CODE_JUMP => Some(MotionEvent::Jump),
        EVENT_CODE_DROP => Some(MotionEvent::Drop),
        _ => None,
    }
}

/// Decodes a notification payload received on `id`.
pub fn decode(id: CharacteristicId, bytes: &[u8]) -> Result<Telemetry, DecodeError> {
    match id {
        CharacteristicId::Speed => decode_f32(id, bytes).map(Telemetry::Speed),
        CharacteristicId::Pitch => decode_f32(id, bytes).map(Telemetry::Pitch),
        CharacteristicId::Roll => decode_f32(id, bytes).map(Telemetry::Roll),
        CharacteristicId::Yaw => decode_f32(id, bytes).map(Telemetry::Yaw),
        CharacteristicId::GForce => decode_f32(id, bytes).map(Telemetry::GForce),
        CharacteristicId::Event => {
            let code = decode_code(id, bytes)?;
            Ok(match event_from_code(code) {
                Some(event) => Telemetry::Event(event),
                None => Telemetry::IgnoredEvent(code),
            })
        },
        CharacteristicId::ImuDirection => decode_code(id, bytes).map(Telemetry::ImuDirection),
        CharacteristicId::HallDirection => decode_code(id, bytes).map(Telemetry::HallDirection),
        CharacteristicId::ImuSpeedState => decode_code(id, bytes).map(Telemetry::ImuSpeedState),
        CharacteristicId::AccelerometerZero => Err(DecodeError::NotNotifiable { id }),
    }
}
