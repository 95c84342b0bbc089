use uuid::Uuid;

/**
 * How long (milliseconds) a scan runs before it stops by itself.
 */
pub const SCAN_PERIOD: u64 = 10_000;

/**
 * How long (milliseconds) a JUMP/DROP event stays published before it reverts to NONE.
 */
pub const EVENT_HOLD: u64 = 3_000;

/**
 * How long (milliseconds) a link-layer connect may take before the session is failed.
 */
pub const CONNECT_DEADLINE: u64 = 15_000;

/**
 * The UUID of the Bluetooth BLE service advertised by the Music Bike sensor.
 */
pub const MUSIC_BIKE_SERVICE: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc1);

// Telemetry and command characteristics, all exposed by MUSIC_BIKE_SERVICE.
pub const SPEED_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc2);
pub const PITCH_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc3);
pub const ROLL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc4);
pub const YAW_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc5);
pub const G_FORCE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc6);
pub const EVENT_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc7);
pub const IMU_DIRECTION_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc8);
pub const HALL_DIRECTION_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dc9);
pub const IMU_SPEED_STATE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dca);
pub const ACCELEROMETER_ZERO_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0fb899fa_2b3a_4e11_911d_4fa05d130dcb);

/**
 * The standard Client Characteristic Configuration Descriptor.
 */
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/**
 * Written to the accelerometer zero characteristic; the firmware accepts any non-zero byte.
 */
pub const COMMAND_ZERO_ACCELEROMETER: [u8; 1] = [0x01];

pub const EVENT_CODE_JUMP: u8 = 1;
pub const EVENT_CODE_DROP: u8 = 2;

/**
 * Shown instead of a device name when the peripheral did not advertise one.
 */
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/**
 * Shown instead of a device name when the host withholds the connect capability.
 */
pub const NAME_REQUIRES_CONNECT: &str = "Name requires Connect permission";
