//! Device identity and descriptor types

use serde::{Deserialize, Serialize};

/// Identity of a tracking device: the sensor interface unit it is plugged
/// into plus the port on that unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// UUID of the sensor interface unit (SIU)
    pub siu_uuid: u32,

    /// Port on the SIU where the device is attached
    pub port_id: u32,
}

impl DeviceId {
    /// Create a device identity from its SIU and port.
    pub fn new(siu_uuid: u32, port_id: u32) -> Self {
        Self { siu_uuid, port_id }
    }

    /// Compact 64-bit key used for internal map indexing.
    ///
    /// The full 32-bit SIU UUID occupies the high word and the port id the
    /// low word, so distinct devices never collide. Managers and the device
    /// inventory must all index by this key.
    pub fn key(self) -> u64 {
        (self.siu_uuid as u64) << 32 | self.port_id as u64
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.siu_uuid, self.port_id)
    }
}

/// Sensor-fusion mode a device can run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FusionMode {
    #[default]
    Default,
    NoFusion,
    MagOnly,
    ImuOnly,
    Full,
}

/// Static description of one sensor unit inside a device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorUnitDescriptor {
    pub timestamp_offset: Vector3i,
    pub mag_present: bool,
    pub mag_scale: f32,
    pub imu_present: bool,
    pub accel_scale: f32,
    pub gyro_scale: f32,
    pub uuid: u64,
}

/// Static description of a tracking device as reported by the service.
///
/// Descriptors are copied on delivery; the core never shares a descriptor
/// instance across manager boundaries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub siu_uuid: u32,
    pub port_id: u32,
    pub user_device_type: u32,
    pub button_count: u32,
    /// Per-sensor-unit descriptors, ordered by unit position
    pub sensor_units: Vec<SensorUnitDescriptor>,
    pub supported_fusion_modes: Vec<FusionMode>,
    pub device_part_number: u32,
    pub secure_device_info: bool,
}

impl DeviceDescriptor {
    /// The device identity carried by this descriptor.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.siu_uuid, self.port_id)
    }
}

/// Connect/disconnect notification for one tracking device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub connected: bool,
    pub device: DeviceDescriptor,
}

/// State of the service-side reference-device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferenceDeviceState {
    pub enabled: bool,
    pub siu_uuid: u32,
    pub port_num: u32,
}

/// Integer triple used for raw sensor readings and timestamp offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vector3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Float triple used for positions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Quaternion in w-x-y-z order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector4f {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_is_collision_free_across_fields() {
        // (1, 2) and (2, 1) collide under narrow mixes; the wide key keeps
        // the full uuid in the high word.
        let a = DeviceId::new(1, 2).key();
        let b = DeviceId::new(2, 1).key();
        assert_ne!(a, b);

        let c = DeviceId::new(0x0000_0100, 0).key();
        let d = DeviceId::new(1, 0).key();
        assert_ne!(c, d);
    }

    #[test]
    fn device_key_round_trips_identity() {
        let id = DeviceId::new(0xDEAD_BEEF, 7);
        let key = id.key();
        assert_eq!((key >> 32) as u32, id.siu_uuid);
        assert_eq!(key as u32, id.port_id);
    }
}
